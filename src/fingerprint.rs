//! Fingerprints for deduplicating in-flight fetches.
//!
//! A fingerprint is `identity + ":" + canonical(params)`. Canonical text is
//! JSON with object keys sorted at every depth, so two structurally equal
//! params always produce the same fingerprint regardless of map ordering.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::CanonicalizeError;

/// Placeholder used in place of params that could not be canonicalized.
pub const UNSERIALIZABLE_MARKER: &str = "<unserializable>";

/// Serialize `params` into canonical text.
///
/// Absent params (`()`, `None`, or anything serializing to JSON `null` at the
/// top level) canonicalize to the empty mapping `{}`.
///
/// # Example
///
/// ```
/// use query_coord::canonicalize;
/// use serde_json::json;
///
/// let a = canonicalize(&json!({"b": 2, "a": 1})).unwrap();
/// assert_eq!(a, r#"{"a":1,"b":2}"#);
/// assert_eq!(canonicalize(&()).unwrap(), "{}");
/// ```
pub fn canonicalize<P: Serialize + ?Sized>(params: &P) -> Result<String, CanonicalizeError> {
    let value = serde_json::to_value(params)?;
    let mut out = String::new();
    match value {
        Value::Null => out.push_str("{}"),
        other => write_canonical(&other, &mut out)?,
    }
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CanonicalizeError> {
    match value {
        Value::Object(map) => {
            // serde_json may preserve insertion order depending on features
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Deterministic identity of a `(fetcher, params)` pair.
///
/// This is cheap to clone. Equality and hashing only look at the text.
#[derive(Clone)]
pub struct Fingerprint {
    key: Arc<str>,
    degraded: bool,
}

impl Fingerprint {
    /// Compute the fingerprint for a fetcher identity and its params.
    ///
    /// Never fails. Params that cannot be canonicalized are replaced by
    /// [`UNSERIALIZABLE_MARKER`]; such a fingerprint reports
    /// [`is_degraded`](Self::is_degraded) and every unserializable request for
    /// the same identity shares it.
    pub fn new<P: Serialize + ?Sized>(identity: &str, params: &P) -> Self {
        match canonicalize(params) {
            Ok(canonical) => Self::from_parts(identity, &canonical, false),
            Err(err) => {
                warn!(identity, error = %err, "falling back to degraded fingerprint");
                Self::from_parts(identity, UNSERIALIZABLE_MARKER, true)
            }
        }
    }

    fn from_parts(identity: &str, canonical: &str, degraded: bool) -> Self {
        Self {
            key: format!("{}:{}", identity, canonical).into(),
            degraded,
        }
    }

    /// The fingerprint text.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Whether params were replaced by [`UNSERIALIZABLE_MARKER`].
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:?})", self.key)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.key
    }
}
