//! Deterministic cache keys for (operation, arguments) pairs.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::api::ApiError;

/// Cache key for one operation invoked with one argument value.
///
/// The key embeds the canonical JSON form of the arguments (object keys
/// sorted at every depth, no insignificant whitespace), so deep-equal
/// arguments always share a key and distinct arguments never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    pub fn new(operation: &str, args: &Value) -> Self {
        let mut key = String::with_capacity(operation.len() + 16);
        key.push_str(operation);
        key.push('(');
        write_canonical(&mut key, args);
        key.push(')');
        Self(key.into())
    }

    /// Fingerprint for any serializable argument value.
    ///
    /// Fails only when `args` cannot be represented as JSON (for example a
    /// map with non-string keys); that is a caller error.
    pub fn of<A: Serialize + ?Sized>(operation: &str, args: &A) -> Result<Self, ApiError> {
        let value = serde_json::to_value(args)
            .map_err(|e| ApiError::Validation(format!("Unserializable arguments for {}: {}", operation, e)))?;
        Ok(Self::new(operation, &value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Sort explicitly: `preserve_order` may be enabled by another crate.
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        // Serializing a str cannot fail; keep the function total anyway.
        Err(_) => {
            out.push('"');
            out.push_str(&s.escape_default().to_string());
            out.push('"');
        }
    }
}
