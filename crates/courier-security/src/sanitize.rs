//! Recursive input sanitization.
//!
//! Rejects any string value containing one of a fixed set of dangerous
//! substrings, case-insensitively, walking nested objects and arrays. The
//! pattern list targets code-injection and markup-injection tokens observed
//! in hostile payloads; values only are inspected, keys are structural.

use serde_json::Value;

use crate::SecurityError;

/// Substrings that disqualify an input value, matched case-insensitively.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "eval(",
    "exec(",
    "__import__",
    "subprocess",
    "os.system(",
    "spawn(",
    "<script",
    "javascript:",
    "data:text/html",
];

/// Reject `input` if any nested string contains a dangerous pattern.
///
/// Returns the first offense found in depth-first order, with the path of
/// the offending value.
pub fn sanitize_input(input: &Value) -> Result<(), SecurityError> {
    walk(input, String::new())
}

fn walk(value: &Value, path: String) -> Result<(), SecurityError> {
    match value {
        Value::String(s) => {
            let lowered = s.to_lowercase();
            for pattern in DANGEROUS_PATTERNS {
                if lowered.contains(pattern) {
                    return Err(SecurityError::DangerousInput {
                        path: if path.is_empty() { "(root)".to_string() } else { path },
                        pattern: (*pattern).to_string(),
                    });
                }
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, nested) in map {
                let nested_path =
                    if path.is_empty() { key.clone() } else { format!("{path}/{key}") };
                walk(nested, nested_path)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, nested) in items.iter().enumerate() {
                let nested_path =
                    if path.is_empty() { i.to_string() } else { format!("{path}/{i}") };
                walk(nested, nested_path)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
