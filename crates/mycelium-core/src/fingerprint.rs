//! Task fingerprinting.
//!
//! A fingerprint is the content address of a task: sha256 over the canonical
//! manifest and the normalized spec, joined by a `\n---\n` separator. The
//! ledger stores fingerprints so a later run can tell whether a completed
//! dependency is still the same task. Any semantic edit to either file flips
//! the fingerprint; formatting-only edits do not.

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("invalid manifest json: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FingerprintError>;

/// Canonicalize a JSON document: keys sorted lexicographically at every
/// level, arrays kept in declared order, no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            // serde_json's Map preserves insertion order; sort keys here.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Normalize spec text: CRLF to LF, right-trim each line. No other mutation,
/// so a trailing newline difference beyond line endings still matters.
pub fn normalize_spec(spec: &str) -> String {
    let unified = spec.replace("\r\n", "\n");
    let mut lines: Vec<&str> = unified.split('\n').map(str::trim_end).collect();
    let ends_with_newline = unified.ends_with('\n');
    if ends_with_newline {
        // split leaves a trailing empty element for the final newline.
        lines.pop();
        let mut joined = lines.join("\n");
        joined.push('\n');
        joined
    } else {
        lines.join("\n")
    }
}

/// Compute the fingerprint of a task from raw file contents.
pub fn fingerprint(manifest_json: &str, spec: &str) -> Result<String> {
    let value: Value = serde_json::from_str(manifest_json)?;
    Ok(fingerprint_value(&value, spec))
}

/// Compute the fingerprint from an already-parsed manifest document.
pub fn fingerprint_value(manifest: &Value, spec: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(manifest).as_bytes());
    hasher.update(b"\n---\n");
    hasher.update(normalize_spec(spec).as_bytes());
    format!("{:x}", hasher.finalize())
}
