//! User-facing error record.
//!
//! Commands print a single structured error with a stable `code`, a short
//! `title`, the full `message`, and an optional `hint`. Internal errors are
//! per-module `thiserror` enums; this record is the boundary form.

use serde::{Deserialize, Serialize};

/// Structured error rendered at the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserError {
    /// Stable machine-readable code, e.g. `config.invalid`, `run.blocked`.
    pub code: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl UserError {
    pub fn new(
        code: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for UserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error[{}]: {}\n  {}", self.code, self.title, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for UserError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_title_message() {
        let err = UserError::new("run.blocked", "Run blocked", "missing dependencies: 001");
        let rendered = err.to_string();
        assert!(rendered.contains("error[run.blocked]"));
        assert!(rendered.contains("Run blocked"));
        assert!(rendered.contains("missing dependencies: 001"));
        assert!(!rendered.contains("hint:"));
    }

    #[test]
    fn display_includes_hint_when_present() {
        let err = UserError::new("config.invalid", "Invalid config", "unknown key `surprise`")
            .with_hint("remove the key or check the spelling");
        assert!(err.to_string().contains("hint: remove the key"));
    }

    #[test]
    fn serializes_without_empty_hint() {
        let err = UserError::new("a", "b", "c");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("hint").is_none());
    }
}
