//! Error kinds surfaced to the user
//!
//! Each subsystem has its own thiserror enum; this module classifies them
//! into the stable kinds the CLI reports (and tests assert on), and renders
//! the JSON error envelope for `--json` / `--min` output.

use thiserror::Error;

/// Stable error classification attached to surfaced errors.
///
/// The kind drives exit behavior and the hint text; the message itself is
/// human-readable and only machine-parsed through the JSON envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing path, memory id, or config file
    NotFound,
    /// Bad flag combination, bad YAML, out-of-range fusion params
    InvalidInput,
    /// Missing `semantic:` section, empty config
    Configuration,
    /// Embedding provider HTTP failure after retries
    Provider,
    /// 401/403 from a provider (non-retryable)
    Auth,
    /// Dimension mismatch, corrupt database, unreachable backend
    StorageOpen,
    /// A chunker failed on a single file (recorded, walk continues)
    ChunkerFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Provider => "provider",
            ErrorKind::Auth => "auth",
            ErrorKind::StorageOpen => "storage_open",
            ErrorKind::ChunkerFailure => "chunker_failure",
        }
    }
}

/// Top-level error type carried across the CLI boundary.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SemanticError {
    pub kind: ErrorKind,
    pub message: String,
    /// Optional actionable hint ("Check file permissions...", "Available profiles: ...")
    pub hint: Option<String>,
}

impl SemanticError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// JSON error envelope written to stdout in `--json` mode.
    ///
    /// `{"error":true,"message":...}` or `{"err":true,"msg":...}` under `--min`.
    pub fn to_json(&self, min: bool) -> serde_json::Value {
        if min {
            serde_json::json!({
                "err": true,
                "msg": self.message,
                "kind": self.kind.as_str(),
            })
        } else {
            let mut v = serde_json::json!({
                "error": true,
                "message": self.message,
                "kind": self.kind.as_str(),
            });
            if let Some(ref hint) = self.hint {
                v["hint"] = serde_json::Value::String(hint.clone());
            }
            v
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_envelope_full() {
        let err = SemanticError::invalid_input("fusion alpha out of range")
            .with_hint("--fusion-alpha must be between 0.0 and 1.0");
        let v = err.to_json(false);
        assert_eq!(v["error"], true);
        assert_eq!(v["message"], "fusion alpha out of range");
        assert_eq!(v["kind"], "invalid_input");
        assert!(v["hint"].as_str().unwrap().contains("fusion-alpha"));
    }

    #[test]
    fn test_json_envelope_min() {
        let err = SemanticError::not_found("no such memory: abc123");
        let v = err.to_json(true);
        assert_eq!(v["err"], true);
        assert_eq!(v["msg"], "no such memory: abc123");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_kind_strings_stable() {
        assert_eq!(ErrorKind::StorageOpen.as_str(), "storage_open");
        assert_eq!(ErrorKind::Auth.as_str(), "auth");
        assert_eq!(ErrorKind::ChunkerFailure.as_str(), "chunker_failure");
    }
}
