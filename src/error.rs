//! Error taxonomy for session operations
//!
//! Every caller-facing operation returns [`SessionError`]. Synchronous failures
//! (validation, TLS building, lifecycle misuse, unknown handles) are returned
//! directly to the call site and never reach the event bus. Engine failures that
//! happen asynchronously are delivered as `Error` events instead, and only show up
//! here when the engine rejects a request outright.

use crate::connection::ValidationError;
use crate::engine::EngineError;
use crate::lifecycle::LifecycleError;
use crate::registry::Handle;
use crate::tls::TlsBuildError;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Main error type for registry and session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid connection options: {0}")]
    Validation(#[from] ValidationError),

    #[error("TLS material rejected: {0}")]
    Tls(#[from] TlsBuildError),

    #[error("Lifecycle violation: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("No live session for handle {0}")]
    NotFound(Handle),

    #[error("Session limit reached: {limit} live sessions")]
    Exhausted { limit: usize },
}

impl SessionError {
    /// Short machine-readable reason, used in logs and connect outcomes
    pub fn reason(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "validation",
            SessionError::Tls(TlsBuildError::Decode(_)) => "tls_decode",
            SessionError::Tls(TlsBuildError::Auth) => "tls_auth",
            SessionError::Tls(TlsBuildError::EmptyBundle) => "tls_empty_bundle",
            SessionError::Lifecycle(_) => "lifecycle",
            SessionError::Engine(_) => "engine",
            SessionError::NotFound(_) => "not_found",
            SessionError::Exhausted { .. } => "exhausted",
        }
    }

    /// True when the error is the caller's fault rather than the engine's
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, SessionError::Engine(_) | SessionError::Exhausted { .. })
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

const MAX_DETAIL_LEN: usize = 500;

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(password|passphrase|token|key|secret)[=:]\s*\S+")
            .expect("secret pattern is a valid regex")
    })
}

/// Sanitize engine-supplied error details before they reach listeners or logs
///
/// Broker and TLS stacks occasionally echo credentials back in their error text,
/// so anything that looks like `password=...` is redacted and long details are
/// truncated.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = secret_pattern()
        .replace_all(message, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_DETAIL_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_DETAIL_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized = sanitize_error_message("bad auth: password=hunter2 token: abc456");

        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_sanitize_case_insensitive() {
        let sanitized = sanitize_error_message("PASSPHRASE=topsecret Key=xyz");

        assert!(!sanitized.contains("topsecret"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_long_detail_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));

        assert!(sanitized.len() <= MAX_DETAIL_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));

        assert!(sanitized.len() <= MAX_DETAIL_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_exactly_max_len_untouched() {
        let message = "x".repeat(MAX_DETAIL_LEN);
        assert_eq!(sanitize_error_message(&message), message);
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            SessionError::from(TlsBuildError::Auth).reason(),
            "tls_auth"
        );
        assert_eq!(
            SessionError::from(LifecycleError::NotConnected).reason(),
            "lifecycle"
        );
        assert_eq!(
            SessionError::NotFound(Handle::from("h-1")).reason(),
            "not_found"
        );
        assert_eq!(SessionError::Exhausted { limit: 4 }.reason(), "exhausted");
    }

    #[test]
    fn test_caller_error_classification() {
        assert!(SessionError::from(LifecycleError::AlreadyConnected).is_caller_error());
        assert!(SessionError::NotFound(Handle::from("gone")).is_caller_error());
        assert!(!SessionError::from(EngineError::new("publish", "queue full")).is_caller_error());
    }
}
