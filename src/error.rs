//! Shared error classification.
//!
//! Every module owns its own `thiserror` enum. This trait gives each of them a
//! grepable code and a retryable flag so the access layer can tell a transient
//! network failure (queue it, carry on locally) from a rejection that would
//! only repeat if retried.

/// Grepable error code and retryable flag for structured notices.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
