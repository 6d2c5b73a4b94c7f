//! Unified error handling for the sixcore runtime.
//!
//! This module provides a centralized error type so that subsystem
//! modules (cache, pool, response pipeline, ...) do not need to depend
//! on each other for error handling.

use std::fmt;

/// Error kinds surfaced by the core runtime, keyed by the HTTP response
/// (or internal status) they map to.
#[derive(Debug)]
pub enum CoreError {
    /// Malformed client input (400).
    BadRequest(String),
    /// Missing or invalid credentials (401).
    Unauthorized(String),
    /// Authenticated but not permitted (403).
    Forbidden(String),
    /// No matching resource (404).
    NotFound(String),
    /// Method not allowed for the matched resource (405).
    MethodNotAllowed(String),
    /// Request entity exceeded a configured bound (413).
    EntityTooLarge(String),
    /// Request URI exceeded a configured bound (414).
    UriTooLong(String),
    /// Header fields exceeded a configured bound (431).
    HeaderFieldsTooLarge(String),
    /// Internal fault; caller should reset response headers (500).
    Internal(String),
    /// Pool/queue overload (503, with Retry-After).
    Overload { message: String, retry_after_secs: u64 },
    /// `wait_create_entry` deadline elapsed. Never surfaced as a response
    /// by itself; distinguishable from a cache miss.
    CacheWaitTimeout,
    /// DNS resolution failed (boolean false at the call site; this
    /// variant exists for callers that want to propagate why).
    DnsUnresolved(String),
    /// Form body was not valid UTF-8 after both primary and fallback
    /// charset decoding passes.
    InvalidUtf8Form,
    /// Out-of-memory-class resource exhaustion. Fatal by contract.
    ResourceExhaustion(String),
    /// Configuration could not be parsed or failed validation.
    Configuration(String),
    /// Wrapped I/O error.
    Io(std::io::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            CoreError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            CoreError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            CoreError::NotFound(msg) => write!(f, "not found: {msg}"),
            CoreError::MethodNotAllowed(msg) => write!(f, "method not allowed: {msg}"),
            CoreError::EntityTooLarge(msg) => write!(f, "entity too large: {msg}"),
            CoreError::UriTooLong(msg) => write!(f, "uri too long: {msg}"),
            CoreError::HeaderFieldsTooLarge(msg) => write!(f, "header fields too large: {msg}"),
            CoreError::Internal(msg) => write!(f, "internal error: {msg}"),
            CoreError::Overload { message, retry_after_secs } => {
                write!(f, "overload (retry after {retry_after_secs}s): {message}")
            }
            CoreError::CacheWaitTimeout => write!(f, "cache wait timed out"),
            CoreError::DnsUnresolved(msg) => write!(f, "dns resolution failed: {msg}"),
            CoreError::InvalidUtf8Form => write!(f, "form body is not valid utf-8"),
            CoreError::ResourceExhaustion(msg) => write!(f, "resource exhaustion: {msg}"),
            CoreError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            CoreError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err)
    }
}

impl CoreError {
    /// Maps an error kind to the HTTP status it is surfaced as, per the
    /// error-handling design table. Kinds with no direct response
    /// mapping (cache timeout, DNS failure, resource exhaustion) return
    /// `None`; callers handle those in-band.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            CoreError::BadRequest(_) => Some(400),
            CoreError::Unauthorized(_) => Some(401),
            CoreError::Forbidden(_) => Some(403),
            CoreError::NotFound(_) => Some(404),
            CoreError::MethodNotAllowed(_) => Some(405),
            CoreError::EntityTooLarge(_) => Some(413),
            CoreError::UriTooLong(_) => Some(414),
            CoreError::HeaderFieldsTooLarge(_) => Some(431),
            CoreError::Internal(_) => Some(500),
            CoreError::Overload { .. } => Some(503),
            CoreError::InvalidUtf8Form => Some(400),
            CoreError::Configuration(_) | CoreError::Io(_) => Some(500),
            CoreError::CacheWaitTimeout
            | CoreError::DnsUnresolved(_)
            | CoreError::ResourceExhaustion(_) => None,
        }
    }
}

/// Result type alias for core runtime operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Helper trait for adding context to errors, mirroring the style used
/// across the rest of the crate's Result-returning APIs.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> CoreResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> CoreResult<T> {
        self.map_err(|e| CoreError::Internal(format!("{context}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        assert_eq!(CoreError::BadRequest("x".into()).status_code(), Some(400));
        assert_eq!(
            CoreError::Overload { message: "full".into(), retry_after_secs: 5 }.status_code(),
            Some(503)
        );
        assert_eq!(CoreError::CacheWaitTimeout.status_code(), None);
    }

    #[test]
    fn display_includes_message() {
        let err = CoreError::NotFound("/missing".into());
        assert!(err.to_string().contains("/missing"));
    }
}
