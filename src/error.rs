//! Custom error types for the publisher.
use thiserror::Error;

/// Errors raised by the publisher core and its wire codecs.
///
/// Transport errors terminate the affected connection only; they are absorbed
/// at the fan-out boundary and never surface to `publish_measurements` callers.
#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("cipher failure: {0}")]
    CipherFailure(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, PublisherError>;
