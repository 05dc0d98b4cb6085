//! Error types for the gateway.

use serde::Serialize;
use std::io;
use thiserror::Error;

/// Errors that can occur while running the gateway.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to a listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file could not be decoded.
    #[error("error decoding yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The configuration is structurally valid but violates a constraint.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An upstream address could not be parsed.
    #[error("invalid upstream address {addr:?}: {reason}")]
    UpstreamAddress { addr: String, reason: String },

    /// The cache store client could not be constructed.
    #[error("cache store error: {0}")]
    CacheStore(#[from] redis::RedisError),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Client-facing error envelope, serialized as
/// `{"code":<int>,"message":"<string>"}` with a trailing newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientError {
    pub code: u16,
    pub message: &'static str,
}

/// No route matched the request path.
pub const ERROR_NOT_FOUND: ClientError = ClientError {
    code: 404,
    message: "not found",
};

/// The route requires credentials the request did not present.
pub const ERROR_FORBIDDEN: ClientError = ClientError {
    code: 401,
    message: "forbidden",
};

/// The route restricts the HTTP method.
pub const ERROR_BAD_METHOD: ClientError = ClientError {
    code: 405,
    message: "bad method",
};

/// No backend could serve the request.
pub const ERROR_BAD_GATEWAY: ClientError = ClientError {
    code: 502,
    message: "bad gateway",
};

/// A rate-limit window is exhausted.
pub const ERROR_TOO_MANY_REQUESTS: ClientError = ClientError {
    code: 429,
    message: "too many requests",
};
