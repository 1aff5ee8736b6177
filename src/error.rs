//! Error types for gridlink.

use thiserror::Error;

/// Primary error type for all gridlink operations.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Bad credentials, a failed token refresh, or a stale token file.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// An authenticated operation was attempted before any successful connect.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// Job submission was rejected by the server.
    #[error("Upload failed (status {status}): {message}")]
    Upload { status: u16, message: String },

    /// A job-related endpoint returned a non-2xx response.
    #[error("Request failed (status {status}): {message}")]
    Request { status: u16, message: String },

    /// The server response violates the expected contract. Never worked
    /// around silently; this indicates a server defect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded poll or retry schedule was exhausted.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LinkError {
    /// Create an upload error from a status code and server message.
    pub fn upload(status: u16, message: impl Into<String>) -> Self {
        Self::Upload {
            status,
            message: message.into(),
        }
    }

    /// Create a request error from a status code and server message.
    pub fn request(status: u16, message: impl Into<String>) -> Self {
        Self::Request {
            status,
            message: message.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, LinkError>;
