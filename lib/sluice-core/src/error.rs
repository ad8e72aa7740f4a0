//! Error types for sluice.

use std::sync::Arc;

use derive_more::{Display, Error};

// ============================================================================
// Error Type
// ============================================================================

/// Main error type for sluice operations.
///
/// Errors are cheap to clone: they are kept in the request state and handed to
/// several hooks for a single failure.
#[derive(Debug, Clone, Display, Error)]
pub enum Error {
    /// The fetcher failed.
    #[display("fetch failed: {_0}")]
    Fetch(#[error(not(source))] String),

    /// The fetcher reported an HTTP-shaped failure.
    #[display("HTTP error {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// The data parser rejected the raw result.
    #[display("invalid data: {_0}")]
    InvalidData(#[error(not(source))] String),

    /// Persistent storage failure.
    #[display("storage error: {_0}")]
    Storage(#[error(not(source))] String),

    /// JSON (de)serialization error.
    #[display("serialization error: {_0}")]
    Serialization(#[error(not(source))] Arc<serde_json::Error>),

    /// The request slot was disposed.
    #[display("request slot is disposed")]
    Disposed,

    /// Any other error raised by user code.
    #[display("{_0}")]
    Custom(#[error(not(source))] Arc<dyn std::error::Error + Send + Sync>),
}

/// Result type alias using [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }
}

// Errors carry no identity, they compare by rendered message.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Error {
    /// Create a fetch error.
    #[must_use]
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    /// Create an HTTP error from status code and message.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid data error.
    #[must_use]
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    /// Create a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Wrap any error into a sluice error.
    #[must_use]
    pub fn custom<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(err))
    }

    /// Returns the HTTP status code if this is an HTTP error.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if this is a 401 Unauthorized error.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Returns `true` if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    /// Returns `true` if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }

    /// Returns `true` if the slot was disposed.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed)
    }
}
