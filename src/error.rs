//! Error types for Arbor

use thiserror::Error;

/// Result type alias using Arbor's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Arbor
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing models, credentials, bad option values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A decision node was reached with no available options
    #[error("No tools available at decision node '{0}'")]
    NoToolsAvailable(String),

    /// Store rejected the credentials
    #[error("Store authentication error: {0}")]
    StoreAuth(String),

    /// A store query was malformed or unsupported for the target collection
    #[error("Store query error: {0}")]
    StoreQuery(String),

    /// Any other store-side failure
    #[error("Store error: {0}")]
    Store(String),

    /// Language model call failure
    #[error("Language model error: {0}")]
    Lm(String),

    /// A tool raised during `invoke`
    #[error("Tool '{tool}' failed: {message}")]
    ToolInvocation { tool: String, message: String },

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the tree loop can continue after this error.
    ///
    /// Recoverable errors become `Warning`/`Error` events on the stream;
    /// everything else propagates to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::StoreAuth(_)
                | Error::StoreQuery(_)
                | Error::Store(_)
                | Error::Http(_)
                | Error::Lm(_)
                | Error::ToolInvocation { .. }
        )
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::NotFound(_) | Error::Config(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("Invalid URL: {}", err))
    }
}
