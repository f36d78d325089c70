//! Error types for subscription and transport operations

use thiserror::Error;

/// Errors surfaced by subscription methods
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscription was disposed and will issue no further requests
    #[error("subscription has been disposed")]
    Disposed,

    /// A patch modify was requested without a delta payload
    #[error("patch requires a delta payload")]
    MissingPatchDelta,
}

/// Errors raised while constructing the HTTP transport
#[derive(Debug, Error)]
pub enum ClientError {
    /// Underlying HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Base URL did not parse
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
