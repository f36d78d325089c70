//! Common error types for streaming payload parsers

use thiserror::Error;

/// Errors raised while decoding a streaming payload
#[derive(Debug, Error)]
pub enum ParseError {
    /// Payload is not valid JSON
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema name was referenced that the parser does not know
    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    /// A schema definition could not be registered
    #[error("schema rejected: {0}")]
    Schema(String),

    /// Payload is structurally broken for the negotiated format
    #[error("malformed payload: {0}")]
    Payload(String),
}
