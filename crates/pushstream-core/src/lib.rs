//! pushstream-core - Core traits and wire types for server-push streaming clients
//!
//! This crate provides the abstractions shared by subscription engines and
//! transports: the [`Transport`] trait with its request/response envelopes,
//! the [`StreamParser`] trait with the MIME-keyed [`ParserFacade`] registry,
//! and the wire types exchanged with a streaming backend.

pub mod error;
pub mod parser;
pub mod transport;
pub mod types;

pub use error::ParseError;
pub use parser::{JsonParser, ParserFacade, StreamParser};
pub use transport::{
    ErrorDetail, Transport, TransportFailure, TransportRequest, TransportResponse, TransportResult,
};
pub use types::*;
