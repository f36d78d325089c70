//! pushstream-client - Client-side engine for long-lived server-push subscriptions
//!
//! A subscription is established with an HTTP POST, refreshed with deltas
//! arriving over a multiplexed connection, modified in place with PATCH, and
//! torn down with DELETE. This crate provides the per-subscription lifecycle
//! engine, the coalescing action queue behind it, and the
//! [`StreamingSession`] facade that routes incoming frames and request
//! completions.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pushstream_client::{HttpTransport, StreamingSession, SubscriptionOptions};
//! use pushstream_core::{ParserFacade, SubscriptionArgs, FORMAT_JSON};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(HttpTransport::new("https://gateway.example.com")?);
//!     let parsers = Arc::new(ParserFacade::new());
//!     let mut session = StreamingSession::new(transport, parsers);
//!
//!     let options = SubscriptionOptions {
//!         on_update: Some(Box::new(|message, update_type| {
//!             println!("{update_type:?}: {message:?}");
//!         })),
//!         ..Default::default()
//!     };
//!     session.create_subscription(
//!         "trade",
//!         "v1/prices/subscriptions",
//!         SubscriptionArgs::new(FORMAT_JSON),
//!         options,
//!     );
//!
//!     session.on_connection_available();
//!     while session.process_next_event().await {
//!         // Frames from the socket driver go to session.handle_message(..)
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod http;
mod queue;
mod session;
mod subscription;
pub mod testing;

pub use error::{ClientError, SubscriptionError};
pub use http::HttpTransport;
pub use queue::{Action, ActionQueue};
pub use session::{EventSink, SessionEvent, StreamingSession, SubscriptionKey};
pub use subscription::{
    CapturedIds, ErrorCallback, ModifyOptions, NotifyCallback, StateChangedCallback, Subscription,
    SubscriptionEvent, SubscriptionOptions, SubscriptionState, UpdateCallback,
    NETWORK_ERROR_RETRY_DELAY,
};

// Re-export core types for convenience
pub use pushstream_core::{
    JsonParser, MessageData, ParserFacade, StreamParser, StreamingMessage, SubscribeResponse,
    SubscriptionArgs, Transport, TransportFailure, TransportRequest, TransportResponse,
    TransportResult, UpdateType,
};
