//! Wire types exchanged with a streaming backend

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON payload format (the default)
pub const FORMAT_JSON: &str = "application/json";
/// Protobuf payload format; requires schema registration before deltas decode
pub const FORMAT_PROTOBUF: &str = "application/x-protobuf";

/// Error code returned when the server cannot serve the requested format
pub const ERROR_UNSUPPORTED_FORMAT: &str = "UnsupportedSubscriptionFormat";
/// Error message returned when a (context id, reference id) pair is already taken
pub const ERROR_DUPLICATE_KEY_MESSAGE: &str =
    "Subscription Key (Streaming Session, Reference Id) already in use";

/// Out-of-band property set on delta items to signal record deletion.
///
/// The engine passes it through untouched; consumers check for it when
/// merging deltas into their own view of the data.
pub const DELETED_FIELD: &str = "__meta_deleted";

/// Lowest refresh rate the backend accepts, in milliseconds
pub const MIN_REFRESH_RATE_MS: u32 = 100;
/// Refresh rate used when the caller does not specify one, in milliseconds
pub const DEFAULT_REFRESH_RATE_MS: u32 = 1000;

/// Arguments sent when a subscription is created.
///
/// `Top` never travels in the POST body; it is moved to the `$top` query
/// parameter at request-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionArgs {
    /// Payload MIME format
    pub format: String,
    /// Server push interval in milliseconds
    pub refresh_rate: u32,
    /// Opaque resource arguments forwarded to the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Group label enabling bulk unsubscribe-by-tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Pagination limit, sent as the `$top` query parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
}

impl SubscriptionArgs {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            refresh_rate: DEFAULT_REFRESH_RATE_MS,
            arguments: None,
            tag: None,
            top: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_refresh_rate(mut self, refresh_rate: u32) -> Self {
        self.refresh_rate = refresh_rate;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    /// Clamp the refresh rate to the backend's floor.
    pub fn normalize(&mut self) {
        if self.refresh_rate < MIN_REFRESH_RATE_MS {
            self.refresh_rate = MIN_REFRESH_RATE_MS;
        }
    }

    /// Wire form of the arguments for the subscribe POST body.
    ///
    /// `Top` is stripped here; callers append it to the URL instead.
    pub fn to_body(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("Format".into(), Value::String(self.format.clone()));
        body.insert("RefreshRate".into(), json!(self.refresh_rate));
        if let Some(arguments) = &self.arguments {
            body.insert("Arguments".into(), arguments.clone());
        }
        if let Some(tag) = &self.tag {
            body.insert("Tag".into(), Value::String(tag.clone()));
        }
        body
    }
}

impl Default for SubscriptionArgs {
    fn default() -> Self {
        Self::new(FORMAT_JSON)
    }
}

/// Body of a successful subscribe response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SubscribeResponse {
    pub state: Option<String>,
    pub format: Option<String>,
    pub context_id: Option<String>,
    /// Seconds of silence after which the subscription counts as orphaned;
    /// zero or absent means never
    pub inactivity_timeout: Option<u32>,
    pub refresh_rate: Option<u32>,
    /// Full-state payload delivered before any deltas
    pub snapshot: Option<Value>,
    pub schema: Option<String>,
    pub schema_name: Option<String>,
}

/// Payload of one streaming frame
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    /// Already-decoded JSON (the usual case over a JSON connection)
    Json(Value),
    /// Raw bytes awaiting schema-driven decoding
    Binary(Bytes),
}

/// One frame routed from the multiplexed connection to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingMessage {
    /// Server-visible identifier the frame was addressed to
    pub reference_id: String,
    pub data: MessageData,
}

impl StreamingMessage {
    pub fn json(reference_id: impl Into<String>, data: Value) -> Self {
        Self {
            reference_id: reference_id.into(),
            data: MessageData::Json(data),
        }
    }

    pub fn binary(reference_id: impl Into<String>, data: Bytes) -> Self {
        Self {
            reference_id: reference_id.into(),
            data: MessageData::Binary(data),
        }
    }
}

/// Kind of update delivered to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// Full state from the subscribe response
    Snapshot = 1,
    /// Incremental change streamed after the snapshot
    Delta = 2,
}

/// True when a delta item carries the record-deletion marker.
pub fn is_deleted(item: &Value) -> bool {
    item.get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
