//! Transport abstraction for the streaming REST surface
//!
//! Subscriptions are established, modified and torn down over plain HTTP;
//! the [`Transport`] trait is the seam between the lifecycle engine and
//! whatever HTTP stack the embedder uses.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// URL-encode a substituted path segment.
///
/// Ids containing `/` must form a single path segment rather than being
/// split across two segments by the literal slash.
fn encode_path_segment(id: &str) -> String {
    id.replace('/', "%2F")
}

/// A request prepared by the subscription engine.
///
/// `url` may contain `{placeholder}` template parameters which are
/// substituted from `template_args` by [`TransportRequest::resolved_url`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportRequest {
    /// Service root the resource lives under, e.g. `trade`
    pub service_path: String,
    /// Resource path relative to the service, e.g. `v1/prices/subscriptions`
    pub url: String,
    /// Values substituted into `{placeholder}` segments of `url`
    pub template_args: HashMap<String, String>,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    /// JSON request body
    pub body: Option<Value>,
    /// Extra request headers
    pub headers: HashMap<String, String>,
}

impl TransportRequest {
    pub fn new(service_path: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            service_path: service_path.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_template_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.template_args.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// The resource path with every template parameter substituted.
    pub fn resolved_url(&self) -> String {
        let mut resolved = self.url.clone();
        for (name, value) in &self.template_args {
            resolved = resolved.replace(&format!("{{{name}}}"), &encode_path_segment(value));
        }
        resolved
    }
}

/// Successful response envelope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed JSON body, when the server sent one
    pub body: Option<Value>,
}

impl TransportResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self { status, body: None }
    }
}

/// Error body returned by the backend on a rejected request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorDetail {
    pub error_code: Option<String>,
    pub message: Option<String>,
}

/// Failure envelope for a request that did not succeed.
///
/// `is_network_error` distinguishes connection-level failures (the request
/// may never have reached the server) from server rejections.
#[derive(Debug, Clone, Default)]
pub struct TransportFailure {
    pub is_network_error: bool,
    /// HTTP status, when a response was received at all
    pub status: Option<u16>,
    pub error: Option<ErrorDetail>,
}

impl TransportFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            is_network_error: true,
            status: None,
            error: Some(ErrorDetail {
                error_code: None,
                message: Some(message.into()),
            }),
        }
    }

    pub fn server(status: u16, error: Option<ErrorDetail>) -> Self {
        Self {
            is_network_error: false,
            status: Some(status),
            error,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref()?.error_code.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.error.as_ref()?.message.as_deref()
    }
}

impl std::error::Error for TransportFailure {}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_network_error {
            write!(f, "network error")?;
        } else {
            match self.status {
                Some(status) => write!(f, "server rejected request ({status})")?,
                None => write!(f, "request failed")?,
            }
        }
        if let Some(code) = self.error_code() {
            write!(f, ": {code}")?;
        }
        if let Some(message) = self.message() {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Result of one HTTP exchange
pub type TransportResult = Result<TransportResponse, TransportFailure>;

/// The HTTP side of the streaming protocol.
///
/// Implementations must be safe to share between subscriptions; the engine
/// clones an `Arc<dyn Transport>` into every request task it spawns.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: TransportRequest) -> TransportResult;
    async fn delete(&self, request: TransportRequest) -> TransportResult;
    async fn patch(&self, request: TransportRequest) -> TransportResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolved_url_substitutes_and_encodes() {
        let request = TransportRequest::new("trade", "v1/prices/subscriptions/{contextId}/{referenceId}")
            .with_template_arg("contextId", "ctx/7")
            .with_template_arg("referenceId", "42");

        assert_eq!(
            request.resolved_url(),
            "v1/prices/subscriptions/ctx%2F7/42"
        );
    }

    #[test]
    fn failure_display_names_the_cause() {
        let failure = TransportFailure::server(
            400,
            Some(ErrorDetail {
                error_code: Some("SampleCode".into()),
                message: Some("broken".into()),
            }),
        );
        assert_eq!(
            failure.to_string(),
            "server rejected request (400): SampleCode: broken"
        );

        let failure = TransportFailure::network("connection refused");
        assert_eq!(failure.to_string(), "network error: connection refused");
    }
}
