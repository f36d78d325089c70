//! Test utilities
//!
//! Provides a recording transport with scripted responses for driving the
//! lifecycle engine deterministically, a schema-capable stub parser for
//! binary-format paths, and an ephemeral-port test server for HTTP
//! round-trip tests.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use pushstream_core::{
    MessageData, ParseError, StreamParser, Transport, TransportRequest, TransportResponse,
    TransportResult,
};

use crate::session::SessionEvent;

/// One request observed by [`MockTransport`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub request: TransportRequest,
}

/// Transport double that records every request and serves scripted
/// responses per method, defaulting to an empty `200`.
#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<RecordedRequest>>,
    responses: Mutex<HashMap<&'static str, VecDeque<TransportResult>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next response for `method` ("POST", "DELETE" or "PATCH").
    pub fn script(&self, method: &'static str, result: TransportResult) {
        self.responses
            .lock()
            .entry(method)
            .or_default()
            .push_back(result);
    }

    pub fn script_post(&self, result: TransportResult) {
        self.script("POST", result);
    }

    pub fn script_delete(&self, result: TransportResult) {
        self.script("DELETE", result);
    }

    pub fn script_patch(&self, result: TransportResult) {
        self.script("PATCH", result);
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Requests seen for one method, in arrival order.
    pub fn requests_for(&self, method: &str) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|recorded| recorded.method == method)
            .map(|recorded| recorded.request.clone())
            .collect()
    }

    fn respond(&self, method: &'static str, request: TransportRequest) -> TransportResult {
        self.requests.lock().push(RecordedRequest { method, request });
        self.responses
            .lock()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(TransportResponse::empty(200)))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, request: TransportRequest) -> TransportResult {
        self.respond("POST", request)
    }

    async fn delete(&self, request: TransportRequest) -> TransportResult {
        self.respond("DELETE", request)
    }

    async fn patch(&self, request: TransportRequest) -> TransportResult {
        self.respond("PATCH", request)
    }
}

/// Channel for driving a [`crate::Subscription`] without a session loop.
pub fn event_channel() -> (
    mpsc::UnboundedSender<SessionEvent>,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    mpsc::unbounded_channel()
}

/// Schema-registering parser stub for exercising binary-format paths
/// without a real protobuf engine. Payload bytes are decoded as JSON.
pub struct SchemaStubParser {
    format: String,
    schemas: Vec<(String, String)>,
}

impl SchemaStubParser {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            schemas: Vec::new(),
        }
    }
}

impl StreamParser for SchemaStubParser {
    fn format(&self) -> &str {
        &self.format
    }

    fn parse(
        &mut self,
        data: &MessageData,
        _schema_name: Option<&str>,
    ) -> Result<Value, ParseError> {
        match data {
            MessageData::Json(value) => Ok(value.clone()),
            MessageData::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    fn add_schema(&mut self, schema: &str, name: &str) -> Result<(), ParseError> {
        self.schemas.push((name.to_string(), schema.to_string()));
        Ok(())
    }

    fn schema_names(&self) -> Vec<String> {
        self.schemas.iter().map(|(name, _)| name.clone()).collect()
    }

    fn schema_name(&self) -> Option<&str> {
        self.schemas.last().map(|(name, _)| name.as_str())
    }
}

/// A test server that shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Bind an axum router to an ephemeral local port.
    pub async fn start(router: axum::Router) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give the server a moment to start accepting.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
