//! HTTP transport backed by reqwest

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use url::Url;

use pushstream_core::{
    ErrorDetail, Transport, TransportFailure, TransportRequest, TransportResponse, TransportResult,
};

use crate::error::ClientError;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] implementation speaking plain HTTP via reqwest.
///
/// Requests resolve to `{base_url}/{service_path}/{resolved_url}` with the
/// request's query string appended.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    /// Create a transport against a backend base URL
    /// (e.g. "https://gateway.example.com").
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_config(base_url, DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a transport with custom timeouts.
    pub fn with_config(
        base_url: &str,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        let base_url = Url::parse(base_url)?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request_url(&self, request: &TransportRequest) -> Result<Url, TransportFailure> {
        let path = format!(
            "/{}/{}",
            request.service_path.trim_matches('/'),
            request.resolved_url().trim_start_matches('/')
        );
        // A malformed URL is a caller bug, not a transient network failure;
        // flagging it as one would put the engine into a retry loop.
        let mut url = self.base_url.join(&path).map_err(|error| TransportFailure {
            is_network_error: false,
            status: None,
            error: Some(ErrorDetail {
                error_code: None,
                message: Some(format!("invalid request URL: {error}")),
            }),
        })?;
        if let Some(query) = &request.query {
            url.set_query(Some(query));
        }
        Ok(url)
    }

    async fn send(&self, method: Method, request: TransportRequest) -> TransportResult {
        let url = self.request_url(&request)?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| TransportFailure::network(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body = response.json::<serde_json::Value>().await.ok();
            Ok(TransportResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            let detail = response.json::<ErrorDetail>().await.ok();
            Err(TransportFailure::server(status.as_u16(), detail))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: TransportRequest) -> TransportResult {
        self.send(Method::POST, request).await
    }

    async fn delete(&self, request: TransportRequest) -> TransportResult {
        self.send(Method::DELETE, request).await
    }

    async fn patch(&self, request: TransportRequest) -> TransportResult {
        self.send(Method::PATCH, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_url_joins_service_path_and_query() {
        let transport = HttpTransport::new("http://localhost:9080").unwrap();
        let request = TransportRequest::new("trade", "v1/prices/subscriptions/{contextId}/{referenceId}")
            .with_template_arg("contextId", "ctx1")
            .with_template_arg("referenceId", "7")
            .with_query("$top=50");

        let url = transport.request_url(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9080/trade/v1/prices/subscriptions/ctx1/7?$top=50"
        );
    }
}
