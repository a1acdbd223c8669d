use crate::types::{EndpointTarget, LocationRecord};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::timeout;

/// Key under which the batch is sent. Collection endpoints depend on it.
pub const LOCATIONS_KEY: &str = "locations";

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request to {0} failed: {1}")]
    RequestFailed(String, String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("{0} responded with status {1}")]
    Status(String, u16),
}

/// Wire body for a batch: `{"locations": [payload, ...]}`, oldest first.
pub fn batch_body(records: &[LocationRecord]) -> Value {
    let payloads: Vec<&Value> = records.iter().map(|r| &r.payload).collect();
    json!({ LOCATIONS_KEY: payloads })
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Posts a JSON body to the endpoint. Any non-success response is an
    /// error.
    async fn post(&self, target: &EndpointTarget, body: &Value) -> Result<(), TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, target: &EndpointTarget, body: &Value) -> Result<(), TransportError> {
        // Use host as identifier for error messages
        let identifier = target.url.host_str().unwrap_or(target.url.as_str()).to_string();

        let mut request = self.client.post(target.url.clone()).json(body);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| TransportError::Timeout(identifier.clone()))?
            .map_err(|e| TransportError::RequestFailed(identifier.clone(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(identifier, status.as_u16()));
        }

        Ok(())
    }
}
