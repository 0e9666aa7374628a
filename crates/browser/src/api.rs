//! Control API of the automation server.

use async_trait::async_trait;
use probekit_core::ExecutorSettings;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::error::{ExecutorError, Result};

/// Address of one automation server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// Control API port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Absolute URL for a path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One action sent to `/ai-action` or inside an `/ai-batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Action name, e.g. `aiTap`
    pub action: String,
    /// Action parameters
    pub params: Map<String, Value>,
}

/// Reply to a single action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionReply {
    /// Whether the action succeeded
    #[serde(default)]
    pub success: bool,
    /// Action payload, if any
    #[serde(default)]
    pub data: Option<Value>,
    /// Failure message
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionReply {
    /// A successful reply carrying `data.result`.
    pub fn ok(result: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(serde_json::json!({ "result": result.into() })),
            error: None,
        }
    }

    /// A failed reply.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// The `data.result` value.
    pub fn result(&self) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get("result"))
    }

    /// The `data.result` value rendered as text.
    pub fn result_text(&self) -> Option<String> {
        self.result().and_then(|value| match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    }

    /// The `data.screenshot` value, if the server captured one.
    pub fn screenshot(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get("screenshot"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Reply to `/ai-batch`. Results follow request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReply {
    /// Whether the whole batch succeeded
    #[serde(default)]
    pub success: bool,
    /// One reply per submitted action
    #[serde(default)]
    pub results: Vec<ActionReply>,
    /// Batch-level failure message
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply to `/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReply {
    /// `ok` when the server is ready
    pub status: String,
    /// Server clock at reply time
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HealthReply {
    /// Whether the server reported itself healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "healthy")
    }
}

/// Client side of the automation server control API.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// `GET /health`
    async fn health(&self, endpoint: &Endpoint) -> Result<HealthReply>;

    /// `POST /ai-action`
    async fn action(&self, endpoint: &Endpoint, request: &ActionRequest) -> Result<ActionReply>;

    /// `POST /ai-batch`
    async fn batch(&self, endpoint: &Endpoint, actions: &[ActionRequest]) -> Result<BatchReply>;

    /// `POST /cleanup`
    async fn cleanup(&self, endpoint: &Endpoint) -> Result<()>;
}

/// reqwest-backed control API client.
pub struct HttpControlClient {
    client: reqwest::Client,
    health_timeout: Duration,
    request_timeout: Duration,
}

impl HttpControlClient {
    /// Create a client with explicit timeouts.
    pub fn new(health_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            health_timeout,
            request_timeout,
        }
    }

    /// Create a client from executor settings.
    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.health_timeout_secs),
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    async fn post_json<B, T>(&self, url: String, body: &B, timeout: Duration) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;

        // failures come back as HTTP 500 with a JSON body
        let status = response.status();
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ExecutorError::Protocol(format!("{} returned {}: {}", url, status, e)))
    }
}

#[derive(Serialize)]
struct BatchBody<'a> {
    actions: &'a [ActionRequest],
}

#[async_trait]
impl ControlApi for HttpControlClient {
    async fn health(&self, endpoint: &Endpoint) -> Result<HealthReply> {
        let reply = self
            .client
            .get(endpoint.url("/health"))
            .timeout(self.health_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    async fn action(&self, endpoint: &Endpoint, request: &ActionRequest) -> Result<ActionReply> {
        self.post_json(endpoint.url("/ai-action"), request, self.request_timeout)
            .await
    }

    async fn batch(&self, endpoint: &Endpoint, actions: &[ActionRequest]) -> Result<BatchReply> {
        let timeout = self.request_timeout * actions.len().max(1) as u32;
        self.post_json(endpoint.url("/ai-batch"), &BatchBody { actions }, timeout)
            .await
    }

    async fn cleanup(&self, endpoint: &Endpoint) -> Result<()> {
        self.client
            .post(endpoint.url("/cleanup"))
            .timeout(self.health_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
