//! Remote inference API client
//!
//! Requests are `POST {base_url}/{task}` with an `x-api-key` header and a
//! JSON body. Responses carry either `output` or an error `message`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::ApiConfig;
use crate::error::{Error, Result};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Sends a JSON body and returns the JSON response
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn post(&self, url: &str, api_key: Option<&str>, body: &Value) -> Result<Value>;
}

/// `reqwest` transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("modelwright/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn post(&self, url: &str, api_key: Option<&str>, body: &Value) -> Result<Value> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        // Error statuses still carry a JSON `message`, so the body is parsed regardless.
        let response = request.send().await?;
        Ok(response.json::<Value>().await?)
    }
}

/// Client for the hosted task endpoints
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    api_key: Option<String>,
    transport: Arc<dyn ApiTransport>,
}

impl ApiClient {
    /// HTTP client configured from `config`
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: &ApiConfig, transport: Arc<dyn ApiTransport>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            transport,
        }
    }

    /// Endpoint URL for `task`
    pub fn endpoint(&self, task: &str) -> String {
        format!("{}/{}", self.base_url, task)
    }

    /// Post `body` to the task endpoint and decode its `output`
    #[instrument(skip(self, body))]
    pub async fn call<T: DeserializeOwned>(&self, task: &str, body: Value) -> Result<T> {
        let url = self.endpoint(task);
        debug!("POST {}", url);
        let response = self
            .transport
            .post(&url, self.api_key.as_deref(), &body)
            .await?;
        parse_response(response)
    }
}

/// Decode an API response: a `message` is an error, otherwise `output`
/// is the result
pub fn parse_response<T: DeserializeOwned>(mut response: Value) -> Result<T> {
    match response.get("message") {
        None | Some(Value::Null) => {}
        Some(Value::String(message)) if message.is_empty() => {}
        Some(Value::String(message)) => return Err(Error::remote_api(message.clone())),
        Some(other) => return Err(Error::remote_api(other.to_string())),
    }

    let output = response
        .get_mut("output")
        .map(Value::take)
        .ok_or_else(|| Error::remote_api("response has neither output nor message"))?;
    Ok(serde_json::from_value(output)?)
}
