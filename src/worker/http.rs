use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::Timeouts,
    relay::upstream_fragments,
    worker::{UpstreamError, Worker, WorkerKind, WorkerStream, UNKNOWN_MODEL},
};

/// All three engine families expose the same liveness route.
const HEALTH_PATH: &str = "/health";

/// Proxies to an engine exposing the OpenAI-compatible chat API
/// (vLLM, TGI and TensorRT-LLM all do).
pub struct HttpWorker {
    name: String,
    base_url: String,
    client: RwLock<Option<Client>>,
    model: OnceCell<String>,
}

impl HttpWorker {
    pub fn new(kind: WorkerKind, base_url: &str, timeouts: Timeouts) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .build()
            .map_err(|error| {
                UpstreamError::Transport(format!("failed to build HTTP client: {error}"))
            })?;
        let base_url = base_url.trim_end_matches('/').to_owned();

        info!(engine = kind.engine(), %base_url, "http worker created");
        Ok(Self {
            name: format!("{}@{}", kind.engine(), base_url),
            base_url,
            client: RwLock::new(Some(client)),
            model: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `Client` is a handle onto a shared pool, so cloning it out of the
    /// lock is cheap and lets requests run without holding the lock.
    async fn client(&self) -> Result<Client, UpstreamError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| UpstreamError::Closed(self.name.clone()))
    }

    /// Memoized after the first successful lookup; failures are not cached.
    async fn model_name(&self) -> String {
        match self.model.get_or_try_init(|| self.discover_model()).await {
            Ok(model) => model.clone(),
            Err(error) => {
                warn!(worker = %self.name, error = %error, "model discovery failed");
                UNKNOWN_MODEL.to_owned()
            }
        }
    }

    async fn discover_model(&self) -> Result<String, UpstreamError> {
        let response = self
            .client()
            .await?
            .get(self.url("/v1/models"))
            .send()
            .await
            .map_err(|error| UpstreamError::Transport(error.to_string()))?;
        let response = ensure_success(response).await?;
        let listing: ModelListing = response
            .json()
            .await
            .map_err(|error| UpstreamError::InvalidResponse(error.to_string()))?;

        let model = listing
            .data
            .into_iter()
            .next()
            .map(|entry| entry.id)
            .ok_or_else(|| UpstreamError::InvalidResponse("empty model listing".to_owned()))?;
        debug!(worker = %self.name, %model, "discovered upstream model");
        Ok(model)
    }

    async fn post_completion(
        &self,
        prompt: &str,
        max_tokens: u32,
        stream: bool,
    ) -> Result<Response, UpstreamError> {
        let client = self.client().await?;
        let model = self.model_name().await;
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "stream": stream
        });

        let response = client
            .post(self.url("/v1/chat/completions"))
            .json(&payload)
            .send()
            .await
            .map_err(|error| UpstreamError::Transport(error.to_string()))?;
        ensure_success(response).await
    }
}

#[async_trait]
impl Worker for HttpWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, UpstreamError> {
        let response = self.post_completion(prompt, max_tokens, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|error| UpstreamError::InvalidResponse(error.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| UpstreamError::InvalidResponse("missing choices in response".to_owned()))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<WorkerStream, UpstreamError> {
        let response = self.post_completion(prompt, max_tokens, true).await?;
        debug!(worker = %self.name, "upstream stream opened");
        Ok(upstream_fragments(response.bytes_stream()))
    }

    async fn health_check(&self) -> bool {
        let Ok(client) = self.client().await else {
            return false;
        };
        match client.get(self.url(HEALTH_PATH)).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                debug!(worker = %self.name, error = %error, "health probe failed");
                false
            }
        }
    }

    async fn close(&self) {
        if self.client.write().await.take().is_some() {
            info!(worker = %self.name, "http worker closed");
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown upstream error".to_owned());
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body: body.chars().take(400).collect(),
    })
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}
