pub mod echo;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::{
    config::Timeouts,
    feature::{Backend, BackendDescriptor},
};

/// Lazily produced text fragments. Single pass; may fail partway through.
pub type WorkerStream = BoxStream<'static, Result<String, UpstreamError>>;

/// Model name used when the upstream models listing cannot be read.
pub const UNKNOWN_MODEL: &str = "unknown";

/// Capability shared by every backend kind.
///
/// Implementations are safe to share between concurrent requests; the
/// registry hands out one `Arc` per backend URL.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, UpstreamError>;

    async fn generate_stream(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<WorkerStream, UpstreamError>;

    /// Never fails; any problem reaching the backend reports `false`.
    async fn health_check(&self) -> bool;

    /// Releases the connection pool. Calling it again is a no-op.
    async fn close(&self);
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream connection failed: {0}")]
    Transport(String),
    #[error("upstream response invalid: {0}")]
    InvalidResponse(String),
    #[error("worker for {0} is closed")]
    Closed(String),
}

/// Which engine family a proxying worker talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Vllm,
    Tgi,
    TensorRt,
}

impl WorkerKind {
    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Tgi | Backend::TgiTp => WorkerKind::Tgi,
            Backend::Trt => WorkerKind::TensorRt,
            Backend::Vllm | Backend::VllmQuant => WorkerKind::Vllm,
        }
    }

    pub fn engine(self) -> &'static str {
        match self {
            WorkerKind::Vllm => "vllm",
            WorkerKind::Tgi => "tgi",
            WorkerKind::TensorRt => "trt-llm",
        }
    }
}

/// Whether the registry builds simulated or proxying workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    #[default]
    Echo,
    Proxy,
}

impl WorkerMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "echo" => Some(WorkerMode::Echo),
            "proxy" | "http" => Some(WorkerMode::Proxy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerMode::Echo => "echo",
            WorkerMode::Proxy => "proxy",
        }
    }

    /// Dispatch table from a resolved backend to a concrete worker.
    pub fn build(
        self,
        descriptor: &BackendDescriptor,
        timeouts: Timeouts,
    ) -> Result<Arc<dyn Worker>, UpstreamError> {
        match self {
            WorkerMode::Echo => Ok(Arc::new(echo::EchoWorker::named(format!(
                "echo-{}",
                descriptor.id
            )))),
            WorkerMode::Proxy => Ok(Arc::new(http::HttpWorker::new(
                WorkerKind::for_backend(descriptor.id),
                &descriptor.url,
                timeouts,
            )?)),
        }
    }
}

/// Whitespace-split token approximation used for usage accounting.
pub fn rough_token_estimate(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}
