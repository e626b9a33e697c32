#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
};
use llm_feature_gateway::{
    auth::StaticKeyStore,
    feature::{Backend, BackendTable},
    registry::WorkerRegistry,
    state::AppState,
    worker::{echo::EchoWorker, UpstreamError, Worker, WorkerStream},
};

pub const API_KEY: &str = "sk-test-key";

/// Always fails with a 503 from "upstream".
pub struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String, UpstreamError> {
        Err(UpstreamError::Status {
            status: 503,
            body: "model loading".to_owned(),
        })
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _max_tokens: u32,
    ) -> Result<WorkerStream, UpstreamError> {
        Err(UpstreamError::Status {
            status: 503,
            body: "model loading".to_owned(),
        })
    }

    async fn health_check(&self) -> bool {
        false
    }

    async fn close(&self) {}
}

/// Echo workers for every backend except `trt`, which always fails.
pub fn test_state() -> AppState {
    let registry = WorkerRegistry::with_factory(|descriptor| {
        let worker: Arc<dyn Worker> = match descriptor.id {
            Backend::Trt => Arc::new(FailingWorker),
            backend => Arc::new(
                EchoWorker::named(format!("echo-{backend}"))
                    .with_delays(Duration::ZERO, Duration::from_millis(1)),
            ),
        };
        Ok(worker)
    });
    AppState::with_parts(
        Arc::new(registry),
        Arc::new(StaticKeyStore::from_keys([API_KEY])),
        BackendTable::default(),
    )
}

pub fn chat_request(body: &str, extra_headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {API_KEY}"));
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Body::from(body.to_owned()))
        .expect("request build")
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    String::from_utf8(bytes.to_vec()).expect("response body should be UTF-8")
}

/// `data:` payloads of an SSE body, in order.
pub fn sse_payloads(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| payload.trim().to_owned())
        .collect()
}
