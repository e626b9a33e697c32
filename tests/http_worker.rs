//! `HttpWorker` against a mocked OpenAI-compatible engine.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_feature_gateway::{
    config::Timeouts,
    worker::{http::HttpWorker, UpstreamError, Worker, WorkerKind},
};

fn timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(2),
        request: Duration::from_secs(5),
    }
}

fn worker_for(server: &MockServer) -> HttpWorker {
    HttpWorker::new(WorkerKind::Vllm, &server.uri(), timeouts()).expect("http worker")
}

async fn mount_models(server: &MockServer, model: &str) {
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": model}]})),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn generate_sends_discovered_model_and_returns_content() {
    let server = MockServer::start().await;
    mount_models(&server, "llama-3-8b").await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "model": "llama-3-8b",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 32,
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "hello there"}}]
        })))
        .mount(&server)
        .await;

    let text = worker_for(&server)
        .generate("hi", 32)
        .await
        .expect("generate");
    assert_eq!(text, "hello there");
}

#[tokio::test]
async fn model_name_is_discovered_only_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "m"}]})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "ok"}}]
        })))
        .expect(3)
        .mount(&server)
        .await;

    let worker = worker_for(&server);
    for _ in 0..3 {
        worker.generate("ping", 4).await.expect("generate");
    }
    server.verify().await;
}

#[tokio::test]
async fn failed_discovery_falls_back_to_unknown_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "unknown"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "still works"}}]
        })))
        .mount(&server)
        .await;

    let text = worker_for(&server)
        .generate("hi", 8)
        .await
        .expect("generate");
    assert_eq!(text, "still works");
}

#[tokio::test]
async fn non_success_status_carries_status_and_body() {
    let server = MockServer::start().await;
    mount_models(&server, "m").await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let error = worker_for(&server)
        .generate("hi", 8)
        .await
        .expect_err("500 should fail");
    assert_eq!(
        error,
        UpstreamError::Status {
            status: 500,
            body: "boom".to_owned()
        }
    );
}

#[tokio::test]
async fn connection_failure_is_transport_error() {
    let worker =
        HttpWorker::new(WorkerKind::Tgi, "http://127.0.0.1:1", timeouts()).expect("http worker");
    let error = worker.generate("hi", 8).await.expect_err("nothing listens");
    assert!(matches!(error, UpstreamError::Transport(_)), "got {error:?}");
    assert!(!worker.health_check().await);
}

#[tokio::test]
async fn stream_skips_malformed_lines_and_stops_at_sentinel() {
    let server = MockServer::start().await;
    mount_models(&server, "m").await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: not-json\n\n",
        ": comment\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let fragments = worker_for(&server)
        .generate_stream("hi", 8)
        .await
        .expect("stream")
        .map(|item| item.expect("fragment"))
        .collect::<Vec<_>>()
        .await;
    assert_eq!(fragments, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn stream_status_error_surfaces_before_streaming() {
    let server = MockServer::start().await;
    mount_models(&server, "m").await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .mount(&server)
        .await;

    match worker_for(&server).generate_stream("hi", 8).await {
        Err(UpstreamError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "warming up");
        }
        Err(other) => panic!("expected status error, got {other:?}"),
        Ok(_) => panic!("expected status error, got a stream"),
    }
}

#[tokio::test]
async fn health_check_reflects_upstream_status() {
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;
    assert!(worker_for(&healthy).health_check().await);

    let unhealthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&unhealthy)
        .await;
    assert!(!worker_for(&unhealthy).health_check().await);
}

#[tokio::test]
async fn close_is_idempotent_and_stops_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let worker = worker_for(&server);
    assert!(worker.health_check().await);

    worker.close().await;
    worker.close().await;

    assert!(!worker.health_check().await);
    assert!(matches!(
        worker.generate("hi", 8).await,
        Err(UpstreamError::Closed(_))
    ));
}
