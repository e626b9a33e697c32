use std::{
    convert::Infallible,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::authenticate,
    errors::{apply_header, AppError},
    feature::{Backend, FeatureSelection, BACKEND_HEADER, QUANT_HEADER},
    metrics::{RequestMetrics, RequestStatus},
    models::{ChatCompletionsRequest, ChatCompletionsResponse, ModelCard, ModelList},
    registry::WorkerHealth,
    relay::{RelayStream, StreamRelay},
    state::AppState,
    worker::rough_token_estimate,
};

pub async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

pub async fn backend_health(State(state): State<AppState>) -> Json<Vec<WorkerHealth>> {
    Json(state.registry.check_once().await)
}

pub async fn list_models() -> Json<ModelList> {
    let created = unix_timestamp();
    Json(ModelList {
        object: "list",
        data: Backend::ALL
            .into_iter()
            .map(|backend| ModelCard {
                id: backend.as_str().to_owned(),
                object: "model",
                created,
                owned_by: "llm-inference",
            })
            .collect(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionsRequest>,
) -> Response {
    match process_chat_completions(state, headers, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn process_chat_completions(
    state: AppState,
    headers: HeaderMap,
    request: ChatCompletionsRequest,
) -> Result<Response, AppError> {
    let auth = authenticate(state.keys.as_ref(), &headers)?;
    let selection = FeatureSelection::from_headers(&headers, &state.backends);
    let request_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = unix_timestamp();

    info!(
        request_id = %request_id,
        key_id = %auth.key.key_id,
        model = %request.model,
        backend = %selection.backend.id,
        backend_url = %selection.backend.url,
        quant = %selection.quant,
        stream = request.stream,
        "chat request accepted"
    );

    // Label by resolved backend: the request model is client text and unbounded.
    let metrics = RequestMetrics::start(
        state.metrics.clone(),
        selection.backend.id.as_str(),
        request.stream,
    );
    if request.stream {
        stream_completion(state, request, selection, request_id, created, metrics).await
    } else {
        one_shot_completion(state, request, selection, request_id, created, metrics).await
    }
}

async fn one_shot_completion(
    state: AppState,
    request: ChatCompletionsRequest,
    selection: FeatureSelection,
    request_id: String,
    created: i64,
    mut metrics: RequestMetrics,
) -> Result<Response, AppError> {
    let outcome = generate_text(&state, &request, &selection, &mut metrics).await;
    let status = if outcome.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    let tokens = metrics.tokens();
    let latency = metrics.finish(status);

    let (prompt, content) = outcome.inspect_err(|error| {
        warn!(request_id = %request_id, error = %error, "chat completion failed");
    })?;
    info!(
        request_id = %request_id,
        latency_ms = latency.as_millis() as u64,
        completion_tokens = tokens,
        "chat completion finished"
    );

    let payload = ChatCompletionsResponse::new(request_id, created, request.model, &prompt, content);
    let mut response = Json(payload).into_response();
    apply_selection_headers(response.headers_mut(), &selection);
    Ok(response)
}

async fn generate_text(
    state: &AppState,
    request: &ChatCompletionsRequest,
    selection: &FeatureSelection,
    metrics: &mut RequestMetrics,
) -> Result<(String, String), AppError> {
    let prompt = request.prompt().map_err(AppError::BadRequest)?.to_owned();
    metrics.record_prompt_tokens(rough_token_estimate(&prompt));

    let worker = state.registry.get_or_create(&selection.backend).await?;
    let max_tokens = request.max_tokens_or(state.default_max_tokens);
    let content = worker.generate(&prompt, max_tokens).await?;
    metrics.record_token(u64::from(rough_token_estimate(&content)));
    Ok((prompt, content))
}

async fn stream_completion(
    state: AppState,
    request: ChatCompletionsRequest,
    selection: FeatureSelection,
    request_id: String,
    created: i64,
    mut metrics: RequestMetrics,
) -> Result<Response, AppError> {
    let prompt = match request.prompt().map(ToOwned::to_owned) {
        Ok(prompt) => prompt,
        Err(message) => {
            warn!(request_id = %request_id, %message, "rejecting stream request");
            let frames = StreamRelay::new(request_id, created, request.model, metrics).reject(message);
            return Ok(sse_response(frames, &selection));
        }
    };
    metrics.record_prompt_tokens(rough_token_estimate(&prompt));

    let worker = match state.registry.get_or_create(&selection.backend).await {
        Ok(worker) => worker,
        Err(error) => {
            metrics.finish(RequestStatus::Error);
            return Err(error.into());
        }
    };
    let max_tokens = request.max_tokens_or(state.default_max_tokens);
    let frames = StreamRelay::new(request_id, created, request.model, metrics).run(
        worker,
        prompt,
        max_tokens,
    );
    Ok(sse_response(frames, &selection))
}

fn sse_response(frames: RelayStream, selection: &FeatureSelection) -> Response {
    let events = frames.map(|frame| Ok::<_, Infallible>(frame.into_event()));
    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response();
    apply_selection_headers(response.headers_mut(), selection);
    response
}

fn apply_selection_headers(headers: &mut HeaderMap, selection: &FeatureSelection) {
    apply_header(headers, BACKEND_HEADER, selection.backend.id.as_str());
    apply_header(headers, QUANT_HEADER, selection.quant.as_str());
}

fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}
