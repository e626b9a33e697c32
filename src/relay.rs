//! Translation of an upstream fragment stream into the gateway's own SSE frames.
//!
//! Two layers live here. [`upstream_fragments`] turns the raw line-delimited
//! `data:` body of an OpenAI-compatible engine into text fragments, dropping
//! lines it cannot use. [`StreamRelay`] consumes those fragments through the
//! `Init -> Prefill -> Streaming -> Done | Error` state machine, drives the
//! request's [`RequestMetrics`] and emits normalized frames that always end
//! with the `[DONE]` sentinel.

use std::{fmt, sync::Arc};

use axum::response::sse::Event;
use futures_util::{stream::BoxStream, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    errors::ErrorEnvelope,
    metrics::{RequestMetrics, RequestStatus},
    models::ChatCompletionsChunk,
    worker::{UpstreamError, Worker, WorkerStream},
};

pub const DONE_SENTINEL: &str = "[DONE]";
const DATA_PREFIX: &str = "data:";

/// Classification of one upstream body line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamLine {
    /// Blank, non-`data:` or content-free line.
    Skip,
    /// `data:` payload that is not a valid chunk. Dropped, never fatal.
    Malformed(String),
    Fragment(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: UpstreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct UpstreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub fn decode_line(line: &str) -> UpstreamLine {
    let line = line.trim();
    if line.is_empty() {
        return UpstreamLine::Skip;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return UpstreamLine::Skip;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return UpstreamLine::Done;
    }

    match serde_json::from_str::<UpstreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(UpstreamLine::Fragment)
            .unwrap_or(UpstreamLine::Skip),
        Err(error) => UpstreamLine::Malformed(error.to_string()),
    }
}

/// Splits a byte body into lines and yields the content fragments.
///
/// The sequence ends at the upstream `[DONE]` sentinel or at end of body,
/// whichever comes first. A transport error ends it with `Err`.
pub fn upstream_fragments<S, B, E>(body: S) -> WorkerStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(next) = body.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(error) => {
                    yield Err(UpstreamError::Transport(error.to_string()));
                    return;
                }
            };
            buffer.extend_from_slice(bytes.as_ref());

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let line = buffer.drain(..=index).collect::<Vec<u8>>();
                match decode_line(&String::from_utf8_lossy(&line)) {
                    UpstreamLine::Fragment(content) => {
                        yield Ok(content);
                    }
                    UpstreamLine::Done => return,
                    UpstreamLine::Malformed(error) => {
                        debug!(error = %error, "dropping malformed upstream fragment");
                    }
                    UpstreamLine::Skip => {}
                }
            }
        }

        // Body ended without a trailing newline.
        if let UpstreamLine::Fragment(content) = decode_line(&String::from_utf8_lossy(&buffer)) {
            yield Ok(content);
        }
    }
    .boxed()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Prefill,
    Streaming,
    Done,
    Error,
}

impl RelayState {
    /// Next state after a fragment, and whether it carried the first token.
    pub fn on_fragment(self, fragment: &str) -> (RelayState, bool) {
        match self {
            RelayState::Prefill if !fragment.is_empty() => (RelayState::Streaming, true),
            state => (state, false),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Done | RelayState::Error)
    }
}

/// One downstream SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Chunk(ChatCompletionsChunk),
    Error(ErrorEnvelope),
    Done,
}

impl RelayFrame {
    pub fn data(&self) -> String {
        match self {
            RelayFrame::Chunk(chunk) => serialize_or_fallback(chunk),
            RelayFrame::Error(envelope) => serialize_or_fallback(envelope),
            RelayFrame::Done => DONE_SENTINEL.to_owned(),
        }
    }

    pub fn into_event(self) -> Event {
        Event::default().data(self.data())
    }
}

fn serialize_or_fallback<T: serde::Serialize>(payload: &T) -> String {
    match serde_json::to_string(payload) {
        Ok(serialized) => serialized,
        Err(error) => serde_json::json!({
            "error": {
                "message": format!("serialization error: {error}"),
                "type": "server_error"
            }
        })
        .to_string(),
    }
}

pub type RelayStream = BoxStream<'static, RelayFrame>;

/// Per-request relay. Owns the request's metrics so that dropping the
/// outbound stream (client disconnect) also drops the upstream read and
/// finishes the metrics as cancelled.
pub struct StreamRelay {
    response_id: String,
    created: i64,
    model: String,
    metrics: RequestMetrics,
}

impl StreamRelay {
    pub fn new(
        response_id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        metrics: RequestMetrics,
    ) -> Self {
        Self {
            response_id: response_id.into(),
            created,
            model: model.into(),
            metrics,
        }
    }

    /// Validation failure: one error frame and the sentinel. Never streams.
    pub fn reject(self, message: impl Into<String>) -> RelayStream {
        let StreamRelay { metrics, .. } = self;
        let envelope = ErrorEnvelope::new("invalid_request_error", message);
        metrics.finish(RequestStatus::Error);
        futures_util::stream::iter([RelayFrame::Error(envelope), RelayFrame::Done]).boxed()
    }

    pub fn run(self, worker: Arc<dyn Worker>, prompt: String, max_tokens: u32) -> RelayStream {
        let StreamRelay {
            response_id,
            created,
            model,
            mut metrics,
        } = self;

        async_stream::stream! {
            let mut state = RelayState::Init;

            let mut upstream = match worker.generate_stream(&prompt, max_tokens).await {
                Ok(upstream) => upstream,
                Err(error) => {
                    transition(&mut state, RelayState::Error, &response_id);
                    warn!(request_id = %response_id, worker = worker.name(), error = %error, "upstream stream failed to open");
                    metrics.finish(RequestStatus::Error);
                    yield upstream_error_frame(&error);
                    yield RelayFrame::Done;
                    return;
                }
            };
            transition(&mut state, RelayState::Prefill, &response_id);

            let outcome = loop {
                match upstream.next().await {
                    None => break Ok(()),
                    Some(Err(error)) => break Err(error),
                    Some(Ok(fragment)) => {
                        let (next, first_token) = state.on_fragment(&fragment);
                        if first_token {
                            if let Some(ttfb) = metrics.record_first_token() {
                                debug!(request_id = %response_id, ttfb_ms = ttfb.as_millis() as u64, "first token");
                            }
                        }
                        transition(&mut state, next, &response_id);
                        if fragment.is_empty() {
                            continue;
                        }
                        metrics.record_token(1);
                        yield RelayFrame::Chunk(ChatCompletionsChunk::delta(
                            &response_id,
                            created,
                            &model,
                            fragment,
                            first_token,
                        ));
                    }
                }
            };

            match outcome {
                Ok(()) => {
                    transition(&mut state, RelayState::Done, &response_id);
                    metrics.finish(RequestStatus::Success);
                    yield RelayFrame::Chunk(ChatCompletionsChunk::finish(&response_id, created, &model));
                }
                Err(error) => {
                    transition(&mut state, RelayState::Error, &response_id);
                    warn!(request_id = %response_id, worker = worker.name(), error = %error, "upstream stream failed");
                    metrics.finish(RequestStatus::Error);
                    yield upstream_error_frame(&error);
                }
            }
            yield RelayFrame::Done;
        }
        .boxed()
    }
}

fn transition(state: &mut RelayState, next: RelayState, request_id: &str) {
    if *state != next {
        debug!(request_id, from = ?*state, to = ?next, "relay state");
        *state = next;
    }
}

fn upstream_error_frame(error: &UpstreamError) -> RelayFrame {
    RelayFrame::Error(ErrorEnvelope::new("upstream_error", error.to_string()))
}
