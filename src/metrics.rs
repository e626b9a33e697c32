use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
    TextEncoder,
};
use tracing::debug;

const LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];
const TTFB_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const TOKENS_PER_REQUEST_BUCKETS: &[f64] = &[10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0];
const PROMPT_TOKEN_BUCKETS: &[f64] = &[
    10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0,
];

/// Prometheus instruments for per-request inference metrics.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_latency: HistogramVec,
    ttfb: HistogramVec,
    requests_total: IntCounterVec,
    active_requests: IntGaugeVec,
    tokens_generated: IntCounterVec,
    tokens_per_request: HistogramVec,
    prompt_tokens: HistogramVec,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_latency = HistogramVec::new(
            histogram_opts!(
                "llm_request_latency_seconds",
                "Time spent processing request (prefill + decode)",
                LATENCY_BUCKETS.to_vec()
            ),
            &["model", "status"],
        )
        .expect("valid request_latency metric");

        let ttfb = HistogramVec::new(
            histogram_opts!(
                "llm_ttfb_seconds",
                "Time to first byte (prefill latency)",
                TTFB_BUCKETS.to_vec()
            ),
            &["model"],
        )
        .expect("valid ttfb metric");

        let requests_total = IntCounterVec::new(
            opts!("llm_requests_total", "Total number of requests"),
            &["model", "status", "stream"],
        )
        .expect("valid requests_total metric");

        let active_requests = IntGaugeVec::new(
            opts!(
                "llm_active_requests",
                "Number of currently active requests"
            ),
            &["model"],
        )
        .expect("valid active_requests metric");

        let tokens_generated = IntCounterVec::new(
            opts!("llm_tokens_generated_total", "Total tokens generated"),
            &["model"],
        )
        .expect("valid tokens_generated metric");

        let tokens_per_request = HistogramVec::new(
            histogram_opts!(
                "llm_tokens_per_request",
                "Number of tokens generated per request",
                TOKENS_PER_REQUEST_BUCKETS.to_vec()
            ),
            &["model"],
        )
        .expect("valid tokens_per_request metric");

        let prompt_tokens = HistogramVec::new(
            histogram_opts!(
                "llm_prompt_tokens",
                "Number of tokens in the prompt",
                PROMPT_TOKEN_BUCKETS.to_vec()
            ),
            &["model"],
        )
        .expect("valid prompt_tokens metric");

        registry
            .register(Box::new(request_latency.clone()))
            .expect("register request_latency");
        registry
            .register(Box::new(ttfb.clone()))
            .expect("register ttfb");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("register requests_total");
        registry
            .register(Box::new(active_requests.clone()))
            .expect("register active_requests");
        registry
            .register(Box::new(tokens_generated.clone()))
            .expect("register tokens_generated");
        registry
            .register(Box::new(tokens_per_request.clone()))
            .expect("register tokens_per_request");
        registry
            .register(Box::new(prompt_tokens.clone()))
            .expect("register prompt_tokens");

        Self {
            registry,
            request_latency,
            ttfb,
            requests_total,
            active_requests,
            tokens_generated,
            tokens_per_request,
            prompt_tokens,
        }
    }

    pub fn active_requests(&self, model: &str) -> i64 {
        self.active_requests.with_label_values(&[model]).get()
    }

    pub fn request_count(&self, model: &str, status: RequestStatus, stream: bool) -> u64 {
        self.requests_total
            .with_label_values(&[model, status.as_str(), stream_label(stream)])
            .get()
    }

    pub fn ttfb_samples(&self, model: &str) -> u64 {
        self.ttfb.with_label_values(&[model]).get_sample_count()
    }

    pub fn ttfb_seconds_sum(&self, model: &str) -> f64 {
        self.ttfb.with_label_values(&[model]).get_sample_sum()
    }

    pub fn tokens_generated(&self, model: &str) -> u64 {
        self.tokens_generated.with_label_values(&[model]).get()
    }

    pub fn prompt_token_samples(&self, model: &str) -> u64 {
        self.prompt_tokens.with_label_values(&[model]).get_sample_count()
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn stream_label(stream: bool) -> &'static str {
    if stream {
        "true"
    } else {
        "false"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Error,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics lifecycle of a single request.
///
/// Construction is the `start` transition and bumps the in-flight gauge.
/// `finish` consumes the value, so it can run at most once; a value dropped
/// without finishing (handler future dropped, client gone mid-stream) is
/// finished as [`RequestStatus::Cancelled`], which keeps the gauge balanced
/// on every exit path.
pub struct RequestMetrics {
    metrics: Arc<AppMetrics>,
    model: String,
    stream: bool,
    started: Instant,
    first_token_at: Option<Instant>,
    prompt_recorded: bool,
    tokens: u64,
    finished: bool,
}

impl RequestMetrics {
    pub fn start(metrics: Arc<AppMetrics>, model: impl Into<String>, stream: bool) -> Self {
        let model = model.into();
        metrics.active_requests.with_label_values(&[&model]).inc();
        Self {
            metrics,
            model,
            stream,
            started: Instant::now(),
            first_token_at: None,
            prompt_recorded: false,
            tokens: 0,
            finished: false,
        }
    }

    pub fn record_prompt_tokens(&mut self, count: u32) {
        if self.prompt_recorded {
            return;
        }
        self.prompt_recorded = true;
        self.metrics
            .prompt_tokens
            .with_label_values(&[&self.model])
            .observe(f64::from(count));
    }

    /// Only the first call observes TTFB; later calls return `None`.
    pub fn record_first_token(&mut self) -> Option<Duration> {
        if self.first_token_at.is_some() {
            return None;
        }
        let now = Instant::now();
        self.first_token_at = Some(now);
        let ttfb = now.duration_since(self.started);
        self.metrics
            .ttfb
            .with_label_values(&[&self.model])
            .observe(ttfb.as_secs_f64());
        Some(ttfb)
    }

    pub fn record_token(&mut self, count: u64) {
        self.tokens = self.tokens.saturating_add(count);
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn finish(mut self, status: RequestStatus) -> Duration {
        self.complete(status)
    }

    fn complete(&mut self, status: RequestStatus) -> Duration {
        self.finished = true;
        let latency = self.started.elapsed();
        let model = self.model.as_str();

        self.metrics
            .request_latency
            .with_label_values(&[model, status.as_str()])
            .observe(latency.as_secs_f64());
        self.metrics
            .requests_total
            .with_label_values(&[model, status.as_str(), stream_label(self.stream)])
            .inc();
        self.metrics.active_requests.with_label_values(&[model]).dec();

        if self.tokens > 0 {
            self.metrics
                .tokens_generated
                .with_label_values(&[model])
                .inc_by(self.tokens);
            self.metrics
                .tokens_per_request
                .with_label_values(&[model])
                .observe(self.tokens as f64);
        }

        debug!(
            model,
            status = %status,
            stream = self.stream,
            tokens = self.tokens,
            latency_ms = latency.as_millis() as u64,
            "request metrics finished"
        );
        latency
    }
}

impl Drop for RequestMetrics {
    fn drop(&mut self) {
        if !self.finished {
            self.complete(RequestStatus::Cancelled);
        }
    }
}
