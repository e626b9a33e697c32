use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::worker::{UpstreamError, Worker, WorkerStream};

const RESPONSE_FILLER: [&str; 9] = [
    "This", "is", "a", "simulated", "response", "from", "the", "echo", "worker.",
];
const STREAM_FILLER: [&str; 6] = ["This", "is", "a", "simulated", "streaming", "response."];

/// In-process worker that echoes the prompt back. No network involved.
#[derive(Debug)]
pub struct EchoWorker {
    name: String,
    prefill_delay: Duration,
    token_delay: Duration,
    closed: AtomicBool,
}

impl Default for EchoWorker {
    fn default() -> Self {
        Self {
            name: "echo".to_owned(),
            prefill_delay: Duration::from_millis(100),
            token_delay: Duration::from_millis(50),
            closed: AtomicBool::new(false),
        }
    }
}

impl EchoWorker {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, prefill_delay: Duration, token_delay: Duration) -> Self {
        self.prefill_delay = prefill_delay;
        self.token_delay = token_delay;
        self
    }

    fn ensure_open(&self) -> Result<(), UpstreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UpstreamError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for EchoWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, UpstreamError> {
        self.ensure_open()?;
        sleep(self.prefill_delay).await;
        Ok(render_words(prompt, max_tokens, &RESPONSE_FILLER).join(" "))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<WorkerStream, UpstreamError> {
        self.ensure_open()?;
        let words = render_words(prompt, max_tokens, &STREAM_FILLER);
        let prefill_delay = self.prefill_delay;
        let token_delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            sleep(prefill_delay).await;
            for word in words {
                if tx.send(Ok(format!("{word} "))).await.is_err() {
                    return;
                }
                sleep(token_delay).await;
            }
        });

        debug!(worker = %self.name, "echo stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn health_check(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn render_words(prompt: &str, max_tokens: u32, filler: &[&str]) -> Vec<String> {
    let limit = max_tokens as usize;
    let mut words = Vec::with_capacity(limit.min(64));
    words.push("Echo:".to_owned());
    words.extend(prompt.split_whitespace().take(limit).map(ToOwned::to_owned));
    words.extend(filler.iter().map(|word| (*word).to_owned()));
    words.truncate(limit);
    words
}
