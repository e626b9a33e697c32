use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::RwLock,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{
    config::Timeouts,
    feature::BackendDescriptor,
    worker::{UpstreamError, Worker, WorkerMode},
};

/// Lower bound on the background probe period.
pub const MIN_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

type WorkerFactory =
    dyn Fn(&BackendDescriptor) -> Result<Arc<dyn Worker>, UpstreamError> + Send + Sync;

/// Get-or-create cache of live workers keyed by resolved backend URL.
///
/// At most one worker exists per URL: the miss path re-checks and inserts
/// under the write lock, so concurrent first requests for the same URL all
/// receive the instance created by whichever got the lock first.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
    factory: Box<WorkerFactory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub url: String,
    pub worker: String,
    pub healthy: bool,
    pub latency_ms: u64,
}

impl WorkerRegistry {
    pub fn new(mode: WorkerMode, timeouts: Timeouts) -> Self {
        Self::with_factory(move |descriptor| mode.build(descriptor, timeouts))
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&BackendDescriptor) -> Result<Arc<dyn Worker>, UpstreamError> + Send + Sync + 'static,
    {
        Self {
            workers: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    pub async fn get_or_create(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<dyn Worker>, UpstreamError> {
        if let Some(worker) = self.workers.read().await.get(&descriptor.url) {
            return Ok(worker.clone());
        }

        let mut workers = self.workers.write().await;
        match workers.entry(descriptor.url.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let worker = (self.factory)(descriptor)?;
                info!(
                    backend = %descriptor.id,
                    url = %descriptor.url,
                    worker = worker.name(),
                    "worker created"
                );
                Ok(entry.insert(worker).clone())
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    fn snapshot(workers: &HashMap<String, Arc<dyn Worker>>) -> Vec<(String, Arc<dyn Worker>)> {
        let mut entries = workers
            .iter()
            .map(|(url, worker)| (url.clone(), worker.clone()))
            .collect::<Vec<_>>();
        entries.sort_by(|left, right| left.0.cmp(&right.0));
        entries
    }

    /// Probes every cached worker. The lock is released before probing.
    pub async fn check_once(&self) -> Vec<WorkerHealth> {
        let entries = Self::snapshot(&*self.workers.read().await);
        let mut report = Vec::with_capacity(entries.len());
        for (url, worker) in entries {
            let started = Instant::now();
            let healthy = worker.health_check().await;
            let latency_ms = started.elapsed().as_millis() as u64;
            if !healthy {
                warn!(%url, worker = worker.name(), latency_ms, "health check failed");
            }
            report.push(WorkerHealth {
                url,
                worker: worker.name().to_owned(),
                healthy,
                latency_ms,
            });
        }
        report
    }

    pub fn spawn_health_checks(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(period.max(MIN_HEALTH_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup is not a probe.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.check_once().await;
            }
        })
    }

    /// Closes and forgets every cached worker.
    pub async fn close_all(&self) {
        let drained = {
            let mut workers = self.workers.write().await;
            workers.drain().collect::<Vec<_>>()
        };
        for (url, worker) in drained {
            worker.close().await;
            info!(%url, worker = worker.name(), "worker closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        feature::{Backend, BackendTable},
        worker::echo::EchoWorker,
    };

    fn counting_registry() -> (Arc<WorkerRegistry>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let registry = WorkerRegistry::with_factory(move |descriptor| {
            counter.fetch_add(1, Ordering::SeqCst);
            let worker: Arc<dyn Worker> = Arc::new(EchoWorker::named(descriptor.url.clone()));
            Ok(worker)
        });
        (Arc::new(registry), created)
    }

    fn descriptor(id: Backend) -> BackendDescriptor {
        BackendDescriptor {
            id,
            url: BackendTable::default().url(id).to_owned(),
        }
    }

    #[tokio::test]
    async fn same_url_returns_same_instance() {
        let (registry, created) = counting_registry();
        let first = registry
            .get_or_create(&descriptor(Backend::Tgi))
            .await
            .expect("worker");
        let second = registry
            .get_or_create(&descriptor(Backend::Tgi))
            .await
            .expect("worker");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_urls_get_distinct_workers() {
        let (registry, created) = counting_registry();
        let vllm = registry
            .get_or_create(&descriptor(Backend::Vllm))
            .await
            .expect("worker");
        let trt = registry
            .get_or_create(&descriptor(Backend::Trt))
            .await
            .expect("worker");

        assert!(!Arc::ptr_eq(&vllm, &trt));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_creates_one_worker() {
        let (registry, created) = counting_registry();
        let target = descriptor(Backend::VllmQuant);

        let handles = (0..64)
            .map(|_| {
                let registry = registry.clone();
                let target = target.clone();
                tokio::spawn(async move { registry.get_or_create(&target).await })
            })
            .collect::<Vec<_>>();

        let mut workers = Vec::with_capacity(handles.len());
        for handle in handles {
            workers.push(handle.await.expect("task").expect("worker"));
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(workers
            .iter()
            .all(|worker| Arc::ptr_eq(worker, &workers[0])));
    }

    #[tokio::test]
    async fn factory_errors_are_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let registry = WorkerRegistry::with_factory(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(UpstreamError::Transport("no tls backend".to_owned()))
        });

        assert!(registry.get_or_create(&descriptor(Backend::Vllm)).await.is_err());
        assert!(registry.get_or_create(&descriptor(Backend::Vllm)).await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn close_all_closes_and_forgets_workers() {
        let (registry, _) = counting_registry();
        let worker = registry
            .get_or_create(&descriptor(Backend::Vllm))
            .await
            .expect("worker");
        assert!(worker.health_check().await);

        registry.close_all().await;

        assert!(registry.is_empty().await);
        assert!(!worker.health_check().await);
    }

    #[tokio::test]
    async fn health_report_covers_cached_workers() {
        let registry = WorkerRegistry::new(WorkerMode::Echo, Timeouts::default());
        registry
            .get_or_create(&descriptor(Backend::Vllm))
            .await
            .expect("worker");
        registry
            .get_or_create(&descriptor(Backend::Tgi))
            .await
            .expect("worker");

        let report = registry.check_once().await;
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|entry| entry.healthy));
        assert_eq!(report[0].url, "http://tgi:8000");
    }

    struct ProbeCounter {
        probes: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Worker for ProbeCounter {
        fn name(&self) -> &str {
            "probe-counter"
        }

        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String, UpstreamError> {
            Ok(String::new())
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<crate::worker::WorkerStream, UpstreamError> {
            Err(UpstreamError::InvalidResponse("not streaming".to_owned()))
        }

        async fn health_check(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn zero_probe_period_does_not_spin() {
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();
        let registry = Arc::new(WorkerRegistry::with_factory(move |_| {
            let worker: Arc<dyn Worker> = Arc::new(ProbeCounter {
                probes: counter.clone(),
            });
            Ok(worker)
        }));
        registry
            .get_or_create(&descriptor(Backend::Vllm))
            .await
            .expect("worker");

        let handle = registry.clone().spawn_health_checks(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert_eq!(probes.load(Ordering::SeqCst), 0);
    }
}
