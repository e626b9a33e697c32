use std::{env, net::SocketAddr, time::Duration};

use tracing::warn;

use crate::{
    feature::{Backend, BackendTable},
    registry::MIN_HEALTH_INTERVAL,
    worker::WorkerMode,
};

/// Connection limits applied to every HTTP worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub worker_mode: WorkerMode,
    pub backends: BackendTable,
    pub timeouts: Timeouts,
    pub default_max_tokens: u32,
    pub health_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            worker_mode: WorkerMode::Echo,
            backends: BackendTable::default(),
            timeouts: Timeouts::default(),
            default_max_tokens: 100,
            health_interval: Duration::from_secs(15),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let addr = env::var("GATEWAY_ADDR")
            .ok()
            .and_then(|value| value.parse::<SocketAddr>().ok())
            .unwrap_or(defaults.addr);

        let worker_mode = match env::var("GATEWAY_WORKER_TYPE") {
            Ok(value) => WorkerMode::parse(&value).unwrap_or_else(|| {
                warn!(worker_type = %value, "unknown worker type, falling back to echo");
                WorkerMode::Echo
            }),
            Err(_) => defaults.worker_mode,
        };

        let mut backends = defaults.backends;
        for backend in Backend::ALL {
            if let Some(url) = env::var(backend_url_var(backend))
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_owned())
                .filter(|value| !value.is_empty())
            {
                backends.set(backend, url);
            }
        }

        let timeouts = Timeouts {
            connect: Duration::from_secs(read_u64(
                "GATEWAY_CONNECT_TIMEOUT_SECS",
                defaults.timeouts.connect.as_secs(),
            )),
            request: Duration::from_secs(read_u64(
                "GATEWAY_REQUEST_TIMEOUT_SECS",
                defaults.timeouts.request.as_secs(),
            )),
        };

        Self {
            addr,
            worker_mode,
            backends,
            timeouts,
            default_max_tokens: read_u32("GATEWAY_DEFAULT_MAX_TOKENS", defaults.default_max_tokens),
            health_interval: health_interval(read_u64(
                "GATEWAY_HEALTH_INTERVAL_SECS",
                defaults.health_interval.as_secs(),
            )),
        }
    }
}

/// Probe period, never below one second.
fn health_interval(secs: u64) -> Duration {
    Duration::from_secs(secs).max(MIN_HEALTH_INTERVAL)
}

/// `vllm-quant` is read from `GATEWAY_BACKEND_URL_VLLM_QUANT`.
fn backend_url_var(backend: Backend) -> String {
    format!(
        "GATEWAY_BACKEND_URL_{}",
        backend.as_str().to_ascii_uppercase().replace('-', "_")
    )
}

pub(crate) fn read_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

pub(crate) fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}
