//! Per-request backend selection from the `X-Backend` / `X-Quant` headers.
//!
//! Selection is fail-open: a missing or unrecognised header value resolves to
//! the default backend (or quant mode) instead of rejecting the request.

use std::{collections::HashMap, fmt};

use axum::http::HeaderMap;

pub const BACKEND_HEADER: &str = "x-backend";
pub const QUANT_HEADER: &str = "x-quant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    #[default]
    Vllm,
    VllmQuant,
    Tgi,
    TgiTp,
    Trt,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::Vllm,
        Backend::VllmQuant,
        Backend::Tgi,
        Backend::TgiTp,
        Backend::Trt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Vllm => "vllm",
            Backend::VllmQuant => "vllm-quant",
            Backend::Tgi => "tgi",
            Backend::TgiTp => "tgi-tp",
            Backend::Trt => "trt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|backend| backend.as_str() == value)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quantization hint. Informational only, it never changes routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quant {
    #[default]
    None,
    Awq,
    Int8,
    Fp8,
}

impl Quant {
    pub const ALL: [Quant; 4] = [Quant::None, Quant::Awq, Quant::Int8, Quant::Fp8];

    pub fn as_str(self) -> &'static str {
        match self {
            Quant::None => "none",
            Quant::Awq => "awq",
            Quant::Int8 => "int8",
            Quant::Fp8 => "fp8",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|quant| quant.as_str() == value)
    }
}

impl fmt::Display for Quant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static backend -> base URL table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTable {
    urls: HashMap<Backend, String>,
}

impl Default for BackendTable {
    fn default() -> Self {
        let urls = Backend::ALL
            .into_iter()
            .map(|backend| (backend, format!("http://{}:8000", backend.as_str())))
            .collect();
        Self { urls }
    }
}

impl BackendTable {
    pub fn set(&mut self, backend: Backend, url: impl Into<String>) {
        self.urls.insert(backend, url.into());
    }

    pub fn url(&self, backend: Backend) -> &str {
        self.urls
            .get(&backend)
            .or_else(|| self.urls.get(&Backend::default()))
            .map(String::as_str)
            .unwrap_or(DEFAULT_BACKEND_URL)
    }
}

const DEFAULT_BACKEND_URL: &str = "http://vllm:8000";

/// A backend id together with the URL it resolved to for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub id: Backend,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSelection {
    pub backend: BackendDescriptor,
    pub quant: Quant,
}

impl FeatureSelection {
    pub fn from_headers(headers: &HeaderMap, table: &BackendTable) -> Self {
        let backend = header_value(headers, BACKEND_HEADER)
            .and_then(Backend::parse)
            .unwrap_or_default();
        let quant = header_value(headers, QUANT_HEADER)
            .and_then(Quant::parse)
            .unwrap_or_default();

        Self {
            backend: BackendDescriptor {
                id: backend,
                url: table.url(backend).to_owned(),
            },
            quant,
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.backend.url
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
