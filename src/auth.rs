use std::{collections::HashMap, env};

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::errors::AppError;

pub const DEV_API_KEY: &str = "sk-dev-default-key-12345";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key_id: String,
    pub rate_limit: u32,
}

/// Lookup side of the API key store. Key CRUD lives outside the gateway.
pub trait KeyStore: Send + Sync {
    fn verify(&self, api_key: &str) -> Option<KeyInfo>;
}

/// Fixed key set read from `GATEWAY_API_KEYS` at startup.
#[derive(Debug, Clone)]
pub struct StaticKeyStore {
    keys: HashMap<String, KeyInfo>,
}

impl StaticKeyStore {
    pub fn from_env() -> Self {
        let keys = env::var("GATEWAY_API_KEYS").unwrap_or_else(|_| DEV_API_KEY.to_owned());
        Self::from_keys(keys.split(','))
    }

    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let rate_limit = crate::config::read_u32("GATEWAY_KEY_RATE_LIMIT", 30);
        let mut keys = keys
            .into_iter()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| {
                let info = KeyInfo {
                    key_id: format!("key_{}", redact_key(key)),
                    rate_limit,
                };
                (key.to_owned(), info)
            })
            .collect::<HashMap<_, _>>();
        if keys.is_empty() {
            keys.insert(
                DEV_API_KEY.to_owned(),
                KeyInfo {
                    key_id: "default".to_owned(),
                    rate_limit,
                },
            );
        }
        Self { keys }
    }
}

impl KeyStore for StaticKeyStore {
    fn verify(&self, api_key: &str) -> Option<KeyInfo> {
        self.keys.get(api_key).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub key: KeyInfo,
}

pub fn authenticate(store: &dyn KeyStore, headers: &HeaderMap) -> Result<AuthContext, AppError> {
    let api_key = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Missing or invalid API key".to_owned()))?;

    let key = store
        .verify(api_key)
        .ok_or_else(|| AppError::Unauthorized("Invalid API key".to_owned()))?;
    Ok(AuthContext { key })
}

fn redact_key(key: &str) -> String {
    key.chars().take(8).collect()
}
