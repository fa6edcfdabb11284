//! Secret resolution
//!
//! Provider credentials are named references in configuration; the actual
//! values come from a `SecretStore` at wiring time and never appear in
//! config files or logs.

use crate::error::{VigilError, VigilResult};
use std::collections::HashMap;

/// `get(name) -> value` contract over whatever holds the secrets.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> VigilResult<String>;
}

/// Reads secrets from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> VigilResult<String> {
        std::env::var(name).map_err(|_| VigilError::NotFound {
            kind: "secret".into(),
            id: name.to_string(),
        })
    }
}

/// Fixed map of secrets for tests.
#[derive(Debug, Default)]
pub struct StaticSecretStore {
    values: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, name: &str) -> VigilResult<String> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| VigilError::NotFound {
                kind: "secret".into(),
                id: name.to_string(),
            })
    }
}
