//! `SecretStore` interface (consumed, §6): `fetch(key_id) -> secret` with a
//! pluggable backend selected by `SECRET_STORE_TYPE`/`config.secret_store.kind`.
//! Only the `env` backend is implemented as more than a stub - per §6 it
//! "exists for development only"; `vault`/`aws`/`azure` are left as typed
//! placeholders a deployment wires up with the real client crate of its
//! choice.

use async_trait::async_trait;
use polyagent_common::config::{SecretStoreConfig, SecretStoreKind};
use polyagent_common::error::{Error, Result};
use secrecy::SecretString;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, key_id: &str) -> Result<SecretString>;
}

/// Development-only backend: resolves `key_id` through
/// `config.secret_store.env_var_map` to an environment variable name.
pub struct EnvSecretStore {
    env_var_map: std::collections::HashMap<String, String>,
}

impl EnvSecretStore {
    pub fn new(env_var_map: std::collections::HashMap<String, String>) -> Self {
        Self { env_var_map }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, key_id: &str) -> Result<SecretString> {
        let var_name = self
            .env_var_map
            .get(key_id)
            .ok_or_else(|| Error::SecretFetchError(key_id.to_string(), "no env_var_map entry".to_string()))?;
        let value = std::env::var(var_name)
            .map_err(|e| Error::SecretFetchError(key_id.to_string(), format!("env var {var_name} unset: {e}")))?;
        Ok(SecretString::new(value))
    }
}

/// Placeholder backends for non-dev deployments. A real deployment
/// supplies its own `SecretStore` impl backed by the `vault`/`aws-sdk-*`/
/// `azure_security_keyvault` client of its choice; these exist only so
/// `SecretStoreConfig::kind` routes to *something* at construction time.
pub struct UnconfiguredSecretStore {
    kind: &'static str,
}

#[async_trait]
impl SecretStore for UnconfiguredSecretStore {
    async fn fetch(&self, key_id: &str) -> Result<SecretString> {
        Err(Error::SecretFetchError(
            key_id.to_string(),
            format!("{} secret backend is not wired up in this deployment", self.kind),
        ))
    }
}

/// Build the configured `SecretStore` backend.
pub fn build_secret_store(config: &SecretStoreConfig) -> Box<dyn SecretStore> {
    match config.kind {
        SecretStoreKind::Env => Box::new(EnvSecretStore::new(config.env_var_map.clone())),
        SecretStoreKind::Vault => Box::new(UnconfiguredSecretStore { kind: "vault" }),
        SecretStoreKind::Aws => Box::new(UnconfiguredSecretStore { kind: "aws" }),
        SecretStoreKind::Azure => Box::new(UnconfiguredSecretStore { kind: "azure" }),
    }
}
