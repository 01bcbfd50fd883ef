//! `KeyManager` contract (§4.2): select a key with capacity, or a
//! structured "no capacity" error; track health/cooldown.

use async_trait::async_trait;
use polyagent_common::error::Result;
use polyagent_common::types::Workload;

/// Inputs to a key selection attempt.
#[derive(Debug, Clone, Default)]
pub struct KeySelectionRequest {
    pub model_preference: Option<String>,
    pub tokens_needed: u32,
    pub excluded: Vec<String>,
    pub workload: Option<Workload>,
}

/// A usable credential returned by a successful selection.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub key_id: String,
    pub secret: secrecy::SecretString,
    pub model: String,
    pub provider: String,
}

/// Per-key status surfaced for introspection (§2 supplemented feature).
#[derive(Debug, Clone)]
pub struct KeyStatus {
    pub key_id: String,
    pub active: bool,
    pub model: String,
    pub provider: String,
    pub in_cooldown: bool,
    pub cooldown_ttl_seconds: Option<u64>,
    pub rpm_used: u32,
    pub rpm_limit: u32,
    pub tpm_used: u32,
    pub tpm_limit: u32,
}

/// Aggregate health snapshot (§4.2 "Observable properties").
#[derive(Debug, Clone)]
pub struct KeyManagerHealth {
    pub healthy: bool,
    pub total_keys: usize,
    pub active_keys: usize,
    pub keys_in_cooldown: usize,
    pub rate_store_healthy: bool,
}

#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Run the selection algorithm of §4.2: workload/model narrowing,
    /// priority+jitter ordering, per-candidate atomic reservation, and the
    /// two fallback passes (no-workload, then no-model-preference).
    /// Returns `Error::AllKeysExhausted` if no candidate has capacity
    /// after both fallbacks.
    async fn select_key(&self, request: KeySelectionRequest) -> Result<SelectedKey>;

    /// Explicitly mark a key unhealthy, placing it in cooldown for
    /// `duration_seconds`.
    async fn mark_key_unhealthy(&self, key_id: &str, duration_seconds: u64, reason: &str) -> Result<()>;

    async fn get_key_status(&self, key_id: &str) -> Result<KeyStatus>;

    async fn get_all_key_statuses(&self) -> Result<Vec<KeyStatus>>;

    async fn health_check(&self) -> Result<KeyManagerHealth>;

    /// Reload the active key set from the backing store.
    async fn reload_keys(&self) -> Result<()>;
}
