//! Configuration management, layered file + environment (§6 "Environment
//! variables").

use std::collections::HashMap;
use std::path::Path;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use secrecy::Secret;
use serde::{Deserialize, Serialize};

/// Top-level configuration, composed of one section per ambient concern
/// plus the router/orchestrator tunables named in spec §5/§6.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub router: RouterConfig,
    pub key_manager: KeyManagerConfig,
    pub orchestrator: OrchestratorConfig,
    pub iterative_loop: IterativeLoopConfig,
    pub secret_store: SecretStoreConfig,
    pub observability: ObservabilityConfig,
    pub security: SecurityConfig,
}

/// RequestRouter tunables (§4.3 step 7, §6 env vars).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multi_key_router_enabled: bool,
    pub default_temperature: f32,
    pub default_max_output_tokens: u32,
}

/// KeyManager + rate-limit store tunables (§4.2).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyManagerConfig {
    pub redis_url: String,
    pub key_store_path: String,
    pub default_cooldown_seconds: u64,
    pub secret_fetch_failure_cooldown_seconds: u64,
}

/// Orchestrator tunables (§4.6, §5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
    pub default_timeout_seconds: u64,
    pub dag_max_depth: usize,
    pub max_branch_depth: u32,
    pub workflows_dir: String,
}

/// IterativeLoop tunables (§4.8).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IterativeLoopConfig {
    pub max_iterations: u32,
    pub auto_fix: bool,
    pub reports_dir: String,
}

/// Secret-store backend selection (`SECRET_STORE_TYPE`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretStoreConfig {
    pub kind: SecretStoreKind,
    #[serde(default)]
    pub vault_addr: Option<String>,
    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub azure_vault_url: Option<String>,
    /// Only used by the `env` backend: `<key_id> -> env var name`. Dev only.
    #[serde(default)]
    pub env_var_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStoreKind {
    Env,
    Vault,
    Aws,
    Azure,
}

/// Logging/tracing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Security-adjacent toggles (sandboxing, secret-pattern scanning).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub sandbox_enabled: bool,
    pub secret_scan_patterns: Vec<String>,
}

/// Per-provider LLM credentials (non-secret half; the secret half lives in
/// the `SecretStore`). Kept distinct from `ApiKey` (the runtime record the
/// `KeyManager` loads) so config deserialization doesn't need `Secret<T>`
/// here; `api_key_env` is consulted by the `env` `SecretStoreKind`.
// `Secret<T>` intentionally implements only `Deserialize`, never
// `Serialize` (the whole point is that a secret can't accidentally leak
// back out through a logged/persisted config snapshot), so this struct
// can't derive `Serialize` like its siblings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key_env: Secret<String>,
    pub timeout_ms: u64,
}

impl Config {
    /// Load configuration from `config.toml` (if present) layered with
    /// `POLYAGENT__`-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("router.max_retries", 3)?
            .set_default("router.base_backoff_ms", 500)?
            .set_default("router.max_backoff_ms", 30_000)?
            .set_default("router.multi_key_router_enabled", true)?
            .set_default("router.default_temperature", 0.3)?
            .set_default("router.default_max_output_tokens", 4096)?
            .set_default("key_manager.redis_url", "redis://127.0.0.1:6379")?
            .set_default("key_manager.key_store_path", "keys.json")?
            .set_default("key_manager.default_cooldown_seconds", 60)?
            .set_default("key_manager.secret_fetch_failure_cooldown_seconds", 60)?
            .set_default("orchestrator.max_concurrent_tasks", 8)?
            .set_default("orchestrator.default_timeout_seconds", 60)?
            .set_default("orchestrator.dag_max_depth", 50)?
            .set_default("orchestrator.max_branch_depth", 2)?
            .set_default("orchestrator.workflows_dir", "workflows")?
            .set_default("iterative_loop.max_iterations", 5)?
            .set_default("iterative_loop.auto_fix", true)?
            .set_default("iterative_loop.reports_dir", "reports")?
            .set_default("secret_store.kind", "env")?
            .set_default("observability.metrics_enabled", true)?
            .set_default("observability.metrics_port", 9090)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "json")?
            .set_default("security.sandbox_enabled", true)?
            .set_default::<_, Vec<String>>(
                "security.secret_scan_patterns",
                vec!["sk-[A-Za-z0-9]{20,}".to_string(), "AKIA[0-9A-Z]{16}".to_string()],
            )?;

        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(Environment::with_prefix("POLYAGENT").separator("__").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Validate cross-field invariants not expressible as defaults.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.router.max_retries > 10 {
            errors.push("router.max_retries should be a small integer (<=10)".to_string());
        }
        if self.orchestrator.max_concurrent_tasks == 0 {
            errors.push("orchestrator.max_concurrent_tasks must be greater than 0".to_string());
        }
        if self.iterative_loop.max_iterations == 0 {
            errors.push("iterative_loop.max_iterations must be greater than 0".to_string());
        }
        if self.security.secret_scan_patterns.is_empty() {
            errors.push("security.secret_scan_patterns must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router: RouterConfig {
                max_retries: 3,
                base_backoff_ms: 500,
                max_backoff_ms: 30_000,
                multi_key_router_enabled: true,
                default_temperature: 0.3,
                default_max_output_tokens: 4096,
            },
            key_manager: KeyManagerConfig {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                key_store_path: "keys.json".to_string(),
                default_cooldown_seconds: 60,
                secret_fetch_failure_cooldown_seconds: 60,
            },
            orchestrator: OrchestratorConfig {
                max_concurrent_tasks: 8,
                default_timeout_seconds: 60,
                dag_max_depth: 50,
                max_branch_depth: 2,
                workflows_dir: "workflows".to_string(),
            },
            iterative_loop: IterativeLoopConfig {
                max_iterations: 5,
                auto_fix: true,
                reports_dir: "reports".to_string(),
            },
            secret_store: SecretStoreConfig {
                kind: SecretStoreKind::Env,
                vault_addr: None,
                aws_region: None,
                azure_vault_url: None,
                env_var_map: HashMap::new(),
            },
            observability: ObservabilityConfig {
                metrics_enabled: true,
                metrics_port: 9090,
                log_level: "info".to_string(),
                log_format: LogFormat::Json,
            },
            security: SecurityConfig {
                sandbox_enabled: true,
                secret_scan_patterns: vec!["sk-[A-Za-z0-9]{20,}".to_string(), "AKIA[0-9A-Z]{16}".to_string()],
            },
        }
    }
}
