//! Polyagent CLI: submit/execute/test/iterate/status/list over a
//! workflow engine (§6 "Command-line interface"). Wires the same
//! config-load -> telemetry-init -> composition-root -> subcommand-dispatch
//! shape over a dependency-ordered todo list instead of a flat task queue.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polyagent_agents::{Architect, Coder, Debugger, Tester};
use polyagent_bus::InProcessBus;
use polyagent_common::types::{AgentRole, ApiKey};
use polyagent_common::Config;
use polyagent_core::bus::MessageBus;
use polyagent_core::orchestrator::{IterativeLoop, Orchestrator};
use polyagent_core::planner::{PlanContext, Planner};
use polyagent_core::router::RequestRouter;
use polyagent_orchestrator::{AgentRegistry, Engine};
use polyagent_planner::LlmPlanner;
use polyagent_router::providers::{anthropic::AnthropicClient, openai::OpenAiClient};
use polyagent_router::{build_secret_store, DefaultRequestRouter, InMemoryConversationStore, ProviderRegistry, RedisKeyManager};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "polyagent", about = "Plan, dispatch and iterate on LLM-driven coding workflows", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a free-form request into a todo list and persist it.
    Submit { request: String },
    /// Topologically dispatch every ready task in a workflow.
    Execute { workflow_id: String },
    /// Run (or re-run) the test phase for a workflow's ready tasks.
    Test { workflow_id: String },
    /// Drive a workflow's iterative fix loop for up to N rounds.
    Iterate {
        workflow_id: String,
        #[arg(default_value_t = 5)]
        max_iterations: u32,
    },
    /// Print a workflow's current state.
    Status { workflow_id: String },
    /// List every known workflow.
    List,
}

/// Wires the full dependency chain for one CLI invocation, following the
/// initialization order SecretStore/RateStore -> KeyManager ->
/// ConversationStore -> RequestRouter -> MessageBus -> Agents ->
/// Orchestrator -> IterativeLoop.
struct Runtime {
    engine: Engine,
    planner: LlmPlanner,
}

fn load_api_keys(path: &str) -> Vec<ApiKey> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(error = %e, path, "failed to parse key store, starting with no keys");
            Vec::new()
        }),
        Err(_) => {
            tracing::warn!(path, "key store file not found, starting with no keys");
            Vec::new()
        }
    }
}

fn build_provider_registry() -> ProviderRegistry {
    let openai_base = std::env::var("POLYAGENT_OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let anthropic_base = std::env::var("POLYAGENT_ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string());
    let timeout = std::time::Duration::from_secs(60);

    ProviderRegistry::new()
        .register(Arc::new(OpenAiClient::new(openai_base, timeout)))
        .register(Arc::new(AnthropicClient::new(anthropic_base, timeout)))
}

async fn build_runtime(config: &Config) -> Result<Runtime> {
    let metrics: Arc<dyn polyagent_common::metrics::MetricsCollector> = Arc::new(polyagent_common::metrics::DefaultMetricsCollector);

    let secret_store: Arc<dyn polyagent_router::SecretStore> = build_secret_store(&config.secret_store).into();
    let keys = load_api_keys(&config.key_manager.key_store_path);
    let key_manager = Arc::new(RedisKeyManager::with_metrics(
        keys,
        &config.key_manager.redis_url,
        secret_store,
        config.key_manager.default_cooldown_seconds,
        config.key_manager.secret_fetch_failure_cooldown_seconds,
        metrics.clone(),
    ));
    let conversations = Arc::new(InMemoryConversationStore::new());
    let providers = build_provider_registry();
    let router: Arc<dyn RequestRouter> = Arc::new(DefaultRequestRouter::with_metrics(
        key_manager,
        conversations,
        providers,
        config.router.max_retries,
        config.router.base_backoff_ms,
        config.router.max_backoff_ms,
        metrics.clone(),
    ));

    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());

    let mut agents: AgentRegistry = HashMap::new();
    agents.insert(AgentRole::Architect, Arc::new(Architect::new(router.clone(), "contracts/generated")));
    agents.insert(AgentRole::Coder, Arc::new(Coder::new(router.clone(), "Backtest/codes", "tests")));
    agents.insert(AgentRole::Tester, Arc::new(Tester::new(bus.clone(), "artifacts", &config.security.secret_scan_patterns)));
    agents.insert(AgentRole::Debugger, Arc::new(Debugger::new(&config.iterative_loop.reports_dir)));

    let engine = Engine::with_metrics(config.orchestrator.workflows_dir.clone(), agents, bus, config.orchestrator.max_branch_depth, metrics);
    let planner = LlmPlanner::new(router, None, config.router.default_max_output_tokens);

    Ok(Runtime { engine, planner })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {e}");
        }
        std::process::exit(2);
    }

    polyagent_common::telemetry::init_telemetry(&config.observability).context("failed to initialize telemetry")?;
    polyagent_common::metrics::init_metrics().context("failed to register metrics")?;

    let runtime = build_runtime(&config).await?;

    let exit_code = match cli.command {
        Commands::Submit { request } => cmd_submit(&runtime, &request).await,
        Commands::Execute { workflow_id } => cmd_execute(&runtime, &workflow_id).await,
        Commands::Test { workflow_id } => cmd_execute(&runtime, &workflow_id).await,
        Commands::Iterate { workflow_id, max_iterations } => cmd_iterate(&runtime, &workflow_id, max_iterations).await,
        Commands::Status { workflow_id } => cmd_status(&runtime, &workflow_id).await,
        Commands::List => cmd_list(&runtime).await,
    };

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn cmd_submit(runtime: &Runtime, request: &str) -> Result<i32> {
    let outcome = runtime.planner.plan(request, PlanContext::default()).await.context("planning failed")?;
    info!(attempts = outcome.attempts, task_count = outcome.todo_list.items.len(), "planned todo list");

    let blob = serde_json::to_string(&outcome.todo_list)?;
    let todo_list_id = runtime.engine.load_todo_list(&blob).await.context("failed to persist todo list")?;
    let workflow_id = runtime.engine.create_workflow(&todo_list_id).await.context("failed to create workflow")?;

    println!("{}", serde_json::json!({"todo_list_id": todo_list_id, "workflow_id": workflow_id, "attempts": outcome.attempts}));
    Ok(0)
}

async fn cmd_execute(runtime: &Runtime, workflow_id: &str) -> Result<i32> {
    let summary = runtime.engine.execute_workflow(workflow_id).await.context("execution failed")?;
    println!("{}", serde_json::to_string_pretty(&summary.state)?);
    Ok(exit_for_status(summary.state.status))
}

async fn cmd_iterate(runtime: &Runtime, workflow_id: &str, max_iterations: u32) -> Result<i32> {
    let report = runtime.engine.run(workflow_id, max_iterations).await.context("iterative loop failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.succeeded { 0 } else { 1 })
}

async fn cmd_status(runtime: &Runtime, workflow_id: &str) -> Result<i32> {
    let state = runtime.engine.status(workflow_id).await.context("failed to read workflow status")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(exit_for_status(state.status))
}

async fn cmd_list(runtime: &Runtime) -> Result<i32> {
    let workflows = runtime.engine.list_workflows().await.context("failed to list workflows")?;
    println!("{}", serde_json::to_string_pretty(&workflows)?);
    Ok(0)
}

fn exit_for_status(status: polyagent_common::types::WorkflowStatus) -> i32 {
    use polyagent_common::types::WorkflowStatus;
    match status {
        WorkflowStatus::Completed => 0,
        WorkflowStatus::Failed | WorkflowStatus::Cancelled => 1,
        WorkflowStatus::Created | WorkflowStatus::Running | WorkflowStatus::Paused => 0,
    }
}
