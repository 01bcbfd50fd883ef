//! `Orchestrator`/`IterativeLoop` contracts (§4.6, §4.8): a workflow
//! state-machine API rather than a generic `execute_task`/`submit_request`
//! DAG-executor trait; the topological-dispatch machinery itself lives in
//! `polyagent-orchestrator`.

use async_trait::async_trait;
use polyagent_common::error::Result;
use polyagent_common::types::{WorkflowId, WorkflowState};
use serde::{Deserialize, Serialize};

/// Returned by `execute_workflow`/`iterate` (§4.6, §4.8).
#[derive(Debug, Clone)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    pub first_failing_task: Option<String>,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Parse and validate a `TodoList` (schema + dependency graph per
    /// §3), persist it, and return its id.
    async fn load_todo_list(&self, blob: &str) -> Result<String>;

    /// Create a fresh `WorkflowState` bound to a loaded `TodoList`.
    async fn create_workflow(&self, todo_list_id: &str) -> Result<WorkflowId>;

    /// Topologically dispatch every `Ready` task to completion or
    /// terminal failure (§4.6 execution model).
    async fn execute_workflow(&self, workflow_id: &str) -> Result<WorkflowSummary>;

    /// Re-derive `Ready` tasks after the todo list backing a workflow has
    /// grown (branch/repair append, §4.6/§4.8).
    async fn reload_workflow_tasks(&self, workflow_id: &str) -> Result<()>;

    async fn status(&self, workflow_id: &str) -> Result<WorkflowState>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowState>>;

    /// Prevents new dispatch; in-flight tasks finish but their outcome is
    /// ignored for terminal state (§5 "Cancellation and timeouts").
    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()>;
}

/// One round of the iterative-fix loop (§4.8 "iteration_history").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: serde_json::Value,
}

/// Final report of a call to `IterativeLoop::run` (§4.8), persisted
/// verbatim as the `iteration_report_<workflow_id>_<timestamp>.json`
/// artifact (§2 supplemented feature, grounded in the original's
/// `_generate_final_report`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterativeReport {
    pub workflow_id: WorkflowId,
    pub total_iterations: u32,
    pub succeeded: bool,
    pub history: Vec<IterationRecord>,
}

#[async_trait]
pub trait IterativeLoop: Send + Sync {
    /// Drive `workflow_id` toward green tests, up to `max_iterations`
    /// rounds (§4.8 loop body).
    async fn run(&self, workflow_id: &str, max_iterations: u32) -> Result<IterativeReport>;
}
