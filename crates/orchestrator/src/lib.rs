#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Workflow engine: topological dispatch over a loaded `TodoList` (§4.6)
//! and the iterative fix loop that drives a workflow toward green tests
//! (§4.8). One facade (scheduler + dag executor + dispatcher) over a
//! dependency-ordered todo list rather than a flat task queue.

pub mod branch;
pub mod dag;
pub mod dispatcher;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use polyagent_common::classify::classify_failure;
use polyagent_common::error::{Error, Result};
use polyagent_common::metrics::{DefaultMetricsCollector, MetricsCollector};
use polyagent_common::types::{channels, AgentRole, Event, EventData, TaskStatus, TodoList, WorkflowId, WorkflowState, WorkflowStatus};
use polyagent_core::bus::MessageBus;
use polyagent_core::orchestrator::{IterationRecord, IterativeLoop, IterativeReport, Orchestrator, WorkflowSummary};
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub use dispatcher::{AgentRegistry, TaskDispatcher};
pub use store::WorkflowStore;

/// Concrete `Orchestrator`/`IterativeLoop` implementation wiring the
/// `WorkflowStore`, `TaskDispatcher` and message bus together.
pub struct Engine {
    store: WorkflowStore,
    dispatcher: TaskDispatcher,
    bus: Arc<dyn MessageBus>,
    max_branch_depth: u32,
    metrics: Arc<dyn MetricsCollector>,
}

impl Engine {
    pub fn new(workflows_dir: impl Into<std::path::PathBuf>, agents: AgentRegistry, bus: Arc<dyn MessageBus>, max_branch_depth: u32) -> Self {
        Self::with_metrics(workflows_dir, agents, bus, max_branch_depth, Arc::new(DefaultMetricsCollector))
    }

    /// Same as `new`, but with an injected `MetricsCollector`.
    pub fn with_metrics(
        workflows_dir: impl Into<std::path::PathBuf>,
        agents: AgentRegistry,
        bus: Arc<dyn MessageBus>,
        max_branch_depth: u32,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self { store: WorkflowStore::new(workflows_dir), dispatcher: TaskDispatcher::new(agents, bus.clone()), bus, max_branch_depth, metrics }
    }

    async fn publish_workflow_event(&self, workflow_id: &WorkflowId, correlation_id: &str, data: EventData) -> Result<()> {
        self.bus
            .publish(channels::WORKFLOW_EVENTS, Event::new("orchestrator", correlation_id, data).with_workflow(workflow_id.clone()))
            .await
    }

    /// Dispatches every task currently `Ready` (all dependencies
    /// `Completed`), in topological order, stopping early if the workflow
    /// is cancelled mid-run (§5 "Cancellation and timeouts").
    async fn dispatch_ready_tasks(&self, workflow_id: &WorkflowId) -> Result<()> {
        let handle = self.store.workflow_handle(workflow_id)?;
        let todo_list_id = handle.read().todo_list_id.clone();
        let correlation_id = handle.read().correlation_id.clone();
        let list = self.store.get_todo_list(&todo_list_id)?;
        let order = dag::topological_order(&list.items)?;
        let items_by_id: std::collections::HashMap<&str, &polyagent_common::types::TodoItem> =
            list.items.iter().map(|i| (i.id.as_str(), i)).collect();

        for task_id in &order {
            if handle.read().status == WorkflowStatus::Cancelled {
                info!(workflow_id = %workflow_id, "workflow cancelled, halting dispatch");
                break;
            }

            let already_done = matches!(handle.read().tasks.get(task_id).map(|t| t.status), Some(TaskStatus::Completed));
            if already_done {
                continue;
            }

            let deps_ok = items_by_id[task_id.as_str()]
                .dependencies
                .iter()
                .all(|dep| matches!(handle.read().tasks.get(dep).map(|t| t.status), Some(TaskStatus::Completed)));
            if !deps_ok {
                let mut state = handle.write();
                if let Some(task) = state.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Failed;
                    task.error = Some("a dependency failed".to_string());
                }
                continue;
            }

            let item = items_by_id[task_id.as_str()];
            let current = handle.read().tasks.get(task_id).cloned().ok_or_else(|| Error::Internal(format!("missing task state {task_id}")))?;
            let updated = self.dispatcher.dispatch_one(workflow_id, &correlation_id, item, current).await?;
            handle.write().tasks.insert(task_id.clone(), updated);
        }

        Ok(())
    }
}

#[async_trait]
impl Orchestrator for Engine {
    #[instrument(skip(self, blob))]
    async fn load_todo_list(&self, blob: &str) -> Result<String> {
        let stripped = polyagent_planner::validate::strip_markdown_fence(blob);
        let list: TodoList = serde_json::from_str(stripped)?;
        polyagent_planner::validate::validate_schema(&list)?;
        polyagent_planner::validate::validate_dependency_graph(&list)?;
        Ok(self.store.insert_todo_list(list))
    }

    #[instrument(skip(self))]
    async fn create_workflow(&self, todo_list_id: &str) -> Result<WorkflowId> {
        let correlation_id = format!("corr_{}", Uuid::new_v4().simple());
        let workflow_id = self.store.create_workflow(todo_list_id, &correlation_id)?;
        self.publish_workflow_event(&workflow_id, &correlation_id, EventData::WorkflowCreated { todo_list_id: todo_list_id.to_string() }).await?;
        Ok(workflow_id)
    }

    #[instrument(skip(self))]
    async fn execute_workflow(&self, workflow_id: &str) -> Result<WorkflowSummary> {
        // §5 "Workflow cancellation": a Cancelled workflow accepts no new
        // dispatch. Don't clobber that status back to Running just because
        // a caller invoked execute_workflow again.
        if self.store.snapshot(workflow_id)?.status != WorkflowStatus::Cancelled {
            self.store.set_status(workflow_id, WorkflowStatus::Running)?;
            self.dispatch_ready_tasks(&workflow_id.to_string()).await?;
        }

        let state = self.store.snapshot(workflow_id)?;
        let first_failing_task = state.tasks.values().find(|t| t.status == TaskStatus::Failed).map(|t| t.task_id.clone());
        let correlation_id = state.correlation_id.clone();

        let final_status = if state.status == WorkflowStatus::Cancelled {
            WorkflowStatus::Cancelled
        } else if first_failing_task.is_some() {
            WorkflowStatus::Failed
        } else if state.tasks.values().all(|t| t.status == TaskStatus::Completed) {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Running
        };
        self.store.set_status(workflow_id, final_status)?;

        match final_status {
            WorkflowStatus::Completed => {
                self.publish_workflow_event(&workflow_id.to_string(), &correlation_id, EventData::WorkflowCompleted { total_iterations: 1 }).await?;
            }
            WorkflowStatus::Failed => {
                self.publish_workflow_event(
                    &workflow_id.to_string(),
                    &correlation_id,
                    EventData::WorkflowFailed { first_failing_task: first_failing_task.clone() },
                )
                .await?;
            }
            _ => {}
        }

        let state = self.store.snapshot(workflow_id)?;
        Ok(WorkflowSummary { workflow_id: workflow_id.to_string(), state, first_failing_task })
    }

    #[instrument(skip(self))]
    async fn reload_workflow_tasks(&self, workflow_id: &str) -> Result<()> {
        self.store.sync_new_tasks(workflow_id)
    }

    async fn status(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.store.snapshot(workflow_id)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowState>> {
        Ok(self.store.list_snapshots())
    }

    #[instrument(skip(self))]
    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        self.store.set_status(workflow_id, WorkflowStatus::Cancelled)
    }
}

#[async_trait]
impl IterativeLoop for Engine {
    /// Drives `workflow_id` toward green tests (§4.8). Each round
    /// dispatches every `Ready` task, then looks only at tasks that failed
    /// *this round* (`completed_at >= iteration_start_time`) so that a
    /// repair branch from a prior round isn't reclassified forever. A
    /// classified failure becomes a `task_branch_*` repair item routed
    /// through `failure_routing` or, absent an override, to the Debugger;
    /// once `max_branch_depth` is exhausted for a task the loop reports
    /// that task as the run's terminal failure.
    #[instrument(skip(self))]
    async fn run(&self, workflow_id: &str, max_iterations: u32) -> Result<IterativeReport> {
        let mut history = Vec::new();
        let workflow_id_owned = workflow_id.to_string();

        for iteration in 1..=max_iterations {
            let iteration_start = Utc::now();

            self.reload_workflow_tasks(workflow_id).await?;
            let summary = self.execute_workflow(workflow_id).await?;

            if summary.state.status == WorkflowStatus::Cancelled {
                self.metrics.record_iteration("cancelled");
                history.push(IterationRecord {
                    iteration,
                    status: "cancelled".to_string(),
                    timestamp: Utc::now(),
                    data: serde_json::json!({}),
                });
                let report = IterativeReport { workflow_id: workflow_id_owned, total_iterations: iteration, succeeded: false, history };
                self.store.write_iteration_report(&report);
                return Ok(report);
            }

            if summary.state.status == WorkflowStatus::Completed {
                self.metrics.record_iteration("completed");
                history.push(IterationRecord {
                    iteration,
                    status: "completed".to_string(),
                    timestamp: Utc::now(),
                    data: serde_json::json!({}),
                });
                let report = IterativeReport { workflow_id: workflow_id_owned, total_iterations: iteration, succeeded: true, history };
                self.store.write_iteration_report(&report);
                return Ok(report);
            }

            let fresh_failures: Vec<_> = summary
                .state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed && t.completed_at.map(|ts| ts >= iteration_start).unwrap_or(false))
                .cloned()
                .collect();

            if fresh_failures.is_empty() {
                self.metrics.record_iteration("stalled");
                history.push(IterationRecord {
                    iteration,
                    status: "stalled".to_string(),
                    timestamp: Utc::now(),
                    data: serde_json::json!({}),
                });
                let report = IterativeReport { workflow_id: workflow_id_owned, total_iterations: iteration, succeeded: false, history };
                self.store.write_iteration_report(&report);
                return Ok(report);
            }

            // §8 boundary behavior "max_iterations = 1: ... no repair tasks
            // synthesized after first failure": a repair item would never
            // get dispatched once the budget is spent, so skip synthesis on
            // the final allotted iteration rather than leaving a dead
            // branch item in the persisted todo list.
            if iteration == max_iterations {
                self.metrics.record_iteration("exhausted");
                history.push(IterationRecord {
                    iteration,
                    status: "exhausted".to_string(),
                    timestamp: Utc::now(),
                    data: serde_json::json!({ "failing_tasks": fresh_failures.iter().map(|f| f.task_id.clone()).collect::<Vec<_>>() }),
                });
                let report = IterativeReport { workflow_id: workflow_id_owned, total_iterations: iteration, succeeded: false, history };
                self.store.write_iteration_report(&report);
                return Ok(report);
            }

            let todo_list_id = summary.state.todo_list_id.clone();
            let list = self.store.get_todo_list(&todo_list_id)?;

            let mut branched_any = false;
            for failure in &fresh_failures {
                let Some(parent) = list.items.iter().find(|i| i.id == failure.task_id) else { continue };
                let error_text = failure.error.clone().unwrap_or_default();
                let classification = classify_failure(&error_text);

                match branch::build_branch_item(&list, parent, classification.kind.as_str(), AgentRole::Debugger, error_text.clone(), self.max_branch_depth) {
                    Ok(branch_item) => {
                        self.store.append_items(&todo_list_id, vec![branch_item.clone()])?;
                        self.metrics.record_branch_task(classification.kind.as_str(), "iterative_loop");
                        self.publish_workflow_event(
                            &workflow_id_owned,
                            &summary.state.correlation_id,
                            EventData::WorkflowBranchCreated {
                                branch_todo: branch_item,
                                parent_task_id: failure.task_id.clone(),
                                branch_reason: classification.kind.to_string(),
                            },
                        )
                        .await?;
                        branched_any = true;
                    }
                    Err(Error::BranchBudgetExceeded(task_id)) => {
                        warn!(task_id = %task_id, "branch budget exhausted, giving up on repair");
                    }
                    Err(e) => return Err(e),
                }
            }

            self.metrics.record_iteration("repairing");
            history.push(IterationRecord {
                iteration,
                status: "repairing".to_string(),
                timestamp: Utc::now(),
                data: serde_json::json!({ "failing_tasks": fresh_failures.iter().map(|f| f.task_id.clone()).collect::<Vec<_>>() }),
            });

            if !branched_any {
                let report = IterativeReport { workflow_id: workflow_id_owned, total_iterations: iteration, succeeded: false, history };
                self.store.write_iteration_report(&report);
                return Ok(report);
            }
        }

        self.metrics.record_iteration("exhausted");
        let report = IterativeReport { workflow_id: workflow_id_owned, total_iterations: max_iterations, succeeded: false, history };
        self.store.write_iteration_report(&report);
        Ok(report)
    }
}
