//! Task dispatch (§4.6 "Dispatch protocol"): builds a `TaskRequest`,
//! publishes `TASK_DISPATCHED`, invokes the target `Agent` handler
//! synchronously (the in-process variant of §4.1), and interprets the
//! `TaskResult` into a `TaskState` transition.

use std::collections::HashMap;
use std::sync::Arc;

use polyagent_common::error::Result;
use polyagent_common::types::{
    channels, AgentRole, Event, EventData, TaskId, TaskResult, TaskState, TaskStatus, TodoItem, ValidationOutcome, WorkflowId,
};
use polyagent_core::bus::MessageBus;
use polyagent_core::Agent;
use tracing::{info, instrument, warn};

pub type AgentRegistry = HashMap<AgentRole, Arc<dyn Agent>>;

pub struct TaskDispatcher {
    agents: AgentRegistry,
    bus: Arc<dyn MessageBus>,
}

impl TaskDispatcher {
    pub fn new(agents: AgentRegistry, bus: Arc<dyn MessageBus>) -> Self {
        Self { agents, bus }
    }

    /// Runs one task to a terminal outcome: Completed or terminally Failed
    /// (§4.6 step d). A failure with attempts remaining transitions
    /// through Retrying and is immediately re-dispatched in a loop rather
    /// than handed back to the caller, matching "transition to Retrying,
    /// re-dispatch" as one step of a single `dispatch_one` call.
    #[instrument(skip(self, item, state), fields(task_id = %item.id, agent_role = %item.agent_role))]
    pub async fn dispatch_one(&self, workflow_id: &WorkflowId, correlation_id: &str, item: &TodoItem, mut state: TaskState) -> Result<TaskState> {
        let Some(agent) = self.agents.get(&item.agent_role) else {
            state.status = TaskStatus::Failed;
            state.error = Some(format!("no agent registered for role {}", item.agent_role));
            return Ok(state);
        };

        loop {
            state.status = TaskStatus::Dispatched;
            if state.started_at.is_none() {
                state.started_at = Some(chrono::Utc::now());
            }

            let request = polyagent_common::types::TaskRequest {
                task_id: item.id.clone(),
                task_title: item.title.clone(),
                task_description: item.description.clone(),
                agent_role: item.agent_role,
                correlation_id: correlation_id.to_string(),
                workflow_id: workflow_id.clone(),
                acceptance_criteria: item.acceptance_criteria.clone(),
                contract_path: item.metadata.get("contract_path").and_then(|v| v.as_str()).map(str::to_string),
                input_artifacts: item.input_artifacts.clone(),
                output_artifacts: item.output_artifacts.clone(),
                fixture_paths: item.acceptance_criteria.tests.iter().filter_map(|t| t.fixture.clone()).collect(),
                failure_routing: item.failure_routing.clone(),
                metadata: item.metadata.clone(),
            };

            self.bus
                .publish(
                    channels::AGENT_REQUESTS,
                    Event::new("orchestrator", correlation_id, EventData::TaskDispatched { task: request.clone() })
                        .with_workflow(workflow_id.clone())
                        .with_task(item.id.clone()),
                )
                .await?;

            state.status = TaskStatus::Running;
            info!(retry_count = state.retry_count, "dispatched task to agent");

            let result: TaskResult = match agent.handle(request).await {
                Ok(result) => result,
                Err(e) => TaskResult {
                    task_id: item.id.clone(),
                    agent_id: item.agent_role.to_string(),
                    status: "failed".to_string(),
                    artifacts: Vec::new(),
                    validation: ValidationOutcome { success: false, errors: vec![e.to_string()], warnings: vec![] },
                    duration_seconds: 0.0,
                    error: Some(e.to_string()),
                },
            };

            state.completed_at = Some(chrono::Utc::now());
            state.artifacts = result.artifacts.clone();

            let completed = matches!(result.status.as_str(), "completed" | "ready" | "success");
            if completed {
                state.status = TaskStatus::Completed;
                state.error = None;
                self.publish_result(workflow_id, correlation_id, &item.id, EventData::TaskCompleted { result }).await?;
                return Ok(state);
            }

            state.error = result.error.clone();
            let attempts_remain = state.retry_count < item.max_retries;
            self.publish_result(workflow_id, correlation_id, &item.id, EventData::TaskFailed { result }).await?;

            if !attempts_remain {
                state.status = TaskStatus::Failed;
                warn!(task_id = %item.id, "task terminally failed after exhausting retries");
                return Ok(state);
            }

            state.status = TaskStatus::Retrying;
            state.retry_count += 1;
        }
    }

    async fn publish_result(&self, workflow_id: &WorkflowId, correlation_id: &str, task_id: &TaskId, data: EventData) -> Result<()> {
        self.bus
            .publish(
                channels::AGENT_RESULTS,
                Event::new("orchestrator", correlation_id, data).with_workflow(workflow_id.clone()).with_task(task_id.clone()),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use polyagent_bus::InProcessBus;
    use polyagent_common::types::{AcceptanceCriteria, TaskRequest};
    use std::collections::{HashMap, HashSet};

    mock! {
        TestAgent {}

        #[async_trait::async_trait]
        impl Agent for TestAgent {
            fn role(&self) -> AgentRole;
            async fn handle(&self, request: TaskRequest) -> Result<TaskResult>;
            async fn health_check(&self) -> Result<polyagent_core::agent::AgentHealth>;
        }
    }

    fn item(id: &str, max_retries: u32) -> TodoItem {
        TodoItem {
            id: id.to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            agent_role: AgentRole::Coder,
            priority: 1,
            dependencies: HashSet::new(),
            max_retries,
            timeout_seconds: 60,
            acceptance_criteria: AcceptanceCriteria::default(),
            input_artifacts: vec![],
            output_artifacts: vec![],
            failure_routing: HashMap::new(),
            parent_id: None,
            branch_reason: None,
            is_temporary: false,
            max_debug_attempts: None,
            metadata: HashMap::new(),
        }
    }

    fn ok_result(task_id: &str) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            agent_id: "coder".to_string(),
            status: "completed".to_string(),
            artifacts: vec![],
            validation: ValidationOutcome { success: true, errors: vec![], warnings: vec![] },
            duration_seconds: 0.1,
            error: None,
        }
    }

    fn failed_result(task_id: &str) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            agent_id: "coder".to_string(),
            status: "failed".to_string(),
            artifacts: vec![],
            validation: ValidationOutcome { success: false, errors: vec!["boom".to_string()], warnings: vec![] },
            duration_seconds: 0.1,
            error: Some("boom".to_string()),
        }
    }

    fn registry(agent: MockTestAgent) -> AgentRegistry {
        let mut agents: AgentRegistry = HashMap::new();
        agents.insert(AgentRole::Coder, Arc::new(agent));
        agents
    }

    #[tokio::test]
    async fn successful_task_transitions_to_completed() {
        let mut agent = MockTestAgent::new();
        agent.expect_role().return_const(AgentRole::Coder);
        agent.expect_handle().times(1).returning(|req| Ok(ok_result(&req.task_id)));

        let dispatcher = TaskDispatcher::new(registry(agent), Arc::new(InProcessBus::new()));
        let state = dispatcher.dispatch_one(&"wf_1".to_string(), "corr_1", &item("task_1", 2), TaskState::new("task_1".to_string())).await.unwrap();

        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.retry_count, 0);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn retries_up_to_max_retries_then_terminally_fails() {
        let mut agent = MockTestAgent::new();
        agent.expect_role().return_const(AgentRole::Coder);
        // max_retries = 2 means 3 total attempts, all failing.
        agent.expect_handle().times(3).returning(|req| Ok(failed_result(&req.task_id)));

        let dispatcher = TaskDispatcher::new(registry(agent), Arc::new(InProcessBus::new()));
        let state = dispatcher.dispatch_one(&"wf_1".to_string(), "corr_1", &item("task_1", 2), TaskState::new("task_1".to_string())).await.unwrap();

        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn max_retries_zero_means_one_attempt_only() {
        let mut agent = MockTestAgent::new();
        agent.expect_role().return_const(AgentRole::Coder);
        agent.expect_handle().times(1).returning(|req| Ok(failed_result(&req.task_id)));

        let dispatcher = TaskDispatcher::new(registry(agent), Arc::new(InProcessBus::new()));
        let state = dispatcher.dispatch_one(&"wf_1".to_string(), "corr_1", &item("task_1", 0), TaskState::new("task_1".to_string())).await.unwrap();

        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test]
    async fn succeeds_on_a_retry_after_an_initial_failure() {
        let mut agent = MockTestAgent::new();
        agent.expect_role().return_const(AgentRole::Coder);
        let mut call = 0;
        agent.expect_handle().times(2).returning(move |req| {
            call += 1;
            if call == 1 {
                Ok(failed_result(&req.task_id))
            } else {
                Ok(ok_result(&req.task_id))
            }
        });

        let dispatcher = TaskDispatcher::new(registry(agent), Arc::new(InProcessBus::new()));
        let state = dispatcher.dispatch_one(&"wf_1".to_string(), "corr_1", &item("task_1", 2), TaskState::new("task_1".to_string())).await.unwrap();

        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.retry_count, 1);
    }

    #[tokio::test]
    async fn no_agent_registered_for_role_fails_without_invoking_bus() {
        let agents: AgentRegistry = HashMap::new();
        let dispatcher = TaskDispatcher::new(agents, Arc::new(InProcessBus::new()));
        let state = dispatcher.dispatch_one(&"wf_1".to_string(), "corr_1", &item("task_1", 2), TaskState::new("task_1".to_string())).await.unwrap();

        assert_eq!(state.status, TaskStatus::Failed);
        assert!(state.error.unwrap().contains("no agent registered"));
    }
}
