//! Shared data model: `TodoList`/`TodoItem`, workflow and task runtime state,
//! message-bus events, API key metadata, conversations and contracts.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque task identifier, `^task_[A-Za-z0-9_-]+$` per the wire format.
pub type TaskId = String;

/// Workflow identifier, `wf_<hex>`.
pub type WorkflowId = String;

/// Opaque todo-list identifier.
pub type TodoListId = String;

/// Threads all events of one logical operation across channels.
pub type CorrelationId = String;

/// Generic metadata bag carried on most records.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Which handler a dispatched task is routed to. Closed set, per Design
/// Note §9 ("Dynamic dispatch -> tagged enum"): dispatch is a match on this
/// enum, never subclass-style polymorphism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Coder,
    Tester,
    Debugger,
    Optimizer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Tester => "tester",
            Self::Debugger => "debugger",
            Self::Optimizer => "optimizer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single acceptance test a `TodoItem` must pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub cmd: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub fixture: Option<String>,
    #[serde(default)]
    pub expected_exit_code: i32,
}

fn default_timeout_seconds() -> u64 {
    60
}

/// `{tests: [...]}` acceptance criteria attached to a `TodoItem`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptanceCriteria {
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

/// A unit of work inside a `TodoList`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub agent_role: AgentRole,
    pub priority: u8,
    #[serde(default)]
    pub dependencies: HashSet<TaskId>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub acceptance_criteria: AcceptanceCriteria,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    #[serde(default)]
    pub failure_routing: HashMap<String, AgentRole>,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub branch_reason: Option<String>,
    #[serde(default)]
    pub is_temporary: bool,
    #[serde(default)]
    pub max_debug_attempts: Option<u32>,
    /// Free-form extras (`target_file`, `iteration`, `fixture_path`, ...).
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_max_retries() -> u32 {
    3
}

impl TodoItem {
    /// `task_[A-Za-z0-9_-]+`
    pub fn id_is_well_formed(id: &str) -> bool {
        id.strip_prefix("task_")
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
    }
}

/// Root artifact produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoList {
    pub todo_list_id: TodoListId,
    pub workflow_name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub items: Vec<TodoItem>,
}

/// Workflow-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Per-task runtime status. Lifecycle: Pending -> Ready (all deps
/// Completed) -> Dispatched -> Running -> {Completed | Failed (->
/// Retrying up to `max_retries`, then terminal Failed)}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Dispatched,
    Running,
    Completed,
    Failed,
    Retrying,
}

/// A produced artifact reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Per-task runtime value owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    pub test_report_id: Option<String>,
}

impl TaskState {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
            artifacts: Vec::new(),
            test_report_id: None,
        }
    }
}

/// Workflow-owned runtime value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub todo_list_id: TodoListId,
    pub correlation_id: CorrelationId,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: HashMap<TaskId, TaskState>,
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn new(workflow_id: WorkflowId, todo_list_id: TodoListId, correlation_id: CorrelationId) -> Self {
        Self {
            workflow_id,
            todo_list_id,
            correlation_id,
            status: WorkflowStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tasks: HashMap::new(),
            error: None,
        }
    }
}

/// Fixed channel names the message bus dispatches on (§4.1/§6).
pub mod channels {
    pub const WORKFLOW_EVENTS: &str = "workflow.events";
    pub const AGENT_REQUESTS: &str = "agent.requests";
    pub const AGENT_RESULTS: &str = "agent.results";
    pub const TEST_RESULTS: &str = "test.results";
    pub const DEBUGGER_REQUESTS: &str = "debugger.requests";
}

/// Closed set of event kinds carried on the message bus (§6). Modeled as a
/// sum type over event kind per Design Note §9 ("Duck-typed message
/// payloads"), not an untyped map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventData {
    WorkflowCreated { todo_list_id: TodoListId },
    WorkflowCompleted { total_iterations: u32 },
    WorkflowFailed { first_failing_task: Option<TaskId> },
    WorkflowBranchCreated { branch_todo: TodoItem, parent_task_id: TaskId, branch_reason: String },
    TaskDispatched { task: TaskRequest },
    TaskCompleted { result: TaskResult },
    TaskFailed { result: TaskResult },
    TestStarted { task_id: TaskId },
    TestPassed { task_id: TaskId, metrics: Metadata },
    TestFailed { task_id: TaskId, failures: Vec<TestFailure> },
}

/// A message-bus event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub correlation_id: CorrelationId,
    pub workflow_id: Option<WorkflowId>,
    pub task_id: Option<TaskId>,
    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn new(source: impl Into<String>, correlation_id: impl Into<String>, data: EventData) -> Self {
        Self {
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            source: source.into(),
            correlation_id: correlation_id.into(),
            workflow_id: None,
            task_id: None,
            data,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// A single failing check reported by the tester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailure {
    pub check: String,
    pub message: String,
    pub trace: Option<String>,
}

/// Dispatch payload handed from orchestrator to agent handler (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub task_title: String,
    pub task_description: String,
    pub agent_role: AgentRole,
    pub correlation_id: CorrelationId,
    pub workflow_id: WorkflowId,
    pub acceptance_criteria: AcceptanceCriteria,
    pub contract_path: Option<String>,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    #[serde(default)]
    pub fixture_paths: Vec<String>,
    #[serde(default)]
    pub failure_routing: HashMap<String, AgentRole>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Validation summary a handler attaches to its result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Result handed back from agent handler to orchestrator (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: String,
    pub status: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    pub validation: ValidationOutcome,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

/// Workload tier used to steer key selection (§4.2/§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    Light,
    Medium,
    Heavy,
}

impl Workload {
    pub fn escalate(self) -> Option<Self> {
        match self {
            Self::Light => Some(Self::Medium),
            Self::Medium => Some(Self::Heavy),
            Self::Heavy => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }
}

/// Metadata for an LLM credential. Secrets are never stored here; fetched
/// on demand from the `SecretStore` via `key_id` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_id: String,
    pub model_name: String,
    pub provider: String,
    pub rpm: u32,
    pub tpm: u32,
    #[serde(default)]
    pub rpd: Option<u32>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub workload: Option<Workload>,
    pub active: bool,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A role-tagged message inside a `Conversation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub tokens: Option<u32>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Per-session LLM history; append-only (§4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub conv_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Architect output consumed by the Coder (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: String,
    pub interfaces: Vec<serde_json::Value>,
    pub data_models: Vec<serde_json::Value>,
    pub examples: Vec<serde_json::Value>,
    pub test_skeleton: String,
    #[serde(default)]
    pub fixtures: Vec<String>,
}
