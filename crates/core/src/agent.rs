//! `Agent` trait shape shared by the Architect/Coder/Tester/Debugger
//! handlers (§4.7): a single `(request) -> result` method tagged by
//! `AgentRole` rather than dispatched through subclassing, per Design
//! Note §9.

use async_trait::async_trait;
use polyagent_common::error::Result;
use polyagent_common::types::{AgentRole, TaskRequest, TaskResult};

/// A handler consuming dispatched tasks for one agent role.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The role this handler subscribes to on `agent.requests`.
    fn role(&self) -> AgentRole;

    /// Handle one dispatched task and produce a result. Implementations
    /// own their own retries against the `RequestRouter`; the orchestrator
    /// only sees the final `TaskResult`.
    async fn handle(&self, request: TaskRequest) -> Result<TaskResult>;

    /// Lightweight liveness probe used by `status`/`list` CLI output.
    async fn health_check(&self) -> Result<AgentHealth>;
}

/// Agent health information surfaced to operators.
#[derive(Debug, Clone)]
pub struct AgentHealth {
    pub healthy: bool,
    pub last_error: Option<String>,
}
