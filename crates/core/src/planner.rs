//! `Planner` contract (§4.5): turns free-form input into a validated
//! `TodoList`. The planner never executes anything; side effects (file
//! writes) live in the CLI glue per §4.5 design decision.

use async_trait::async_trait;
use polyagent_common::error::Result;
use polyagent_common::types::TodoList;

/// Optional hints the caller has already extracted from the request
/// (recognized indicators, entry/exit phrasings, numeric parameters -
/// §4.5 step 2). Opaque to the planner beyond being embedded in the
/// prompt context block.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub hints: Vec<String>,
}

/// Diagnostics about how many attempts a `plan` call needed, surfaced for
/// scenario 3 ("Planner schema repair") and CLI introspection.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub todo_list: TodoList,
    pub attempts: u32,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, user_request: &str, context: PlanContext) -> Result<PlanOutcome>;
}
