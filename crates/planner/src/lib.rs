#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! `Planner` implementation (§4.5): LLM -> JSON `TodoList` with schema and
//! dependency-graph validation, retrying up to 3 times on rejection.

pub mod prompt;
pub mod validate;

use std::sync::Arc;

use async_trait::async_trait;
use polyagent_common::error::{Error, Result};
use polyagent_common::types::TodoList;
use polyagent_core::planner::{PlanContext, PlanOutcome, Planner};
use polyagent_core::router::{CompletionRequest, RequestRouter};
use tracing::{instrument, warn};
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 3;

pub struct LlmPlanner {
    router: Arc<dyn RequestRouter>,
    model_preference: Option<String>,
    max_output_tokens: u32,
}

impl LlmPlanner {
    pub fn new(router: Arc<dyn RequestRouter>, model_preference: Option<String>, max_output_tokens: u32) -> Self {
        Self { router, model_preference, max_output_tokens }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    #[instrument(skip(self, context))]
    async fn plan(&self, user_request: &str, context: PlanContext) -> Result<PlanOutcome> {
        let conversation_id = format!("plan_{}", Uuid::new_v4().simple());
        let mut user_prompt = prompt::build_user_prompt(user_request, &context);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = self
                .router
                .complete(CompletionRequest {
                    conversation_id: conversation_id.clone(),
                    system_prompt: Some(prompt::SCHEMA_SYSTEM_PROMPT.to_string()),
                    user_prompt: user_prompt.clone(),
                    model_preference: self.model_preference.clone(),
                    workload: None,
                    expected_completion_tokens: self.max_output_tokens,
                    max_output_tokens: self.max_output_tokens,
                    temperature: 0.3,
                })
                .await?;

            let stripped = validate::strip_markdown_fence(&outcome.content);

            let parsed: std::result::Result<TodoList, serde_json::Error> = serde_json::from_str(stripped);
            let todo_list = match parsed {
                Ok(list) => list,
                Err(e) => {
                    warn!(attempt, error = %e, "planner output failed to parse as JSON");
                    last_error = Some(Error::SchemaInvalid(e.to_string()));
                    user_prompt = prompt::build_repair_prompt(&user_prompt, &format!("JSON parse error: {e}"));
                    continue;
                }
            };

            if let Err(e) = validate::validate_schema(&todo_list) {
                warn!(attempt, error = %e, "planner output failed schema validation");
                user_prompt = prompt::build_repair_prompt(&user_prompt, &e.to_string());
                last_error = Some(e);
                continue;
            }

            if let Err(e) = validate::validate_dependency_graph(&todo_list) {
                warn!(attempt, error = %e, "planner output failed dependency graph validation");
                user_prompt = prompt::build_repair_prompt(&user_prompt, &e.to_string());
                last_error = Some(e);
                continue;
            }

            return Ok(PlanOutcome { todo_list, attempts: attempt });
        }

        Err(last_error.unwrap_or_else(|| Error::SchemaInvalid("planner exhausted retries".to_string())))
    }
}
