//! Architect adapter (§4.7): turns a task's title/description/requirements
//! into a `Contract` the Coder builds against. Low-temperature completion,
//! escalated to a stronger model preference on a safety block rather than
//! giving up immediately.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use polyagent_common::error::{Error, Result};
use polyagent_common::types::{AgentRole, ArtifactRef, Contract, TaskRequest, TaskResult, ValidationOutcome};
use polyagent_core::agent::{Agent, AgentHealth};
use polyagent_core::router::{CompletionRequest, RequestRouter};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const LOW_TEMPERATURE: f32 = 0.1;
const ESCALATED_MODEL: &str = "gpt-4o";

pub struct Architect {
    router: Arc<dyn RequestRouter>,
    contracts_dir: PathBuf,
}

impl Architect {
    pub fn new(router: Arc<dyn RequestRouter>, contracts_dir: impl Into<PathBuf>) -> Self {
        Self { router, contracts_dir: contracts_dir.into() }
    }

    fn render_prompt(request: &TaskRequest) -> String {
        format!(
            "Design a contract for the following task.\n\nTitle: {}\nDescription: {}\n\n\
             Respond with a single JSON object with fields: interfaces (array), \
             data_models (array), examples (array), test_skeleton (string), fixtures (array of paths).",
            request.task_title, request.task_description
        )
    }

    fn parse_contract(&self, content: &str) -> Result<Contract> {
        let stripped = content.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
        let parsed: serde_json::Value = serde_json::from_str(stripped)?;
        Ok(Contract {
            contract_id: format!("contract_{}", Uuid::new_v4().simple()),
            interfaces: parsed.get("interfaces").cloned().unwrap_or_default().as_array().cloned().unwrap_or_default(),
            data_models: parsed.get("data_models").cloned().unwrap_or_default().as_array().cloned().unwrap_or_default(),
            examples: parsed.get("examples").cloned().unwrap_or_default().as_array().cloned().unwrap_or_default(),
            test_skeleton: parsed.get("test_skeleton").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            fixtures: parsed
                .get("fixtures")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        })
    }

    fn persist(&self, contract: &Contract) -> Result<ArtifactRef> {
        std::fs::create_dir_all(&self.contracts_dir)?;
        let path = self.contracts_dir.join(format!("{}.json", contract.contract_id));
        std::fs::write(&path, serde_json::to_vec_pretty(contract)?)?;
        Ok(ArtifactRef { path: path.to_string_lossy().to_string(), kind: "contract".to_string() })
    }
}

#[async_trait]
impl Agent for Architect {
    fn role(&self) -> AgentRole {
        AgentRole::Architect
    }

    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    async fn handle(&self, request: TaskRequest) -> Result<TaskResult> {
        let started = std::time::Instant::now();
        let conv_id = format!("conv_{}_{}", request.workflow_id, request.task_id);
        let prompt = Self::render_prompt(&request);

        let completion_request = CompletionRequest {
            conversation_id: conv_id,
            system_prompt: Some("You design minimal, testable interface contracts.".to_string()),
            user_prompt: prompt,
            model_preference: None,
            workload: None,
            expected_completion_tokens: 1024,
            max_output_tokens: 2048,
            temperature: LOW_TEMPERATURE,
        };

        let outcome = match self.router.complete(completion_request).await {
            Ok(outcome) => outcome,
            Err(Error::SafetyBlocked(reason)) => {
                warn!(reason = %reason, "architect retrying with escalated model preference after safety block");
                let retry_request = CompletionRequest {
                    conversation_id: format!("conv_{}_{}_retry", request.workflow_id, request.task_id),
                    system_prompt: Some("You design minimal, testable interface contracts.".to_string()),
                    user_prompt: Self::render_prompt(&request),
                    model_preference: Some(ESCALATED_MODEL.to_string()),
                    workload: None,
                    expected_completion_tokens: 1024,
                    max_output_tokens: 2048,
                    temperature: LOW_TEMPERATURE,
                };
                self.router.complete(retry_request).await?
            }
            Err(e) => return Err(e),
        };

        let contract = self.parse_contract(&outcome.content)?;
        let artifact = self.persist(&contract)?;
        info!(contract_id = %contract.contract_id, "architect produced contract");

        Ok(TaskResult {
            task_id: request.task_id,
            agent_id: "architect".to_string(),
            status: "completed".to_string(),
            artifacts: vec![artifact],
            validation: ValidationOutcome { success: true, errors: vec![], warnings: vec![] },
            duration_seconds: started.elapsed().as_secs_f64(),
            error: None,
        })
    }

    async fn health_check(&self) -> Result<AgentHealth> {
        Ok(AgentHealth { healthy: true, last_error: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use polyagent_common::types::AcceptanceCriteria;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> TaskRequest {
        TaskRequest {
            task_id: "task_architect_1".to_string(),
            task_title: "design contract".to_string(),
            task_description: "design a factorial interface".to_string(),
            agent_role: AgentRole::Architect,
            correlation_id: "corr_1".to_string(),
            workflow_id: "wf_1".to_string(),
            acceptance_criteria: AcceptanceCriteria::default(),
            contract_path: None,
            input_artifacts: vec![],
            output_artifacts: vec![],
            fixture_paths: vec![],
            failure_routing: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    fn contract_json() -> String {
        serde_json::json!({
            "interfaces": [{"name": "factorial", "signature": "fn factorial(n: u64) -> u64"}],
            "data_models": [],
            "examples": [{"input": 5, "output": 120}],
            "test_skeleton": "assert factorial(5) == 120",
            "fixtures": [],
        })
        .to_string()
    }

    struct StaticRouter {
        reply: String,
    }

    #[async_trait]
    impl RequestRouter for StaticRouter {
        async fn complete(&self, request: CompletionRequest) -> Result<polyagent_core::router::CompletionOutcome> {
            Ok(polyagent_core::router::CompletionOutcome {
                content: self.reply.clone(),
                model: "test-model".to_string(),
                key_id: "key_1".to_string(),
                tokens: 10,
                conversation_id: request.conversation_id,
                duration_ms: 1,
            })
        }
    }

    /// Blocked on first call (default-workload attempt), succeeds once the
    /// caller retries with an escalated `model_preference` (§4.3 step 6.b,
    /// which the Architect's own escalation shortcut mirrors for itself).
    struct BlockOnceThenSucceed {
        calls: AtomicUsize,
        reply: String,
    }

    #[async_trait]
    impl RequestRouter for BlockOnceThenSucceed {
        async fn complete(&self, request: CompletionRequest) -> Result<polyagent_core::router::CompletionOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                assert!(request.model_preference.is_none());
                return Err(Error::SafetyBlocked("blocked".to_string()));
            }
            assert_eq!(request.model_preference.as_deref(), Some(ESCALATED_MODEL));
            Ok(polyagent_core::router::CompletionOutcome {
                content: self.reply.clone(),
                model: ESCALATED_MODEL.to_string(),
                key_id: "key_1".to_string(),
                tokens: 10,
                conversation_id: request.conversation_id,
                duration_ms: 1,
            })
        }
    }

    #[tokio::test]
    async fn parses_and_persists_contract_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let architect = Architect::new(Arc::new(StaticRouter { reply: contract_json() }), dir.path());

        let result = architect.handle(request()).await.unwrap();

        assert_eq!(result.status, "completed");
        assert!(result.validation.success);
        assert_eq!(result.artifacts.len(), 1);
        let path = &result.artifacts[0].path;
        assert!(std::path::Path::new(path).exists());
        let contract: Contract = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(contract.test_skeleton, "assert factorial(5) == 120");
    }

    #[tokio::test]
    async fn strips_markdown_fence_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let fenced = format!("```json\n{}\n```", contract_json());
        let architect = Architect::new(Arc::new(StaticRouter { reply: fenced }), dir.path());

        let result = architect.handle(request()).await.unwrap();
        assert!(result.validation.success);
    }

    #[tokio::test]
    async fn escalates_model_preference_on_safety_block_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let router = BlockOnceThenSucceed { calls: AtomicUsize::new(0), reply: contract_json() };
        let architect = Architect::new(Arc::new(router), dir.path());

        let result = architect.handle(request()).await.unwrap();

        assert_eq!(result.status, "completed");
    }

    #[tokio::test]
    async fn invalid_json_reply_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let architect = Architect::new(Arc::new(StaticRouter { reply: "not json at all".to_string() }), dir.path());

        let err = architect.handle(request()).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
