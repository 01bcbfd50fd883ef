//! Coder adapter (§4.7): turns a task bound to a contract into an
//! implementation file plus a matching test file, both under deterministic
//! unique names. Runs a fast static check before writing artifacts; on a
//! safety block it falls back to a template rendering of the contract
//! rather than failing the task outright.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use polyagent_common::error::{Error, Result};
use polyagent_common::types::{AgentRole, ArtifactRef, Contract, TaskRequest, TaskResult, ValidationOutcome};
use polyagent_core::agent::{Agent, AgentHealth};
use polyagent_core::router::{CompletionRequest, RequestRouter};
use tracing::{info, instrument, warn};

const LOW_TEMPERATURE: f32 = 0.2;

pub struct Coder {
    router: Arc<dyn RequestRouter>,
    codes_dir: PathBuf,
    tests_dir: PathBuf,
}

impl Coder {
    pub fn new(router: Arc<dyn RequestRouter>, codes_dir: impl Into<PathBuf>, tests_dir: impl Into<PathBuf>) -> Self {
        Self { router, codes_dir: codes_dir.into(), tests_dir: tests_dir.into() }
    }

    fn load_contract(contract_path: &str) -> Result<Contract> {
        let bytes = std::fs::read(contract_path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn slug(title: &str) -> String {
        title.to_lowercase().chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect::<String>().chars().take(40).collect()
    }

    fn unique_filename(workflow_id: &str, task_id: &str, title: &str) -> String {
        format!("{}_{}_{}_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S"), workflow_id, task_id, Self::slug(title))
    }

    fn strip_code_fence(content: &str) -> String {
        let trimmed = content.trim();
        let without_open = trimmed.strip_prefix("```python").or_else(|| trimmed.strip_prefix("```")).unwrap_or(trimmed);
        without_open.strip_suffix("```").unwrap_or(without_open).trim().to_string()
    }

    /// Stand-in for "syntax parse and a type/lint pass if tools are
    /// available" (§4.7): balanced-delimiter and non-empty checks. A real
    /// deployment would shell out to the target language's own tools;
    /// absent those, §5's fail-open policy downgrades to a warning rather
    /// than blocking, so this check only catches gross truncation.
    fn quick_syntax_check(code: &str) -> std::result::Result<(), String> {
        if code.trim().is_empty() {
            return Err("generated code is empty".to_string());
        }
        let mut stack = Vec::new();
        for c in code.chars() {
            match c {
                '(' | '[' | '{' => stack.push(c),
                ')' => {
                    if stack.pop() != Some('(') {
                        return Err("unbalanced parentheses".to_string());
                    }
                }
                ']' => {
                    if stack.pop() != Some('[') {
                        return Err("unbalanced brackets".to_string());
                    }
                }
                '}' => {
                    if stack.pop() != Some('{') {
                        return Err("unbalanced braces".to_string());
                    }
                }
                _ => {}
            }
        }
        if !stack.is_empty() {
            return Err("unclosed delimiter".to_string());
        }
        Ok(())
    }

    fn template_fallback(contract: &Contract) -> String {
        format!(
            "# template fallback: safety filter blocked generation, rendering contract skeleton\n\n{}\n",
            contract.test_skeleton
        )
    }
}

#[async_trait]
impl Agent for Coder {
    fn role(&self) -> AgentRole {
        AgentRole::Coder
    }

    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    async fn handle(&self, request: TaskRequest) -> Result<TaskResult> {
        let started = std::time::Instant::now();
        let Some(contract_path) = request.contract_path.clone() else {
            return Ok(TaskResult {
                task_id: request.task_id,
                agent_id: "coder".to_string(),
                status: "failed".to_string(),
                artifacts: vec![],
                validation: ValidationOutcome { success: false, errors: vec!["no contract_path on task".to_string()], warnings: vec![] },
                duration_seconds: started.elapsed().as_secs_f64(),
                error: Some("missing contract_path".to_string()),
            });
        };
        let contract = Self::load_contract(&contract_path)?;

        let prompt = format!(
            "Implement the following contract.\n\nTask: {}\n\nInterfaces: {}\n\nExamples: {}\n\nTest skeleton:\n{}\n\n\
             Respond with the implementation source only, no surrounding prose.",
            request.task_description,
            serde_json::to_string(&contract.interfaces)?,
            serde_json::to_string(&contract.examples)?,
            contract.test_skeleton
        );

        let conv_id = format!("conv_{}_{}", request.workflow_id, request.task_id);
        let completion_request = CompletionRequest {
            conversation_id: conv_id,
            system_prompt: Some("You write correct, minimal implementations against a given contract.".to_string()),
            user_prompt: prompt,
            model_preference: None,
            workload: None,
            expected_completion_tokens: 2048,
            max_output_tokens: 4096,
            temperature: LOW_TEMPERATURE,
        };

        let mut template_fallback = false;
        let code = match self.router.complete(completion_request).await {
            Ok(outcome) => Self::strip_code_fence(&outcome.content),
            Err(Error::SafetyBlocked(reason)) => {
                warn!(reason = %reason, "coder falling back to template rendering after safety block");
                template_fallback = true;
                Self::template_fallback(&contract)
            }
            Err(e) => return Err(e),
        };

        if let Err(reason) = Self::quick_syntax_check(&code) {
            return Ok(TaskResult {
                task_id: request.task_id,
                agent_id: "coder".to_string(),
                status: "failed".to_string(),
                artifacts: vec![],
                validation: ValidationOutcome { success: false, errors: vec![reason.clone()], warnings: vec![] },
                duration_seconds: started.elapsed().as_secs_f64(),
                error: Some(format!("validation failed: {reason}")),
            });
        }

        let unique_name = Self::unique_filename(&request.workflow_id, &request.task_id, &request.task_title);
        std::fs::create_dir_all(&self.codes_dir)?;
        std::fs::create_dir_all(&self.tests_dir)?;
        let code_path = self.codes_dir.join(format!("{unique_name}.py"));
        let test_path = self.tests_dir.join(format!("test_{unique_name}.py"));
        std::fs::write(&code_path, &code)?;
        std::fs::write(&test_path, &contract.test_skeleton)?;

        info!(code_path = %code_path.display(), template_fallback, "coder wrote artifacts");

        let mut warnings = Vec::new();
        if template_fallback {
            warnings.push("rendered from contract template after a safety block; quality not verified".to_string());
        }

        Ok(TaskResult {
            task_id: request.task_id,
            agent_id: "coder".to_string(),
            status: "completed".to_string(),
            artifacts: vec![
                ArtifactRef { path: code_path.to_string_lossy().to_string(), kind: "code".to_string() },
                ArtifactRef { path: test_path.to_string_lossy().to_string(), kind: "test".to_string() },
            ],
            validation: ValidationOutcome { success: true, errors: vec![], warnings },
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

    fn write_contract(dir: &std::path::Path) -> String {
        let contract = Contract {
            contract_id: "contract_1".to_string(),
            interfaces: vec![serde_json::json!({"name": "factorial"})],
            data_models: vec![],
            examples: vec![serde_json::json!({"input": 5, "output": 120})],
            test_skeleton: "assert factorial(5) == 120".to_string(),
            fixtures: vec![],
        };
        let path = dir.join("contract_1.json");
        std::fs::write(&path, serde_json::to_vec(&contract).unwrap()).unwrap();
        path.to_string_lossy().to_string()
    }

    fn request(contract_path: Option<String>) -> TaskRequest {
        TaskRequest {
            task_id: "task_coder_1".to_string(),
            task_title: "implement factorial".to_string(),
            task_description: "implement factorial per contract".to_string(),
            agent_role: AgentRole::Coder,
            correlation_id: "corr_1".to_string(),
            workflow_id: "wf_1".to_string(),
            acceptance_criteria: AcceptanceCriteria::default(),
            contract_path,
            input_artifacts: vec![],
            output_artifacts: vec![],
            fixture_paths: vec![],
            failure_routing: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    struct StaticRouter {
        reply: Result<String>,
    }

    #[async_trait]
    impl RequestRouter for StaticRouter {
        async fn complete(&self, request: CompletionRequest) -> Result<polyagent_core::router::CompletionOutcome> {
            match &self.reply {
                Ok(content) => Ok(polyagent_core::router::CompletionOutcome {
                    content: content.clone(),
                    model: "test-model".to_string(),
                    key_id: "key_1".to_string(),
                    tokens: 10,
                    conversation_id: request.conversation_id,
                    duration_ms: 1,
                }),
                Err(Error::SafetyBlocked(reason)) => Err(Error::SafetyBlocked(reason.clone())),
                Err(e) => Err(Error::Agent(e.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn writes_code_and_test_artifacts_on_success() {
        let root = tempfile::tempdir().unwrap();
        let contract_path = write_contract(root.path());
        let codes = root.path().join("codes");
        let tests = root.path().join("tests");
        let coder = Coder::new(Arc::new(StaticRouter { reply: Ok("def factorial(n):\n    return 1 if n < 2 else n * factorial(n - 1)\n".to_string()) }), &codes, &tests);

        let result = coder.handle(request(Some(contract_path))).await.unwrap();

        assert_eq!(result.status, "completed");
        assert!(result.validation.success);
        assert!(result.validation.warnings.is_empty());
        assert_eq!(result.artifacts.len(), 2);
        assert!(result.artifacts.iter().any(|a| a.kind == "code"));
        assert!(result.artifacts.iter().any(|a| a.kind == "test"));
        for artifact in &result.artifacts {
            assert!(std::path::Path::new(&artifact.path).exists());
        }
    }

    #[tokio::test]
    async fn strips_code_fence_before_syntax_check() {
        let root = tempfile::tempdir().unwrap();
        let contract_path = write_contract(root.path());
        let coder = Coder::new(
            Arc::new(StaticRouter { reply: Ok("```python\ndef factorial(n):\n    return 1\n```".to_string()) }),
            root.path().join("codes"),
            root.path().join("tests"),
        );

        let result = coder.handle(request(Some(contract_path))).await.unwrap();
        assert!(result.validation.success);
        let code_artifact = result.artifacts.iter().find(|a| a.kind == "code").unwrap();
        let written = std::fs::read_to_string(&code_artifact.path).unwrap();
        assert!(!written.contains("```"));
    }

    #[tokio::test]
    async fn rejects_unbalanced_delimiters_as_validation_failure() {
        let root = tempfile::tempdir().unwrap();
        let contract_path = write_contract(root.path());
        let coder = Coder::new(Arc::new(StaticRouter { reply: Ok("def f(:\n    pass".to_string()) }), root.path().join("codes"), root.path().join("tests"));

        let result = coder.handle(request(Some(contract_path))).await.unwrap();

        assert_eq!(result.status, "failed");
        assert!(!result.validation.success);
        assert!(result.artifacts.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_contract_template_on_safety_block() {
        let root = tempfile::tempdir().unwrap();
        let contract_path = write_contract(root.path());
        let coder =
            Coder::new(Arc::new(StaticRouter { reply: Err(Error::SafetyBlocked("blocked".to_string())) }), root.path().join("codes"), root.path().join("tests"));

        let result = coder.handle(request(Some(contract_path))).await.unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.validation.warnings.len(), 1);
        let code_artifact = result.artifacts.iter().find(|a| a.kind == "code").unwrap();
        let written = std::fs::read_to_string(&code_artifact.path).unwrap();
        assert!(written.contains("template fallback"));
        assert!(written.contains("assert factorial(5) == 120"));
    }

    #[tokio::test]
    async fn missing_contract_path_fails_without_calling_router() {
        let coder = Coder::new(Arc::new(StaticRouter { reply: Ok(String::new()) }), "codes", "tests");

        let result = coder.handle(request(None)).await.unwrap();

        assert_eq!(result.status, "failed");
        assert_eq!(result.error.as_deref(), Some("missing contract_path"));
    }
}
