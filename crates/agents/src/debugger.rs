//! Debugger adapter (§4.7): classifies a failing task's error text and
//! writes a diagnostic report (classification, traceback snippet,
//! suggested fixes). Branch/repair-task construction and `WORKFLOW_BRANCH_
//! CREATED` publishing are centralized in `polyagent-orchestrator`'s
//! `IterativeLoop` instead of duplicated here, so that branch-depth budget
//! enforcement and todo-list mutation stay serialized with dispatch (§5).

use std::path::PathBuf;

use async_trait::async_trait;
use polyagent_common::classify::{classify_failure, FailureKind};
use polyagent_common::error::Result;
use polyagent_common::types::{AgentRole, ArtifactRef, TaskRequest, TaskResult, ValidationOutcome};
use polyagent_core::agent::{Agent, AgentHealth};
use tracing::{info, instrument};

pub struct Debugger {
    reports_dir: PathBuf,
}

impl Debugger {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self { reports_dir: reports_dir.into() }
    }

    fn default_route(kind: FailureKind) -> AgentRole {
        match kind {
            FailureKind::MissingDependency => AgentRole::Architect,
            FailureKind::SpecMismatch | FailureKind::ImplementationBug | FailureKind::Timeout => AgentRole::Coder,
            FailureKind::FlakyTest => AgentRole::Tester,
        }
    }

    fn suggested_fixes(kind: FailureKind) -> Vec<String> {
        match kind {
            FailureKind::Timeout => vec![
                "profile the hot path and cut unnecessary work".to_string(),
                "raise timeout_seconds if the operation is legitimately slow".to_string(),
            ],
            FailureKind::MissingDependency => vec![
                "add the missing import or dependency to the contract".to_string(),
                "check the fixture/input_artifacts paths are correct".to_string(),
            ],
            FailureKind::SpecMismatch => vec![
                "re-read the acceptance criteria and compare against the implementation's return value".to_string(),
                "check for an off-by-one or inverted condition".to_string(),
                "confirm the contract's interface matches what the test expects".to_string(),
            ],
            FailureKind::ImplementationBug => {
                vec!["inspect the traceback for the first frame in generated code".to_string(), "add a guard for the failing input".to_string()]
            }
            FailureKind::FlakyTest => vec!["pin the random seed".to_string(), "remove timing-dependent assertions".to_string()],
        }
    }
}

#[async_trait]
impl Agent for Debugger {
    fn role(&self) -> AgentRole {
        AgentRole::Debugger
    }

    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    async fn handle(&self, request: TaskRequest) -> Result<TaskResult> {
        let started = std::time::Instant::now();
        let error_text = request.metadata.get("error_text").and_then(|v| v.as_str()).unwrap_or(&request.task_description).to_string();

        let classification = classify_failure(&error_text);
        let route = request.failure_routing.get(classification.kind.as_str()).copied().unwrap_or_else(|| Self::default_route(classification.kind));

        let report = serde_json::json!({
            "task_id": request.task_id,
            "kind": classification.kind.as_str(),
            "confidence": classification.confidence,
            "routed_to": route.as_str(),
            "traceback_snippet": error_text.chars().take(2000).collect::<String>(),
            "suggested_fixes": Self::suggested_fixes(classification.kind),
        });

        std::fs::create_dir_all(&self.reports_dir)?;
        let path = self.reports_dir.join(format!("{}_debug.json", request.task_id));
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;

        info!(kind = %classification.kind, routed_to = %route, "debugger classified failure");

        Ok(TaskResult {
            task_id: request.task_id,
            agent_id: "debugger".to_string(),
            status: "completed".to_string(),
            artifacts: vec![ArtifactRef { path: path.to_string_lossy().to_string(), kind: "debug_report".to_string() }],
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
    use polyagent_common::types::{AcceptanceCriteria, Metadata};
    use std::collections::HashMap;

    fn base_request(error_text: &str) -> TaskRequest {
        let mut metadata = Metadata::new();
        metadata.insert("error_text".to_string(), serde_json::Value::String(error_text.to_string()));
        TaskRequest {
            task_id: "task_coder_1".to_string(),
            task_title: "factorial".to_string(),
            task_description: "implement factorial".to_string(),
            agent_role: AgentRole::Debugger,
            correlation_id: "corr_1".to_string(),
            workflow_id: "wf_1".to_string(),
            acceptance_criteria: AcceptanceCriteria::default(),
            contract_path: None,
            input_artifacts: vec![],
            output_artifacts: vec![],
            fixture_paths: vec![],
            failure_routing: HashMap::new(),
            metadata,
        }
    }

    #[tokio::test]
    async fn classifies_and_routes_to_default_when_no_override() {
        let dir = tempfile::tempdir().unwrap();
        let debugger = Debugger::new(dir.path());
        let request = base_request("AssertionError: expected 120 but got 5");

        let result = debugger.handle(request).await.unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.artifacts.len(), 1);
        let report: serde_json::Value = serde_json::from_slice(&std::fs::read(&result.artifacts[0].path).unwrap()).unwrap();
        assert_eq!(report["kind"], "spec_mismatch");
        assert_eq!(report["routed_to"], "coder");
        assert!(report["suggested_fixes"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn honors_failure_routing_override_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let debugger = Debugger::new(dir.path());
        let mut request = base_request("ModuleNotFoundError: no module named 'numpy'");
        request.failure_routing.insert("missing_dependency".to_string(), AgentRole::Tester);

        let result = debugger.handle(request).await.unwrap();

        let report: serde_json::Value = serde_json::from_slice(&std::fs::read(&result.artifacts[0].path).unwrap()).unwrap();
        assert_eq!(report["kind"], "missing_dependency");
        assert_eq!(report["routed_to"], "tester");
    }

    #[tokio::test]
    async fn falls_back_to_task_description_when_no_error_text_in_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let debugger = Debugger::new(dir.path());
        let mut request = base_request("unused");
        request.metadata.clear();
        request.task_description = "operation timed out after 30s".to_string();

        let result = debugger.handle(request).await.unwrap();

        let report: serde_json::Value = serde_json::from_slice(&std::fs::read(&result.artifacts[0].path).unwrap()).unwrap();
        assert_eq!(report["kind"], "timeout");
    }
}
