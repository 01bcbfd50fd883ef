//! Tester adapter (§4.7): runs a task's declared acceptance tests in a
//! bounded subprocess, collects a structured report, scans captured output
//! for secret-like patterns, and publishes `test.results`/`debugger.requests`
//! events in addition to the `TaskResult` the dispatcher sees.
//!
//! The reference container sandbox (no network, memory/CPU caps,
//! non-root) described in §4.7 step 1 is out of scope here: this adapter
//! runs each acceptance command as a local subprocess under a timeout,
//! which is the "local subprocess with timeout" half of that step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use polyagent_common::error::Result;
use polyagent_common::types::{channels, AgentRole, ArtifactRef, Event, EventData, Metadata, TaskRequest, TaskResult, TestFailure, ValidationOutcome};
use polyagent_core::agent::{Agent, AgentHealth};
use polyagent_core::bus::MessageBus;
use regex::Regex;
use tracing::{info, instrument, warn};

const FIXED_SEED_ENV: &str = "PYTHONHASHSEED";
const FIXED_SEED_VALUE: &str = "0";

pub struct Tester {
    bus: Arc<dyn MessageBus>,
    artifacts_dir: PathBuf,
    secret_patterns: Vec<Regex>,
}

struct StepOutcome {
    check: String,
    passed: bool,
    message: String,
    trace: String,
}

impl Tester {
    pub fn new(bus: Arc<dyn MessageBus>, artifacts_dir: impl Into<PathBuf>, secret_scan_patterns: &[String]) -> Self {
        let secret_patterns = secret_scan_patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();
        Self { bus, artifacts_dir: artifacts_dir.into(), secret_patterns }
    }

    async fn run_one(&self, check: &str, cmd: &str, timeout_seconds: u64, expected_exit_code: i32) -> StepOutcome {
        let timeout = Duration::from_secs(timeout_seconds);
        let spawned = tokio::process::Command::new("sh").arg("-c").arg(cmd).env(FIXED_SEED_ENV, FIXED_SEED_VALUE).output();

        match tokio::time::timeout(timeout, spawned).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let code = output.status.code().unwrap_or(-1);
                let passed = code == expected_exit_code;
                StepOutcome {
                    check: check.to_string(),
                    passed,
                    message: if passed { "ok".to_string() } else { format!("exit code {code}, expected {expected_exit_code}") },
                    trace: format!("{stdout}\n{stderr}"),
                }
            }
            Ok(Err(e)) => StepOutcome { check: check.to_string(), passed: false, message: format!("failed to spawn: {e}"), trace: String::new() },
            Err(_) => StepOutcome { check: check.to_string(), passed: false, message: "timed out".to_string(), trace: String::new() },
        }
    }

    fn scan_for_secrets(&self, steps: &[StepOutcome]) -> Option<String> {
        for step in steps {
            for pattern in &self.secret_patterns {
                if pattern.is_match(&step.trace) {
                    return Some(format!("secret-like pattern `{}` found in output of check `{}`", pattern.as_str(), step.check));
                }
            }
        }
        None
    }

    fn write_report(&self, correlation_id: &str, task_id: &str, steps: &[StepOutcome]) -> Result<Vec<ArtifactRef>> {
        let dir = self.artifacts_dir.join(correlation_id).join(task_id);
        std::fs::create_dir_all(&dir)?;

        let report = serde_json::json!({
            "task_id": task_id,
            "steps": steps.iter().map(|s| serde_json::json!({"check": s.check, "passed": s.passed, "message": s.message})).collect::<Vec<_>>(),
        });
        let report_path = dir.join("test_report.json");
        std::fs::write(&report_path, serde_json::to_vec_pretty(&report)?)?;

        let events_path = dir.join("events.log");
        let events_body = steps.iter().map(|s| format!("[{}] {}\n{}", s.check, s.message, s.trace)).collect::<Vec<_>>().join("\n---\n");
        std::fs::write(&events_path, events_body)?;

        Ok(vec![
            ArtifactRef { path: report_path.to_string_lossy().to_string(), kind: "test_report".to_string() },
            ArtifactRef { path: events_path.to_string_lossy().to_string(), kind: "events_log".to_string() },
        ])
    }

    async fn publish_debugger_request(&self, request: &TaskRequest, failures: &[TestFailure]) -> Result<()> {
        let mut metadata: Metadata = request.metadata.clone();
        metadata.insert("error_text".to_string(), serde_json::Value::String(failures.iter().map(|f| f.message.clone()).collect::<Vec<_>>().join("\n")));

        let debugger_request = TaskRequest {
            task_id: request.task_id.clone(),
            task_title: request.task_title.clone(),
            task_description: request.task_description.clone(),
            agent_role: AgentRole::Debugger,
            correlation_id: request.correlation_id.clone(),
            workflow_id: request.workflow_id.clone(),
            acceptance_criteria: request.acceptance_criteria.clone(),
            contract_path: request.contract_path.clone(),
            input_artifacts: request.input_artifacts.clone(),
            output_artifacts: request.output_artifacts.clone(),
            fixture_paths: request.fixture_paths.clone(),
            failure_routing: request.failure_routing.clone(),
            metadata,
        };

        self.bus
            .publish(
                channels::DEBUGGER_REQUESTS,
                Event::new("tester", &request.correlation_id, EventData::TaskDispatched { task: debugger_request })
                    .with_workflow(request.workflow_id.clone())
                    .with_task(request.task_id.clone()),
            )
            .await
    }
}

#[async_trait]
impl Agent for Tester {
    fn role(&self) -> AgentRole {
        AgentRole::Tester
    }

    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    async fn handle(&self, request: TaskRequest) -> Result<TaskResult> {
        let started = std::time::Instant::now();

        self.bus
            .publish(
                channels::TEST_RESULTS,
                Event::new("tester", &request.correlation_id, EventData::TestStarted { task_id: request.task_id.clone() })
                    .with_workflow(request.workflow_id.clone())
                    .with_task(request.task_id.clone()),
            )
            .await?;

        let mut steps = Vec::new();
        for test in &request.acceptance_criteria.tests {
            let outcome = self.run_one("unit_test", &test.cmd, test.timeout_seconds, test.expected_exit_code).await;
            steps.push(outcome);
        }

        if let Some(secret_hit) = self.scan_for_secrets(&steps) {
            warn!(task_id = %request.task_id, "secret scan failed");
            steps.push(StepOutcome { check: "secret_scan".to_string(), passed: false, message: secret_hit, trace: String::new() });
        } else {
            steps.push(StepOutcome { check: "secret_scan".to_string(), passed: true, message: "no matches".to_string(), trace: String::new() });
        }

        let report_artifacts = self.write_report(&request.correlation_id, &request.task_id, &steps)?;
        let failing: Vec<&StepOutcome> = steps.iter().filter(|s| !s.passed).collect();

        if failing.is_empty() {
            let metrics: Metadata =
                [("passed_checks".to_string(), serde_json::Value::from(steps.len())), ("duration_seconds".to_string(), serde_json::Value::from(started.elapsed().as_secs_f64()))]
                    .into_iter()
                    .collect();
            self.bus
                .publish(
                    channels::TEST_RESULTS,
                    Event::new("tester", &request.correlation_id, EventData::TestPassed { task_id: request.task_id.clone(), metrics })
                        .with_workflow(request.workflow_id.clone())
                        .with_task(request.task_id.clone()),
                )
                .await?;

            info!(task_id = %request.task_id, "all checks passed");
            return Ok(TaskResult {
                task_id: request.task_id,
                agent_id: "tester".to_string(),
                status: "completed".to_string(),
                artifacts: report_artifacts,
                validation: ValidationOutcome { success: true, errors: vec![], warnings: vec![] },
                duration_seconds: started.elapsed().as_secs_f64(),
                error: None,
            });
        }

        let failures: Vec<TestFailure> =
            failing.iter().map(|s| TestFailure { check: s.check.clone(), message: s.message.clone(), trace: Some(s.trace.clone()) }).collect();

        self.bus
            .publish(
                channels::TEST_RESULTS,
                Event::new("tester", &request.correlation_id, EventData::TestFailed { task_id: request.task_id.clone(), failures: failures.clone() })
                    .with_workflow(request.workflow_id.clone())
                    .with_task(request.task_id.clone()),
            )
            .await?;

        self.publish_debugger_request(&request, &failures).await?;

        Ok(TaskResult {
            task_id: request.task_id,
            agent_id: "tester".to_string(),
            status: "failed".to_string(),
            artifacts: report_artifacts,
            validation: ValidationOutcome { success: false, errors: failures.iter().map(|f| f.message.clone()).collect(), warnings: vec![] },
            duration_seconds: started.elapsed().as_secs_f64(),
            error: failures.first().map(|f| f.message.clone()),
        })
    }

    async fn health_check(&self) -> Result<AgentHealth> {
        Ok(AgentHealth { healthy: true, last_error: None })
    }
}
