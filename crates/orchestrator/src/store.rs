//! In-memory + filesystem-backed store for loaded `TodoList`s and
//! `WorkflowState`s (§6 "Persisted state layout":
//! `workflows/<todo_list_id>_todolist.json`, overwritten on branch append).

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use polyagent_common::error::{Error, Result};
use polyagent_common::types::{TaskState, TodoList, WorkflowId, WorkflowState, WorkflowStatus};
use polyagent_core::orchestrator::IterativeReport;
use tracing::warn;
use uuid::Uuid;

pub struct WorkflowStore {
    workflows_dir: PathBuf,
    todo_lists: DashMap<String, TodoList>,
    workflows: DashMap<WorkflowId, Arc<RwLock<WorkflowState>>>,
}

impl WorkflowStore {
    pub fn new(workflows_dir: impl Into<PathBuf>) -> Self {
        Self { workflows_dir: workflows_dir.into(), todo_lists: DashMap::new(), workflows: DashMap::new() }
    }

    fn path_for(&self, todo_list_id: &str) -> PathBuf {
        self.workflows_dir.join(format!("{todo_list_id}_todolist.json"))
    }

    /// Persist the current state of a todo list to disk. Best-effort: a
    /// write failure is logged, not propagated, since the in-memory copy
    /// (the orchestrator's source of truth mid-run) is unaffected.
    fn persist(&self, list: &TodoList) {
        if let Err(e) = std::fs::create_dir_all(&self.workflows_dir) {
            warn!(error = %e, "failed to create workflows directory");
            return;
        }
        match serde_json::to_vec_pretty(list) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(self.path_for(&list.todo_list_id), bytes) {
                    warn!(error = %e, todo_list_id = %list.todo_list_id, "failed to persist todo list");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize todo list"),
        }
    }

    pub fn insert_todo_list(&self, list: TodoList) -> String {
        let id = list.todo_list_id.clone();
        self.persist(&list);
        self.todo_lists.insert(id.clone(), list);
        id
    }

    pub fn get_todo_list(&self, id: &str) -> Result<TodoList> {
        self.todo_lists.get(id).map(|e| e.value().clone()).ok_or_else(|| Error::Internal(format!("unknown todo list {id}")))
    }

    /// Append items (a branch/repair batch) to a loaded todo list,
    /// persisting the updated list (§6 "overwritten on branch append").
    pub fn append_items(&self, todo_list_id: &str, new_items: Vec<polyagent_common::types::TodoItem>) -> Result<()> {
        let mut entry = self.todo_lists.get_mut(todo_list_id).ok_or_else(|| Error::Internal(format!("unknown todo list {todo_list_id}")))?;
        entry.items.extend(new_items);
        self.persist(&entry);
        Ok(())
    }

    pub fn create_workflow(&self, todo_list_id: &str, correlation_id: &str) -> Result<WorkflowId> {
        let list = self.get_todo_list(todo_list_id)?;
        let workflow_id = format!("wf_{}", Uuid::new_v4().simple());
        let mut state = WorkflowState::new(workflow_id.clone(), todo_list_id.to_string(), correlation_id.to_string());
        for item in &list.items {
            state.tasks.insert(item.id.clone(), TaskState::new(item.id.clone()));
        }
        self.workflows.insert(workflow_id.clone(), Arc::new(RwLock::new(state)));
        Ok(workflow_id)
    }

    /// Register `TaskState`s for any items that appeared after branch
    /// append but don't yet have one (§4.6 "reload_workflow_tasks").
    pub fn sync_new_tasks(&self, workflow_id: &str) -> Result<()> {
        let handle = self.workflow_handle(workflow_id)?;
        let todo_list_id = handle.read().todo_list_id.clone();
        let list = self.get_todo_list(&todo_list_id)?;
        let mut state = handle.write();
        for item in &list.items {
            state.tasks.entry(item.id.clone()).or_insert_with(|| TaskState::new(item.id.clone()));
        }
        Ok(())
    }

    pub fn workflow_handle(&self, workflow_id: &str) -> Result<Arc<RwLock<WorkflowState>>> {
        self.workflows.get(workflow_id).map(|e| e.value().clone()).ok_or_else(|| Error::Internal(format!("unknown workflow {workflow_id}")))
    }

    pub fn snapshot(&self, workflow_id: &str) -> Result<WorkflowState> {
        Ok(self.workflow_handle(workflow_id)?.read().clone())
    }

    pub fn list_snapshots(&self) -> Vec<WorkflowState> {
        self.workflows.iter().map(|e| e.value().read().clone()).collect()
    }

    pub fn set_status(&self, workflow_id: &str, status: WorkflowStatus) -> Result<()> {
        let handle = self.workflow_handle(workflow_id)?;
        let mut state = handle.write();
        state.status = status;
        match status {
            WorkflowStatus::Running if state.started_at.is_none() => state.started_at = Some(chrono::Utc::now()),
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                state.completed_at = Some(chrono::Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Persists the final report of one `IterativeLoop::run` call to
    /// `iteration_report_<workflow_id>_<timestamp>.json` (§2 supplemented
    /// feature), for `status`/`iterate` CLI output to read back. Best-effort
    /// like `persist`: a write failure is logged, not propagated, since the
    /// report returned to the caller already carries the full history.
    pub fn write_iteration_report(&self, report: &IterativeReport) {
        if let Err(e) = std::fs::create_dir_all(&self.workflows_dir) {
            warn!(error = %e, "failed to create workflows directory");
            return;
        }
        let path = self.workflows_dir.join(format!("iteration_report_{}_{}.json", report.workflow_id, chrono::Utc::now().format("%Y%m%dT%H%M%S%.fZ")));
        match serde_json::to_vec_pretty(report) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(error = %e, path = %path.display(), "failed to persist iteration report");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize iteration report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyagent_core::orchestrator::IterationRecord;

    #[test]
    fn write_iteration_report_persists_a_readable_json_file_under_the_workflows_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let report = IterativeReport {
            workflow_id: "wf_1".to_string(),
            total_iterations: 2,
            succeeded: true,
            history: vec![IterationRecord { iteration: 1, status: "repairing".to_string(), timestamp: chrono::Utc::now(), data: serde_json::json!({}) }],
        };

        store.write_iteration_report(&report);

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().into_string().unwrap();
        assert!(name.starts_with("iteration_report_wf_1_") && name.ends_with(".json"), "unexpected file name: {name}");

        let contents = std::fs::read_to_string(entries[0].path()).unwrap();
        let parsed: IterativeReport = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.workflow_id, "wf_1");
        assert_eq!(parsed.total_iterations, 2);
        assert!(parsed.succeeded);
    }
}

