//! Branching/repair-task protocol (§4.6 "Branching protocol", §9 "Parent
//! -> branch cycles"). Shared by the Debugger agent adapter and the
//! `IterativeLoop`, both of which synthesize repair `TodoItem`s.

use std::collections::HashMap;

use polyagent_common::error::{Error, Result};
use polyagent_common::types::{AgentRole, TodoItem, TodoList};
use uuid::Uuid;

/// Walks the `parent_id` chain to compute how many branch generations
/// `task_id` is already removed from its nearest non-temporary ancestor.
pub fn branch_depth(list: &TodoList, task_id: &str) -> u32 {
    let by_id: HashMap<&str, &TodoItem> = list.items.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut depth = 0;
    let mut current = task_id;
    while let Some(item) = by_id.get(current) {
        if let Some(parent) = &item.parent_id {
            depth += 1;
            current = parent.as_str();
        } else {
            break;
        }
    }
    depth
}

/// Build a repair `TodoItem` (§4.6): `dependencies = []`, `is_temporary =
/// true`, `max_debug_attempts = 3`, routed via `failure_routing` or the
/// classifier's fallback suggestion. Rejects the branch once
/// `max_branch_depth` is exceeded (§4.6 "Branch depth").
pub fn build_branch_item(
    list: &TodoList,
    parent: &TodoItem,
    branch_reason: &str,
    suggested_role: AgentRole,
    description: String,
    max_branch_depth: u32,
) -> Result<TodoItem> {
    let depth = branch_depth(list, &parent.id);
    if depth >= max_branch_depth {
        return Err(Error::BranchBudgetExceeded(parent.id.clone()));
    }

    let agent_role = parent.failure_routing.get(branch_reason).copied().unwrap_or(suggested_role);
    let id = format!("task_branch_{}", Uuid::new_v4().simple());

    Ok(TodoItem {
        id,
        title: format!("Repair: {}", parent.title),
        description,
        agent_role,
        priority: parent.priority,
        dependencies: Default::default(),
        max_retries: parent.max_retries,
        timeout_seconds: parent.timeout_seconds,
        acceptance_criteria: parent.acceptance_criteria.clone(),
        input_artifacts: parent.output_artifacts.clone(),
        output_artifacts: parent.output_artifacts.clone(),
        failure_routing: parent.failure_routing.clone(),
        parent_id: Some(parent.id.clone()),
        branch_reason: Some(branch_reason.to_string()),
        is_temporary: true,
        max_debug_attempts: Some(3),
        metadata: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn parent_item(id: &str, parent_id: Option<&str>) -> TodoItem {
        TodoItem {
            id: id.to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            agent_role: AgentRole::Coder,
            priority: 5,
            dependencies: Default::default(),
            max_retries: 3,
            timeout_seconds: 60,
            acceptance_criteria: Default::default(),
            input_artifacts: vec![],
            output_artifacts: vec!["out.py".to_string()],
            failure_routing: Map::new(),
            parent_id: parent_id.map(str::to_string),
            branch_reason: None,
            is_temporary: parent_id.is_some(),
            max_debug_attempts: None,
            metadata: Map::new(),
        }
    }

    fn list(items: Vec<TodoItem>) -> TodoList {
        TodoList { todo_list_id: "tl_1".to_string(), workflow_name: "wf".to_string(), created_at: Utc::now(), metadata: Map::new(), items }
    }

    #[test]
    fn rejects_branch_past_max_depth() {
        let l = list(vec![parent_item("task_a", None), parent_item("task_b", Some("task_a"))]);
        let parent = l.items.iter().find(|i| i.id == "task_b").unwrap();
        let result = build_branch_item(&l, parent, "spec_mismatch", AgentRole::Architect, "fix".to_string(), 1);
        assert!(matches!(result, Err(Error::BranchBudgetExceeded(_))));
    }

    #[test]
    fn allows_branch_within_depth_budget() {
        let l = list(vec![parent_item("task_a", None)]);
        let parent = l.items.iter().find(|i| i.id == "task_a").unwrap();
        let branch = build_branch_item(&l, parent, "spec_mismatch", AgentRole::Architect, "fix".to_string(), 2).unwrap();
        assert!(branch.is_temporary);
        assert!(branch.dependencies.is_empty());
        assert_eq!(branch.parent_id.as_deref(), Some("task_a"));
    }

    #[test]
    fn uses_failure_routing_over_suggested_role() {
        let mut parent = parent_item("task_a", None);
        parent.failure_routing.insert("spec_mismatch".to_string(), AgentRole::Architect);
        let l = list(vec![parent.clone()]);
        let branch = build_branch_item(&l, &parent, "spec_mismatch", AgentRole::Coder, "fix".to_string(), 2).unwrap();
        assert_eq!(branch.agent_role, AgentRole::Architect);
    }
}
