//! `TodoList` schema and dependency-graph validation (§4.5 steps 5-6, §8
//! invariant "the item graph of any loaded `TodoList` is acyclic").

use std::collections::{HashMap, HashSet};

use polyagent_common::error::Error;
use polyagent_common::types::{TodoItem, TodoList};

/// Schema-level checks a freshly-parsed `TodoList` must pass before the
/// dependency graph is even considered (§3 invariants).
pub fn validate_schema(list: &TodoList) -> Result<(), Error> {
    if list.items.is_empty() {
        return Err(Error::SchemaInvalid("todo list must contain at least one item".to_string()));
    }

    let mut seen_ids = HashSet::new();
    for item in &list.items {
        if !TodoItem::id_is_well_formed(&item.id) {
            return Err(Error::SchemaInvalid(format!("task id '{}' does not match ^task_[A-Za-z0-9_-]+$", item.id)));
        }
        if !seen_ids.insert(item.id.clone()) {
            return Err(Error::SchemaInvalid(format!("duplicate task id '{}'", item.id)));
        }
        if item.priority < 1 || item.priority > 10 {
            return Err(Error::SchemaInvalid(format!("task '{}' priority {} out of range [1,10]", item.id, item.priority)));
        }
        if item.max_retries > 10 {
            return Err(Error::SchemaInvalid(format!("task '{}' max_retries {} exceeds 10", item.id, item.max_retries)));
        }
    }

    Ok(())
}

/// Dependency-graph validation (§4.5 step 6): every referenced id exists,
/// no self-dependency, the item-graph is acyclic.
pub fn validate_dependency_graph(list: &TodoList) -> Result<(), Error> {
    let ids: HashSet<&str> = list.items.iter().map(|i| i.id.as_str()).collect();

    for item in &list.items {
        for dep in &item.dependencies {
            if dep == &item.id {
                return Err(Error::UnknownDependency { task_id: item.id.clone(), dependency: format!("{dep} (self-dependency)") });
            }
            if !ids.contains(dep.as_str()) {
                return Err(Error::UnknownDependency { task_id: item.id.clone(), dependency: dep.clone() });
            }
        }
    }

    detect_cycle(list)
}

fn detect_cycle(list: &TodoList) -> Result<(), Error> {
    let adjacency: HashMap<&str, &HashSet<String>> = list.items.iter().map(|i| (i.id.as_str(), &i.dependencies)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = list.items.iter().map(|i| (i.id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, &'a HashSet<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), Error> {
        match marks.get(node).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(Error::DependencyCycle(node.to_string())),
            Mark::Unvisited => {}
        }
        marks.insert(node, Mark::InProgress);
        if let Some(deps) = adjacency.get(node) {
            for dep in deps.iter() {
                visit(dep.as_str(), adjacency, marks)?;
            }
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    for item in &list.items {
        visit(item.id.as_str(), &adjacency, &mut marks)?;
    }

    Ok(())
}

/// Strip a leading/trailing ```` ```json ```` or ```` ``` ```` markdown
/// fence (§4.5 step 4).
pub fn strip_markdown_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let after_open = after_open.strip_prefix("json").unwrap_or(after_open);
    let after_open = after_open.trim_start_matches('\n');
    after_open.strip_suffix("```").map_or(after_open, str::trim_end)
}
