//! Topological ordering over a `TodoList`'s item graph (§4.6 step 1):
//! Kahn's algorithm over `TodoItem.dependencies`, ties broken by ascending
//! `priority`, with the same cycle-detection posture as a full graph
//! library but without pulling one in for a dependency set this small.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use polyagent_common::error::{Error, Result};
use polyagent_common::types::{TaskId, TodoItem};

/// Returns task ids in an order where every dependency precedes its
/// dependents, ties broken by ascending priority (§4.6 step 1). Errors if
/// the graph contains a cycle (should not happen for a planner-validated
/// list, but branch appends are re-validated defensively here too).
pub fn topological_order(items: &[TodoItem]) -> Result<Vec<TaskId>> {
    let by_id: HashMap<&str, &TodoItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();

    let mut in_degree: HashMap<&str, usize> = items.iter().map(|i| (i.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for item in items {
        for dep in &item.dependencies {
            *in_degree.get_mut(item.id.as_str()).unwrap() += 1;
            dependents.entry(dep.as_str()).or_default().push(item.id.as_str());
        }
    }

    let mut ready: BinaryHeap<Reverse<(u8, &str)>> =
        in_degree.iter().filter(|(_, deg)| **deg == 0).map(|(id, _)| Reverse((by_id[id].priority, *id))).collect();

    let mut order = Vec::with_capacity(items.len());
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(Reverse((_, id))) = ready.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id.to_string());

        if let Some(next) = dependents.get(id) {
            for dependent in next {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((by_id[dependent].priority, dependent)));
                }
            }
        }
    }

    if order.len() != items.len() {
        let stuck = items.iter().find(|i| !visited.contains(i.id.as_str())).map(|i| i.id.clone()).unwrap_or_default();
        return Err(Error::DependencyCycle(stuck));
    }

    Ok(order)
}
