//! Prompt construction (§4.5 steps 1-2).

use polyagent_core::planner::PlanContext;

pub const SCHEMA_SYSTEM_PROMPT: &str = r#"You are the planning module of a multi-agent coding orchestrator.
Convert the user's request into a JSON TodoList and emit JSON only - no prose, no markdown fences.

Schema:
{
  "todo_list_id": string,
  "workflow_name": string,
  "metadata": object,
  "items": [
    {
      "id": string matching ^task_[A-Za-z0-9_-]+$ (unique within the list),
      "title": string,
      "description": string,
      "agent_role": one of "architect" | "coder" | "tester" | "debugger" | "optimizer",
      "priority": integer 1-10,
      "dependencies": array of task ids already present earlier in this list,
      "max_retries": integer 0-10,
      "timeout_seconds": integer,
      "acceptance_criteria": { "tests": [ { "cmd": string, "timeout_seconds": integer, "expected_exit_code": integer } ] },
      "input_artifacts": array of strings,
      "output_artifacts": array of strings,
      "failure_routing": object mapping a failure class to an agent_role
    }
  ]
}

Rules:
- The dependency graph must be acyclic and every dependency id must reference an item in the same list.
- Never make an item depend on itself.
- Emit valid JSON only."#;

pub fn build_user_prompt(user_request: &str, context: &PlanContext) -> String {
    let mut prompt = format!("User request:\n{user_request}\n");
    if !context.hints.is_empty() {
        prompt.push_str("\nContext hints:\n");
        for hint in &context.hints {
            prompt.push_str("- ");
            prompt.push_str(hint);
            prompt.push('\n');
        }
    }
    prompt
}

/// §4.5 step 5: prepend a structured error explanation and retry.
pub fn build_repair_prompt(original: &str, error: &str) -> String {
    format!("The previous TodoList you produced was rejected: {error}\n\nProduce a corrected TodoList for the same request.\n\n{original}")
}
