use crate::agent::AgentSpec;

pub fn system_prompt(spec: &AgentSpec) -> String {
    format!(
        r#"You are the {role} on a team of agents that analyzes a Salesforce account and plans its Next Best Actions.

## Goal
{goal}

{instructions_section}

## Guidelines
- Base every statement on the data you are given. Do not invent records, amounts, or dates.
- When the data is insufficient for a field, say so in that field rather than guessing.
- Include a `confidence` between 0 and 1 when the result format allows it.
- Submit your answer in the required structured format only."#,
        role = spec.role,
        goal = if spec.goal.is_empty() {
            "Complete the task described below."
        } else {
            spec.goal.as_str()
        },
        instructions_section = if spec.instructions.is_empty() {
            String::new()
        } else {
            format!("## Instructions\n{}", spec.instructions)
        }
    )
}

pub fn task_prompt(spec: &AgentSpec, input: &serde_json::Value) -> String {
    let rendered =
        serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string());
    format!(
        "Task for agent `{id}`.\n\n## Input\n```json\n{rendered}\n```\n\nEntries under `dependencies` are results from agents that ran before you.",
        id = spec.id,
    )
}
