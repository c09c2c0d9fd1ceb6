//! Planner: turns a natural-language query, plus the set of
//! connected services and their live tools, into an ordered
//! [`WorkflowStep`] plan. Also produces the adapted tail when the Engine
//! decides to replan mid-run.

use crate::llm::{json_extract::extract_json, LanguageModel};
use crate::types::{TaskComponent, ToolDescriptor, WorkflowStep, LLM_STEP};

/// One connected service's live tools, as the Planner sees them.
pub struct AvailableService {
    pub name: String,
    pub tools: Vec<ToolDescriptor>,
}

fn services_prompt_block(services: &[AvailableService]) -> String {
    services
        .iter()
        .map(|s| {
            let tools = s
                .tools
                .iter()
                .map(|t| format!("    - {}: {}", t.name, t.description))
                .collect::<Vec<_>>()
                .join("\n");
            format!("- {} (service name: \"{}\")\n{}", s.name, s.name, tools)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Anti-confusion constraints repeated in every planning prompt, so the
/// LLM doesn't invent service/tool names or step numbers.
const PLAN_CONSTRAINTS: &str = "\
Rules:\n\
- Only use service names and tool names exactly as listed above. Do not invent new ones.\n\
- If a step needs no tool and is pure reasoning/summarization over prior results, set \"mcp_name\" to \"llm\" and \"action\" to a short description of the reasoning task.\n\
- step_index must start at 1 and increase by 1 with no gaps.\n\
- Respond with only a JSON array of steps, no prose.\n\
- Each step is an object: {\"mcp_name\": string, \"action\": string, \"input_args\": object, \"reasoning\": string}.";

fn breakdown_prompt_block(components: &[TaskComponent]) -> String {
    if components.is_empty() {
        return String::new();
    }
    let lines = components
        .iter()
        .map(|c| format!("- [{}] {:?}: {}", c.id, c.component_type, c.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!("\nTask breakdown (cover every one of these sub-goals with at least one step):\n{lines}\n")
}

/// Build the initial plan for a fresh task, given its task breakdown and the
/// live services available.
pub async fn plan(llm: &dyn LanguageModel, query: &str, services: &[AvailableService], components: &[TaskComponent]) -> Vec<WorkflowStep> {
    let prompt = format!(
        "A user asked: \"{query}\"\n{}\nAvailable tool services:\n{}\n\n{PLAN_CONSTRAINTS}",
        breakdown_prompt_block(components),
        services_prompt_block(services)
    );

    match llm.complete(None, &prompt).await {
        Ok(response) => parse_plan(&response).unwrap_or_else(|| fallback_plan(query)),
        Err(_) => fallback_plan(query),
    }
}

fn data_store_keys_prompt_block(data_store_keys: &[String]) -> String {
    if data_store_keys.is_empty() {
        return String::new();
    }
    format!("\nData already collected (keys, do not re-collect these): {}\n", data_store_keys.join(", "))
}

/// Build a replacement tail starting at `from_step_index`, given everything
/// completed so far. The Engine splices this in and renumbers densely,
/// fully replacing whatever was planned from that point on. Takes the same
/// task breakdown and data-store-keys inputs as [`plan`] — §4.D's input
/// list applies both at run start and when the Observer requests a replan.
#[allow(clippy::too_many_arguments)]
pub async fn replan_tail(
    llm: &dyn LanguageModel,
    query: &str,
    services: &[AvailableService],
    components: &[TaskComponent],
    data_store_keys: &[String],
    reason: &str,
    history_summary: &str,
    from_step_index: u32,
) -> Vec<WorkflowStep> {
    let prompt = format!(
        "A user asked: \"{query}\"\n{}{}\nProgress so far:\n{history_summary}\n\n\
         The plan needs to change because: {reason}\n\n\
         Available tool services:\n{}\n\n\
         Produce ONLY the remaining steps needed to finish the task, starting numbering at 1 \
         (the Engine will renumber them to continue from step {from_step_index}).\n\n{PLAN_CONSTRAINTS}",
        breakdown_prompt_block(components),
        data_store_keys_prompt_block(data_store_keys),
        services_prompt_block(services)
    );

    match llm.complete(None, &prompt).await {
        Ok(response) => parse_plan(&response)
            .map(|steps| renumber_from(steps, from_step_index))
            .unwrap_or_else(|| vec![]),
        Err(_) => Vec::new(),
    }
}

fn renumber_from(mut steps: Vec<WorkflowStep>, from: u32) -> Vec<WorkflowStep> {
    for (offset, step) in steps.iter_mut().enumerate() {
        step.step_index = from + offset as u32;
    }
    steps
}

#[derive(serde::Deserialize)]
struct RawStep {
    mcp_name: String,
    action: String,
    #[serde(default)]
    input_args: serde_json::Value,
    #[serde(default)]
    reasoning: Option<String>,
}

fn parse_plan(response: &str) -> Option<Vec<WorkflowStep>> {
    let value = extract_json(response)?;
    let raw_steps: Vec<RawStep> = serde_json::from_value(value).ok()?;
    if raw_steps.is_empty() {
        return None;
    }

    Some(
        raw_steps
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let mut step = WorkflowStep::new(i as u32 + 1, raw.mcp_name, raw.action, raw.input_args);
                step.reasoning = raw.reasoning;
                step
            })
            .collect(),
    )
}

/// Single-step fallback plan used when the LLM's response can't be parsed
/// into steps, so a malformed plan never fails the run outright.
fn fallback_plan(query: &str) -> Vec<WorkflowStep> {
    vec![WorkflowStep::new(1, LLM_STEP, "answer directly", serde_json::json!({"query": query}))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLanguageModel;

    fn services() -> Vec<AvailableService> {
        vec![AvailableService {
            name: "coingecko".to_string(),
            tools: vec![ToolDescriptor {
                name: "get_price".to_string(),
                description: "current price".to_string(),
                input_schema: serde_json::json!({}),
            }],
        }]
    }

    #[tokio::test]
    async fn parses_a_well_formed_plan() {
        let llm = StubLanguageModel::new(vec![
            r#"[{"mcp_name": "coingecko", "action": "get_price", "input_args": {"coin_id": "bitcoin"}, "reasoning": "need current price"}]"#.to_string(),
        ]);
        let steps = plan(&llm, "what's the price of bitcoin", &services(), &[]).await;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_index, 1);
        assert_eq!(steps[0].mcp_name, "coingecko");
    }

    #[tokio::test]
    async fn falls_back_to_single_llm_step_on_parse_failure() {
        let llm = StubLanguageModel::new(vec!["I cannot help with that".to_string()]);
        let steps = plan(&llm, "what's the price of bitcoin", &services(), &[]).await;
        assert_eq!(steps.len(), 1);
        assert!(steps[0].is_llm_step());
    }

    #[tokio::test]
    async fn replan_tail_renumbers_from_the_given_index() {
        let llm = StubLanguageModel::new(vec![
            r#"[{"mcp_name": "coingecko", "action": "get_price", "input_args": {}, "reasoning": null}, {"mcp_name": "llm", "action": "summarize", "input_args": {}, "reasoning": null}]"#.to_string(),
        ]);
        let steps = replan_tail(&llm, "q", &services(), &[], &[], "tool failed", "step 1 failed", 3).await;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_index, 3);
        assert_eq!(steps[1].step_index, 4);
    }

    #[tokio::test]
    async fn replan_tail_returns_empty_on_parse_failure() {
        let llm = StubLanguageModel::new(vec!["nonsense".to_string()]);
        let steps = replan_tail(&llm, "q", &services(), &[], &[], "tool failed", "history", 2).await;
        assert!(steps.is_empty());
    }

    #[tokio::test]
    async fn replan_tail_folds_breakdown_and_data_store_keys_into_the_prompt() {
        use crate::types::ComponentType;
        let llm = StubLanguageModel::new(vec!["[]".to_string()]);
        let components = vec![crate::types::TaskComponent::new("c1", ComponentType::DataCollection, "fetch @alice's posts")];
        let keys = vec!["step_1_result".to_string()];
        let _ = replan_tail(&llm, "q", &services(), &components, &keys, "tool failed", "history", 2).await;
        let seen = llm.seen.lock().unwrap();
        assert!(seen[0].contains("fetch @alice's posts"));
        assert!(seen[0].contains("step_1_result"));
    }

    #[tokio::test]
    async fn task_breakdown_is_folded_into_the_planning_prompt() {
        use crate::types::ComponentType;
        let llm = StubLanguageModel::new(vec!["[]".to_string()]);
        let components = vec![crate::types::TaskComponent::new("c1", ComponentType::DataCollection, "fetch @alice's posts")];
        let _ = plan(&llm, "q", &services(), &components).await;
        let seen = llm.seen.lock().unwrap();
        assert!(seen[0].contains("fetch @alice's posts"));
    }
}
