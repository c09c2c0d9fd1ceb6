//! Task decomposition: splits the original query into typed
//! [`TaskComponent`]s before planning, so completion can be tracked per
//! sub-goal instead of only per step. Mirrors the Planner's own
//! prompt-then-parse-then-fallback shape (see [`crate::planner`]).

use serde::Deserialize;

use crate::llm::{json_extract::extract_json, LanguageModel};
use crate::types::{ComponentType, TaskComponent, WorkflowStep};

const DECOMPOSITION_CONSTRAINTS: &str = "\
Rules:\n\
- Emit one component per distinct sub-goal. For requests naming several targets \
  (e.g. \"users A, B, C\"), emit one data_collection component per target rather than \
  one generic collection component.\n\
- `type` must be exactly one of: data_collection, data_processing, action_execution, analysis, output.\n\
- Respond with only a JSON array, no prose.\n\
- Each element is an object: {\"id\": string, \"type\": string, \"description\": string}.";

/// Derive the task breakdown for a fresh query with no preloaded workflow.
/// Falls back to a single `action_execution` component describing the whole
/// query if the LLM response can't be parsed, so a malformed breakdown never
/// blocks planning.
pub async fn derive(llm: &dyn LanguageModel, query: &str) -> Vec<TaskComponent> {
    let prompt = format!("A user asked: \"{query}\"\n\nBreak this request down into its distinct sub-goals.\n\n{DECOMPOSITION_CONSTRAINTS}");

    match llm.complete(None, &prompt).await {
        Ok(response) => parse_components(&response).unwrap_or_else(|| fallback(query)),
        Err(_) => fallback(query),
    }
}

/// Minimal breakdown synthesized for a preloaded workflow: one component per
/// step, typed by a coarse guess from its action, already linked to that
/// step's index so completion tracking has something to attach to.
pub fn synthesize_minimal(workflow: &[WorkflowStep]) -> Vec<TaskComponent> {
    workflow
        .iter()
        .map(|step| {
            let mut component = TaskComponent::new(format!("step-{}", step.step_index), guess_component_type(&step.action), step.action.clone());
            component.required_data = Vec::new();
            component
        })
        .collect()
}

/// Coarse action-keyword → component-type guess, the same spirit as
/// `inferStepInputFromContext`'s keyword table (see
/// `crate::engine`'s pre-seeding heuristic) but applied to classifying a
/// step's goal instead of its arguments.
fn guess_component_type(action: &str) -> ComponentType {
    let lower = action.to_lowercase();
    if lower.contains("summarize") || lower.contains("summarise") || lower.contains("analyze") || lower.contains("analyse") {
        ComponentType::Analysis
    } else if lower.contains("post") || lower.contains("create") || lower.contains("send") || lower.contains("update") || lower.contains("delete") {
        ComponentType::ActionExecution
    } else if lower.contains("format") || lower.contains("combine") || lower.contains("merge") || lower.contains("transform") {
        ComponentType::DataProcessing
    } else if lower.contains("report") || lower.contains("respond") || lower.contains("answer") {
        ComponentType::Output
    } else {
        ComponentType::DataCollection
    }
}

#[derive(Deserialize)]
struct RawComponent {
    id: String,
    #[serde(rename = "type")]
    component_type: String,
    description: String,
}

fn parse_components(response: &str) -> Option<Vec<TaskComponent>> {
    let value = extract_json(response)?;
    let raw: Vec<RawComponent> = serde_json::from_value(value).ok()?;
    if raw.is_empty() {
        return None;
    }

    Some(
        raw.into_iter()
            .map(|r| TaskComponent::new(r.id, parse_component_type(&r.component_type), r.description))
            .collect(),
    )
}

fn parse_component_type(raw: &str) -> ComponentType {
    match raw {
        "data_processing" => ComponentType::DataProcessing,
        "action_execution" => ComponentType::ActionExecution,
        "analysis" => ComponentType::Analysis,
        "output" => ComponentType::Output,
        _ => ComponentType::DataCollection,
    }
}

fn fallback(query: &str) -> Vec<TaskComponent> {
    vec![TaskComponent::new("component-1", ComponentType::ActionExecution, query.to_string())]
}

/// Whether `raw_result` carries data meaningful enough to count as progress:
/// non-null, non-empty, and not obviously an error payload. Used both to mark
/// a component complete and, implicitly, as the "meaningful data" half of the
/// completion check in `crate::engine`.
pub fn result_is_meaningful(raw_result: &serde_json::Value) -> bool {
    match raw_result {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty() && !looks_like_error(s),
        serde_json::Value::Object(map) => !map.is_empty() && !map.contains_key("error"),
        serde_json::Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn looks_like_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.starts_with("error") || lower.contains("\"error\"")
}

/// Update component completion after a step succeeds (§4.F step 9): a still-
/// incomplete component is marked done when the step's tool category matches
/// the component's type and — for `data_collection` components naming a
/// target — the step's action/args/reasoning reference that target, and the
/// result carries meaningful data.
pub fn mark_progress(components: &mut [TaskComponent], step: &WorkflowStep, raw_result: &serde_json::Value) {
    if !result_is_meaningful(raw_result) {
        return;
    }
    let step_type = guess_component_type(&step.action);
    let haystack = format!(
        "{} {} {}",
        step.action,
        step.input_args,
        step.reasoning.clone().unwrap_or_default()
    )
    .to_lowercase();

    // For requests enumerating several same-typed targets, every sibling's
    // description shares generic vocabulary ("fetch", "latest posts") — only
    // the words distinguishing one sibling from the rest actually identify
    // *its* target, so matching on any shared token would mark every sibling
    // complete off the first step.
    let distinguishing = distinguishing_tokens(components);

    for (index, component) in components.iter_mut().enumerate() {
        if component.is_completed || component.component_type != step_type {
            continue;
        }

        let names_a_target = component.component_type == ComponentType::DataCollection && component.description.split_whitespace().count() > 0;
        let target_referenced = !names_a_target
            || distinguishing[index].iter().any(|tok| haystack.contains(tok.as_str()));

        if target_referenced {
            component.is_completed = true;
            component.completed_step_indices.push(step.step_index);
        }
    }
}

/// For each component, the lowercased description tokens (len > 2) that do
/// NOT also appear in another `data_collection` component's description —
/// i.e. the words that actually name *its* target rather than boilerplate
/// shared by every sibling. A component with no sibling of the same type
/// falls back to using every one of its tokens, preserving the previous
/// single-target behavior.
fn distinguishing_tokens(components: &[TaskComponent]) -> Vec<Vec<String>> {
    let all_tokens: Vec<Vec<String>> = components
        .iter()
        .map(|c| {
            c.description
                .split(|ch: char| !ch.is_alphanumeric())
                .filter(|tok| tok.len() > 2)
                .map(|tok| tok.to_lowercase())
                .collect()
        })
        .collect();

    all_tokens
        .iter()
        .enumerate()
        .map(|(index, tokens)| {
            let component = &components[index];
            let has_sibling = components
                .iter()
                .enumerate()
                .any(|(other_index, other)| other_index != index && other.component_type == component.component_type);

            if !has_sibling {
                return tokens.clone();
            }

            tokens
                .iter()
                .filter(|tok| {
                    !all_tokens
                        .iter()
                        .enumerate()
                        .any(|(other_index, other_tokens)| other_index != index && other_tokens.contains(tok))
                })
                .cloned()
                .collect()
        })
        .collect()
}
