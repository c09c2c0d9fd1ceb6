//! Observer: after every step, decides whether to keep going,
//! stop, or adapt the remaining plan. Runs after every step regardless of
//! complexity class — only the iteration budget
//! that bounds how many times it gets to run varies by class.

use serde::Deserialize;

use crate::llm::{json_extract::extract_json, LanguageModel};
use crate::types::{ComplexityClass, HistoryEntry, TaskComponent};

/// The Observer's verdict for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub should_continue: bool,
    pub should_adapt_workflow: bool,
    pub reason: Option<String>,
    pub confidence_score: f32,
}

impl Default for Observation {
    /// Parse-failure default — an unreadable verdict must never
    /// stall a run that's otherwise making progress.
    fn default() -> Self {
        Self {
            should_continue: true,
            should_adapt_workflow: false,
            reason: None,
            confidence_score: 0.5,
        }
    }
}

#[derive(Deserialize)]
struct RawObservation {
    should_continue: bool,
    #[serde(default)]
    should_adapt_workflow: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default = "default_confidence")]
    confidence_score: f32,
}

fn default_confidence() -> f32 {
    0.5
}

/// Decision guidance folded into every observation prompt: how aggressively
/// to stop varies with complexity class, and multi-target requests get their
/// own stricter rule regardless of class.
const DECISION_GUIDANCE: &str = "\
Guidance:\n\
- simple_query: if the latest step succeeded with meaningful data, stop (should_continue=false).\n\
- medium_task: stop once the principal objective is visible in the results so far.\n\
- complex_workflow: stop only once every component in the breakdown below is marked complete.\n\
- If the original request explicitly enumerates multiple targets, stop only once a distinct \
  successful collection is visible for every one of them, regardless of complexity class.";

fn breakdown_prompt_block(components: &[TaskComponent]) -> String {
    if components.is_empty() {
        return String::new();
    }
    let lines = components
        .iter()
        .map(|c| format!("- [{}] {:?} ({}): {}", c.id, c.component_type, if c.is_completed { "complete" } else { "incomplete" }, c.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!("\nTask breakdown:\n{lines}\n")
}

/// Render the full execution history — every step's status and a snippet of
/// its raw result — not just the most recent entry, per §4.E.
fn history_prompt_block(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let lines = history
        .iter()
        .map(|h| format!("- step {} ({} · {}): {} — {}", h.step_index, h.tool, h.action, if h.success { "ok" } else { "failed" }, h.result_summary))
        .collect::<Vec<_>>()
        .join("\n");
    format!("\nExecution history so far:\n{lines}\n")
}

fn data_store_keys_prompt_block(data_store_keys: &[String]) -> String {
    if data_store_keys.is_empty() {
        return String::new();
    }
    format!("\nData already collected (keys): {}\n", data_store_keys.join(", "))
}

/// Ask the Observer whether the run should continue, after the step at the
/// end of `history` just ran.
#[allow(clippy::too_many_arguments)]
pub async fn observe(
    llm: &dyn LanguageModel,
    original_query: &str,
    history: &[HistoryEntry],
    data_store_keys: &[String],
    remaining_steps: u32,
    complexity: ComplexityClass,
    current_iteration: u32,
    max_iterations: u32,
    completed_count: u32,
    failed_count: u32,
    components: &[TaskComponent],
) -> Observation {
    let prompt = format!(
        "Original request: \"{original_query}\"\n\
         Complexity class: {complexity:?}\n\
         Iteration {current_iteration} of at most {max_iterations}.\n\
         Steps remaining in the current plan: {remaining_steps}\n\
         Completed steps: {completed_count}. Failed steps: {failed_count}.\n\
         {}{}{}\n\
         {DECISION_GUIDANCE}\n\n\
         Decide whether execution should continue toward answering the original request, and \
         whether the remaining plan needs to change (e.g. because new information changed what's \
         needed, or a step failed in a way the current plan doesn't account for).\n\n\
         Respond with only a JSON object: {{\"should_continue\": bool, \"should_adapt_workflow\": bool, \
         \"reason\": string, \"confidence_score\": number between 0 and 1}}.",
        breakdown_prompt_block(components),
        history_prompt_block(history),
        data_store_keys_prompt_block(data_store_keys),
    );

    match llm.complete(None, &prompt).await {
        Ok(response) => parse_observation(&response).unwrap_or_default(),
        Err(_) => Observation::default(),
    }
}

fn parse_observation(response: &str) -> Option<Observation> {
    let value = extract_json(response)?;
    let raw: RawObservation = serde_json::from_value(value).ok()?;
    Some(Observation {
        should_continue: raw.should_continue,
        should_adapt_workflow: raw.should_adapt_workflow,
        reason: raw.reason,
        confidence_score: raw.confidence_score.clamp(0.0, 1.0),
    })
}
