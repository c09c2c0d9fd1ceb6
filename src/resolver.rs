//! Tool Resolver & Parameter Adapter.
//!
//! Two jobs, both LLM-assisted against the *live* tool list from a
//! connected service (not the Planner's possibly-stale guess):
//! 1. Resolve a planned tool name to one that actually exists.
//! 2. Adapt a planned call's arguments to the resolved tool's declared
//!    input schema, using the previous step's raw output as additional
//!    context when the plan's arguments reference it loosely.

use regex::Regex;

use crate::llm::{json_extract::extract_json, LanguageModel};
use crate::types::ToolDescriptor;

/// Resolve `requested` against `available`, never failing outright as long
/// as at least one tool exists.
pub async fn resolve_tool_name(llm: &dyn LanguageModel, requested: &str, available: &[ToolDescriptor]) -> Option<String> {
    if available.is_empty() {
        return None;
    }

    if available.iter().any(|t| t.name == requested) {
        return Some(requested.to_string());
    }

    if let Some(name) = ask_llm_for_match(llm, requested, available).await {
        return Some(name);
    }

    if let Some(name) = fuzzy_match(requested, available) {
        return Some(name);
    }

    Some(available[0].name.clone())
}

async fn ask_llm_for_match(llm: &dyn LanguageModel, requested: &str, available: &[ToolDescriptor]) -> Option<String> {
    let tool_list = available
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "A workflow step was planned to call a tool named \"{requested}\", but no tool has \
         exactly that name. Here are the tools actually available on this service:\n\n{tool_list}\n\n\
         Which one is the intended match? Respond with only the tool's exact name, or the word \
         NONE if nothing is close."
    );

    let response = llm.complete(None, &prompt).await.ok()?;
    let candidate = response.trim().trim_matches('"');
    available.iter().find(|t| t.name == candidate).map(|t| t.name.clone())
}

fn fuzzy_match(requested: &str, available: &[ToolDescriptor]) -> Option<String> {
    let requested_lower = requested.to_lowercase();
    available
        .iter()
        .find(|t| {
            let name_lower = t.name.to_lowercase();
            name_lower.contains(&requested_lower) || requested_lower.contains(&name_lower)
        })
        .map(|t| t.name.clone())
}

/// `(action_regex, schema_key)` rules for pre-seeding an empty step input
/// from the previous step's raw result, tried in order against the
/// planned `action` string. Keeps the keyword-matching idea from the
/// source's context inference as a short declarative table instead of a
/// chain of hard-coded `if action.contains(...)` branches.
const CONTEXT_INFERENCE_RULES: &[(&str, &str)] = &[
    (r"(?i)tweet|post", "content"),
    (r"(?i)search|find", "query"),
    (r"(?i)get|fetch|retrieve", "id"),
];

/// If `planned_args` is empty and a previous step's result is available,
/// guess a single input field from `action` using [`CONTEXT_INFERENCE_RULES`]
/// and seed it from that result. Only fires when the plan truly left the
/// step's input blank — never overrides arguments the Planner supplied.
pub fn infer_step_input(action: &str, planned_args: &serde_json::Value, previous_output: Option<&serde_json::Value>) -> serde_json::Value {
    if !is_empty_input(planned_args) {
        return planned_args.clone();
    }
    let Some(previous) = previous_output else {
        return planned_args.clone();
    };

    for (pattern, key) in CONTEXT_INFERENCE_RULES {
        let re = Regex::new(pattern).expect("valid regex");
        if re.is_match(action) {
            return serde_json::json!({ key: scalar_of(previous) });
        }
    }
    planned_args.clone()
}

fn is_empty_input(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Reduce a previous step's raw result to a single scalar worth seeding
/// into the next step's input: a bare string/number passes through, an
/// object yields its first common content-ish field, anything else is
/// stringified.
fn scalar_of(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(_) | serde_json::Value::Number(_) => value.clone(),
        serde_json::Value::Object(map) => {
            for key in ["id", "text", "content", "query", "value"] {
                if let Some(found) = map.get(key) {
                    return found.clone();
                }
            }
            value.clone()
        }
        other => other.clone(),
    }
}

/// Adapt `planned_args` to `tool`'s declared input schema. Falls back to
/// `planned_args` unchanged (after a camelCase→snake_case pass) if the LLM
/// call fails or returns something unparseable — never blocks the step on
/// an adaptation failure.
pub async fn adapt_parameters(
    llm: &dyn LanguageModel,
    tool: &ToolDescriptor,
    planned_args: &serde_json::Value,
    previous_output: Option<&serde_json::Value>,
) -> serde_json::Value {
    let schema_text = serde_json::to_string_pretty(&tool.input_schema).unwrap_or_default();
    let planned_text = serde_json::to_string(planned_args).unwrap_or_default();
    let previous_text = previous_output.map(|v| serde_json::to_string(v).unwrap_or_default());

    let mut prompt = format!(
        "Adapt the following planned arguments so their keys exactly match the tool's input \
         schema property names. Keep all values; only rename/restructure keys as needed.\n\n\
         Tool input schema:\n{schema_text}\n\nPlanned arguments:\n{planned_text}\n"
    );
    if let Some(previous_text) = &previous_text {
        prompt.push_str(&format!("\nThe previous step's raw output, for context if the planned \
             arguments reference it (e.g. \"the result from the last step\"):\n{previous_text}\n"));
    }
    prompt.push_str("\nRespond with only the adapted arguments as a single JSON object.");

    match llm.complete(None, &prompt).await {
        Ok(response) => match extract_json(&response) {
            Some(value) if value.is_object() => rename_camel_to_snake(value, &tool.input_schema),
            _ => rename_camel_to_snake(planned_args.clone(), &tool.input_schema),
        },
        Err(_) => rename_camel_to_snake(planned_args.clone(), &tool.input_schema),
    }
}

/// Declared property names of a JSON Schema object, for checking a
/// renamed key actually belongs to the tool's input shape.
fn schema_property_names(schema: &serde_json::Value) -> std::collections::HashSet<&str> {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| props.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Post-processing pass: LLMs frequently emit camelCase keys even when
/// asked for exact schema names. Per §4.C, a remaining key is renamed only
/// when its snake_case form is itself a property the schema declares —
/// otherwise the key is passed through unchanged rather than guessed at.
fn rename_camel_to_snake(value: serde_json::Value, schema: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let properties = schema_property_names(schema);
            let renamed = map
                .into_iter()
                .map(|(k, v)| {
                    let snake = to_snake_case(&k);
                    if snake != k && properties.contains(snake.as_str()) {
                        (snake, v)
                    } else {
                        (k, v)
                    }
                })
                .collect::<serde_json::Map<_, _>>();
            serde_json::Value::Object(renamed)
        }
        other => other,
    }
}

fn to_snake_case(key: &str) -> String {
    let re = Regex::new(r"([a-z0-9])([A-Z])").expect("valid regex");
    re.replace_all(key, "${1}_${2}").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLanguageModel;

    fn tool(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {"coin_id": {"type": "string"}}}),
        }
    }

    #[tokio::test]
    async fn exact_name_resolves_without_calling_the_llm() {
        let llm = StubLanguageModel::with_fallback("should not be used");
        let tools = vec![tool("get_price", "price lookup")];
        let resolved = resolve_tool_name(&llm, "get_price", &tools).await;
        assert_eq!(resolved, Some("get_price".to_string()));
        assert!(llm.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn llm_match_is_validated_against_the_live_list() {
        let llm = StubLanguageModel::new(vec!["get_price".to_string()]);
        let tools = vec![tool("get_price", "price lookup")];
        let resolved = resolve_tool_name(&llm, "fetch_price", &tools).await;
        assert_eq!(resolved, Some("get_price".to_string()));
    }

    #[tokio::test]
    async fn hallucinated_llm_match_falls_through_to_fuzzy() {
        let llm = StubLanguageModel::new(vec!["made_up_tool".to_string()]);
        let tools = vec![tool("get_price_data", "price lookup")];
        let resolved = resolve_tool_name(&llm, "get_price", &tools).await;
        assert_eq!(resolved, Some("get_price_data".to_string()));
    }

    #[tokio::test]
    async fn emergency_fallback_to_first_tool() {
        let llm = StubLanguageModel::new(vec!["NONE".to_string()]);
        let tools = vec![tool("totally_unrelated", "does something else")];
        let resolved = resolve_tool_name(&llm, "get_price", &tools).await;
        assert_eq!(resolved, Some("totally_unrelated".to_string()));
    }

    #[tokio::test]
    async fn no_tools_available_resolves_to_none() {
        let llm = StubLanguageModel::with_fallback("NONE");
        let resolved = resolve_tool_name(&llm, "get_price", &[]).await;
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn adapts_camel_case_args_from_llm_response() {
        let llm = StubLanguageModel::new(vec![r#"{"coinId": "bitcoin"}"#.to_string()]);
        let t = tool("get_price", "price lookup");
        let adapted = adapt_parameters(&llm, &t, &serde_json::json!({"coin": "bitcoin"}), None).await;
        assert_eq!(adapted, serde_json::json!({"coin_id": "bitcoin"}));
    }

    #[tokio::test]
    async fn a_camel_case_key_with_no_matching_schema_property_passes_through_unchanged() {
        // the schema only declares `coin_id` — `marketCap` has no snake_case
        // counterpart in it, so it must not be renamed on a guess.
        let llm = StubLanguageModel::new(vec![r#"{"marketCap": 123}"#.to_string()]);
        let t = tool("get_price", "price lookup");
        let adapted = adapt_parameters(&llm, &t, &serde_json::json!({}), None).await;
        assert_eq!(adapted, serde_json::json!({"marketCap": 123}));
    }

    #[tokio::test]
    async fn falls_back_to_planned_args_when_llm_response_unparseable() {
        let llm = StubLanguageModel::new(vec!["not json at all".to_string()]);
        let t = tool("get_price", "price lookup");
        let adapted = adapt_parameters(&llm, &t, &serde_json::json!({"coinId": "bitcoin"}), None).await;
        assert_eq!(adapted, serde_json::json!({"coin_id": "bitcoin"}));
    }

    #[test]
    fn infers_content_field_for_a_posting_action_with_empty_input() {
        let previous = serde_json::json!({"text": "big news today"});
        let seeded = infer_step_input("post_tweet", &serde_json::json!({}), Some(&previous));
        assert_eq!(seeded, serde_json::json!({"content": "big news today"}));
    }

    #[test]
    fn infers_query_field_for_a_search_action() {
        let previous = serde_json::json!("bitcoin");
        let seeded = infer_step_input("search_news", &serde_json::json!(null), Some(&previous));
        assert_eq!(seeded, serde_json::json!({"query": "bitcoin"}));
    }

    #[test]
    fn infers_id_field_for_a_get_action_from_an_object_result() {
        let previous = serde_json::json!({"id": "42", "name": "ignored"});
        let seeded = infer_step_input("get_user", &serde_json::json!({}), Some(&previous));
        assert_eq!(seeded, serde_json::json!({"id": "42"}));
    }

    #[test]
    fn leaves_nonempty_planned_args_untouched() {
        let previous = serde_json::json!({"id": "42"});
        let planned = serde_json::json!({"id": "already-set"});
        let seeded = infer_step_input("get_user", &planned, Some(&previous));
        assert_eq!(seeded, planned);
    }

    #[test]
    fn no_previous_result_leaves_empty_input_empty() {
        let seeded = infer_step_input("get_user", &serde_json::json!({}), None);
        assert_eq!(seeded, serde_json::json!({}));
    }

    #[test]
    fn snake_case_rename_is_idempotent() {
        assert_eq!(to_snake_case("coin_id"), "coin_id");
        assert_eq!(to_snake_case("coinId"), "coin_id");
        assert_eq!(to_snake_case("marketCapUsd"), "market_cap_usd");
    }
}
