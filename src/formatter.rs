//! Event Stream Formatter: streams a tool's raw JSON result
//! through the LLM as Markdown chunks for `step_result_chunk`/
//! `step_formatted_result`, and likewise streams the final run summary as
//! `summary_chunk`s. Both streaming calls fall back to a fast, deterministic
//! renderer when the LLM transport fails.

use futures::StreamExt;

use crate::llm::LanguageModel;

/// Fields longer than this are elided from the formatted Markdown (but
/// never from the raw result recorded via `step_raw_result`/persistence) —
/// a single oversized field must not flood the event stream.
const MAX_FIELD_CHARS: usize = 3000;

/// Above this size, the LLM is instructed to keep only the 10-15 most
/// user-relevant fields rather than rendering the payload verbatim, filtering
/// out verbose low-signal fields such as bloom filters or hex-blob metadata.
const FILTER_THRESHOLD_CHARS: usize = 3000;

/// Stream a tool's raw result through the LLM as clean Markdown, invoking
/// `on_chunk` with each piece as it arrives. Returns the full concatenated
/// text, which is the authoritative formatted string for persistence and
/// for the `step_formatted_result` event. Falls back to the deterministic
/// field-by-field renderer if the LLM call fails outright or returns
/// nothing usable.
pub async fn stream_format_step_result(
    llm: &dyn LanguageModel,
    tool: &str,
    action: &str,
    raw: &serde_json::Value,
    mut on_chunk: impl FnMut(String),
) -> String {
    let raw_text = serde_json::to_string_pretty(raw).unwrap_or_default();
    let mut prompt = format!(
        "Convert the following tool result into clean, readable Markdown for a user. \
         Tool: {tool}, action: {action}.\n\nResult:\n{raw_text}\n"
    );
    if raw_text.chars().count() > FILTER_THRESHOLD_CHARS {
        prompt.push_str(
            "\nThis payload is large. Keep only the 10-15 fields most relevant to the user; \
             drop verbose low-signal fields (bloom filters, hashes, opaque blob metadata, \
             pagination cursors) entirely rather than truncating them.\n",
        );
    }
    prompt.push_str("\nRespond with only the Markdown, no surrounding prose or code fences.");

    match llm.stream(None, &prompt).await {
        Ok(mut chunks) => {
            let mut joined = String::new();
            let mut saw_any = false;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(text) => {
                        if !text.is_empty() {
                            saw_any = true;
                            on_chunk(text.clone());
                            joined.push_str(&text);
                        }
                    }
                    Err(_) => break,
                }
            }
            if saw_any && !joined.trim().is_empty() {
                joined
            } else {
                format_step_result(tool, action, raw)
            }
        }
        Err(_) => format_step_result(tool, action, raw),
    }
}

/// Stream the final run summary, invoking `on_chunk` per piece. Returns the
/// full concatenated text, persisted as the run's `save_final_result`
/// summary.
pub async fn stream_summarize_run(llm: &dyn LanguageModel, original_query: &str, history_summary: &str, mut on_chunk: impl FnMut(String)) -> String {
    let prompt = summary_prompt(original_query, history_summary);
    match llm.stream(None, &prompt).await {
        Ok(mut chunks) => {
            let mut joined = String::new();
            let mut saw_any = false;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(text) => {
                        if !text.is_empty() {
                            saw_any = true;
                            on_chunk(text.clone());
                            joined.push_str(&text);
                        }
                    }
                    Err(_) => break,
                }
            }
            if saw_any && !joined.trim().is_empty() {
                joined
            } else {
                "Unable to generate a summary for this run.".to_string()
            }
        }
        Err(_) => "Unable to generate a summary for this run.".to_string(),
    }
}

fn summary_prompt(original_query: &str, history_summary: &str) -> String {
    format!(
        "Original request: \"{original_query}\"\n\nSteps executed and their outcomes:\n{history_summary}\n\n\
         Write a concise final answer to the original request, grounded only in the step \
         outcomes above. If some steps failed or were skipped, say so plainly rather than \
         guessing at what they would have returned."
    )
}

/// Deterministic, non-LLM Markdown render of a tool's raw JSON result — the
/// fallback path when streaming formatting isn't available, and the fast
/// path used directly by tests that don't need LLM-quality prose.
pub fn format_step_result(tool: &str, action: &str, raw: &serde_json::Value) -> String {
    let mut out = format!("**{tool} · {action}**\n\n");
    render_value(raw, 0, &mut out);
    out
}

fn render_value(value: &serde_json::Value, depth: usize, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                render_field(key, v, depth, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                out.push_str(&format!("{}- item {}: ", "  ".repeat(depth), i + 1));
                render_inline(item, out);
                out.push('\n');
            }
        }
        other => {
            render_inline(other, out);
            out.push('\n');
        }
    }
}

fn render_field(key: &str, value: &serde_json::Value, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    match value {
        serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
            out.push_str(&format!("{indent}- **{key}**:\n"));
            render_value(value, depth + 1, out);
        }
        other => {
            out.push_str(&format!("{indent}- **{key}**: "));
            render_inline(other, out);
            out.push('\n');
        }
    }
}

fn render_inline(value: &serde_json::Value, out: &mut String) {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_FIELD_CHARS {
        let truncated: String = text.chars().take(MAX_FIELD_CHARS).collect();
        out.push_str(&truncated);
        out.push_str(&format!("\n  … truncated ({} chars total)", text.chars().count()));
    } else {
        out.push_str(&text);
    }
}

/// Non-streaming variant of [`stream_summarize_run`] that produces the same
/// string in one call — used where a caller
/// wants the finished text without consuming a chunk stream, e.g. tests.
pub async fn summarize_run(llm: &dyn LanguageModel, original_query: &str, history_summary: &str) -> String {
    llm.complete(None, &summary_prompt(original_query, history_summary))
        .await
        .unwrap_or_else(|_| "Unable to generate a summary for this run.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLanguageModel;

    #[test]
    fn formats_flat_object() {
        let raw = serde_json::json!({"price_usd": 65000, "symbol": "btc"});
        let markdown = format_step_result("coingecko", "get_price", &raw);
        assert!(markdown.contains("**coingecko · get_price**"));
        assert!(markdown.contains("**price_usd**: 65000"));
        assert!(markdown.contains("**symbol**: btc"));
    }

    #[test]
    fn truncates_oversized_fields() {
        let long = "x".repeat(5000);
        let raw = serde_json::json!({"body": long});
        let markdown = format_step_result("github", "get_issue", &raw);
        assert!(markdown.contains("truncated (5000 chars total)"));
        assert!(markdown.len() < 4500);
    }

    #[test]
    fn renders_arrays_of_objects() {
        let raw = serde_json::json!([{"name": "a"}, {"name": "b"}]);
        let markdown = format_step_result("github", "search_repositories", &raw);
        assert!(markdown.contains("item 1"));
        assert!(markdown.contains("item 2"));
    }

    #[tokio::test]
    async fn summarize_run_uses_the_llm() {
        let llm = StubLanguageModel::new(vec!["Bitcoin is currently $65,000.".to_string()]);
        let summary = summarize_run(&llm, "what's the price of bitcoin", "step 1: get_price -> success").await;
        assert_eq!(summary, "Bitcoin is currently $65,000.");
    }

    #[tokio::test]
    async fn summarize_run_falls_back_on_llm_error() {
        struct FailingLlm;
        #[async_trait::async_trait]
        impl LanguageModel for FailingLlm {
            async fn complete(&self, _system: Option<&str>, _user: &str) -> anyhow::Result<String> {
                Err(anyhow::anyhow!("endpoint unreachable"))
            }
        }
        let summary = summarize_run(&FailingLlm, "q", "nothing").await;
        assert_eq!(summary, "Unable to generate a summary for this run.");
    }

    #[tokio::test]
    async fn stream_format_step_result_concatenates_chunks_to_the_full_text() {
        let llm = StubLanguageModel::new(vec!["**price**: $65,000".to_string()]);
        let raw = serde_json::json!({"price_usd": 65000});
        let mut chunks = Vec::new();
        let joined = stream_format_step_result(&llm, "coingecko", "get_price", &raw, |c| chunks.push(c)).await;
        assert_eq!(joined, "**price**: $65,000");
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), joined);
    }

    #[tokio::test]
    async fn stream_format_step_result_falls_back_to_deterministic_render_on_llm_failure() {
        struct FailingLlm;
        #[async_trait::async_trait]
        impl LanguageModel for FailingLlm {
            async fn complete(&self, _system: Option<&str>, _user: &str) -> anyhow::Result<String> {
                Err(anyhow::anyhow!("endpoint unreachable"))
            }
        }
        let raw = serde_json::json!({"price_usd": 65000});
        let mut chunks = Vec::new();
        let joined = stream_format_step_result(&FailingLlm, "coingecko", "get_price", &raw, |c| chunks.push(c)).await;
        assert!(chunks.is_empty());
        assert!(joined.contains("**price_usd**: 65000"));
    }

    #[tokio::test]
    async fn stream_summarize_run_concatenates_chunks_to_the_full_text() {
        let llm = StubLanguageModel::new(vec!["Bitcoin is currently $65,000.".to_string()]);
        let mut chunks = Vec::new();
        let joined = stream_summarize_run(&llm, "price of bitcoin", "step 1: ok", |c| chunks.push(c)).await;
        assert_eq!(joined, "Bitcoin is currently $65,000.");
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), joined);
    }
}
