//! Complexity Analyzer: buckets a query into a
//! [`ComplexityClass`] to size the iteration/observation budget, falling
//! back to an LLM call when pattern matching can't decide.

use crate::llm::LanguageModel;
use crate::types::ComplexityClass;

/// `^(show me|get|fetch|what is|current|latest) …`
const SIMPLE_PREFIXES: &[&str] = &["show me", "get ", "fetch ", "what is", "what's", "current", "latest", "how much"];

/// Comparison/aggregation verbs, "then/next/after", and multi-subject hints.
const MEDIUM_PATTERNS: &[&str] = &[
    "compare", "contrast", "versus", " vs ", "aggregate", "average", "then", "next", "after that", "multiple", "all of", "each of", "several",
];

/// Workflow/pipeline vocabulary.
const COMPLEX_PATTERNS: &[&str] = &["workflow", "pipeline", "orchestrate", "multi-step", "multi step"];

/// A query this long reads as a complex_workflow regardless of vocabulary.
const VERY_LONG_QUERY_WORDS: usize = 40;

/// Fast, allocation-free pattern match over the lowercased query, plus the
/// preloaded workflow's length when one is known. Returns `None` when no
/// bucket's patterns or length thresholds fire, leaving the decision to the
/// LLM fallback. Workflow vocabulary and very long queries are checked first
/// since they're the strongest signal; comparison verbs and connectors
/// ("compare... then...") land in medium_task even though they share
/// surface words with complex-sounding requests. A known workflow length is
/// checked as an independent signal alongside vocabulary, per §4.I's
/// "workflow length ≤ 2 / in [3,5] / > 5" bucket criteria.
fn classify_by_pattern(query: &str, workflow_len: Option<usize>) -> Option<ComplexityClass> {
    let lower = query.to_lowercase();
    let word_count = lower.split_whitespace().count();

    if COMPLEX_PATTERNS.iter().any(|p| lower.contains(p)) || word_count > VERY_LONG_QUERY_WORDS || workflow_len.is_some_and(|n| n > 5) {
        return Some(ComplexityClass::ComplexWorkflow);
    }

    if workflow_len.is_some_and(|n| n <= 2) || (SIMPLE_PREFIXES.iter().any(|p| lower.starts_with(p)) && word_count <= 12) {
        return Some(ComplexityClass::SimpleQuery);
    }

    if workflow_len.is_some_and(|n| (3..=5).contains(&n)) || MEDIUM_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ComplexityClass::MediumTask);
    }

    None
}

/// Classify `query`, asking `llm` only when pattern matching is inconclusive.
/// `workflow_len` is the preloaded workflow's step count, when the caller
/// already has one — `None` when the workflow is still to be planned.
pub async fn classify(llm: &dyn LanguageModel, query: &str, workflow_len: Option<usize>) -> ComplexityClass {
    if let Some(class) = classify_by_pattern(query, workflow_len) {
        return class;
    }

    let prompt = format!(
        "Classify the complexity of this user request as exactly one word: \
         simple_query, medium_task, or complex_workflow.\n\n\
         simple_query: a single fact lookup or calculation.\n\
         medium_task: a handful of related steps toward one goal.\n\
         complex_workflow: multiple distinct goals, branching, or explicit ordering.\n\n\
         Request: {query}\n\nAnswer with exactly one of the three words."
    );

    match llm.complete(None, &prompt).await {
        Ok(response) => parse_class(&response).unwrap_or(ComplexityClass::MediumTask),
        Err(_) => ComplexityClass::MediumTask,
    }
}

fn parse_class(response: &str) -> Option<ComplexityClass> {
    let lower = response.to_lowercase();
    if lower.contains("complex_workflow") {
        Some(ComplexityClass::ComplexWorkflow)
    } else if lower.contains("simple_query") {
        Some(ComplexityClass::SimpleQuery)
    } else if lower.contains("medium_task") {
        Some(ComplexityClass::MediumTask)
    } else {
        None
    }
}

/// Clamp the class's default step budget against the caller's cap:
/// `max_iterations = min(caller_cap, recommended_steps)`.
pub fn step_budget(class: ComplexityClass, caller_cap: u32) -> u32 {
    class.default_step_budget().min(caller_cap).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLanguageModel;

    #[tokio::test]
    async fn pattern_match_catches_simple_queries_without_calling_the_llm() {
        let llm = StubLanguageModel::with_fallback("should not be used");
        let class = classify(&llm, "Show me current Bitcoin price", None).await;
        assert_eq!(class, ComplexityClass::SimpleQuery);
        assert_eq!(step_budget(class, 10), 1);
        assert!(llm.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn comparison_verbs_and_connectors_land_in_medium_not_complex() {
        let llm = StubLanguageModel::with_fallback("should not be used");
        let class = classify(&llm, "Compare BTC and ETH trends then summarise", None).await;
        assert_eq!(class, ComplexityClass::MediumTask);
    }

    #[tokio::test]
    async fn pattern_match_catches_complex_workflows_by_vocabulary_or_length() {
        let llm = StubLanguageModel::with_fallback("should not be used");
        assert_eq!(classify(&llm, "orchestrate a multi-step data pipeline across these services", None).await, ComplexityClass::ComplexWorkflow);

        let long_query = "first ".repeat(45);
        assert_eq!(classify(&llm, &long_query, None).await, ComplexityClass::ComplexWorkflow);
    }

    #[tokio::test]
    async fn preloaded_workflow_length_buckets_independently_of_vocabulary() {
        let llm = StubLanguageModel::with_fallback("should not be used");
        assert_eq!(classify(&llm, "do the thing", Some(1)).await, ComplexityClass::SimpleQuery);
        assert_eq!(classify(&llm, "do the thing", Some(4)).await, ComplexityClass::MediumTask);
        assert_eq!(classify(&llm, "do the thing", Some(8)).await, ComplexityClass::ComplexWorkflow);
    }

    #[tokio::test]
    async fn falls_back_to_llm_when_inconclusive() {
        let llm = StubLanguageModel::new(vec!["medium_task".to_string()]);
        let class = classify(&llm, "summarize the repository structure", None).await;
        assert_eq!(class, ComplexityClass::MediumTask);
        assert_eq!(llm.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_llm_response_defaults_to_medium() {
        let llm = StubLanguageModel::new(vec!["I'm not sure!".to_string()]);
        let class = classify(&llm, "look into the thing", None).await;
        assert_eq!(class, ComplexityClass::MediumTask);
    }

    #[test]
    fn step_budget_respects_caller_cap() {
        assert_eq!(step_budget(ComplexityClass::ComplexWorkflow, 3), 3);
        assert_eq!(step_budget(ComplexityClass::SimpleQuery, 10), 1);
        assert_eq!(step_budget(ComplexityClass::MediumTask, 0), 1);
    }
}
