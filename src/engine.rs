//! The Engine: `EngineServices` dependency bundle and the `execute` main
//! loop — plan, act, observe, repeat until the Observer says
//! stop, the plan is exhausted, the iteration budget runs out, or the run
//! is cancelled.

use std::sync::Arc;

use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::auth::{self, AuthStore};
use crate::breakdown;
use crate::clock::Clock;
use crate::complexity;
use crate::config::Config;
use crate::error::ErrorClass;
use crate::events::{self, Event, EventSender, Progress};
use crate::formatter;
use crate::llm::LanguageModel;
use crate::mcp::ConnectionManager;
use crate::observer;
use crate::persistence::PersistenceSink;
use crate::planner::{self, AvailableService};
use crate::registry::ServiceRegistry;
use crate::resolver;
use crate::strategy;
use crate::types::{ComplexityClass, ExecutionState, FailureRecord, HistoryEntry, Strategy, Task, TaskStatus, TerminateReason, ToolDescriptor, WorkflowStep};

/// Dependency-injection bundle the Engine runs against: every collaborator is a trait object so the real subprocess
/// manager, real LLM client, and real sqlite stores can be swapped for
/// deterministic stubs in tests without touching `execute` itself.
pub struct EngineServices {
    pub manager: Arc<dyn ConnectionManager>,
    pub auth: Arc<dyn AuthStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub registry: Arc<ServiceRegistry>,
    pub sink: Arc<dyn PersistenceSink>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

/// Run `task` to completion (or termination) and return its event stream.
/// Spawns the main loop on the tokio runtime; the returned stream yields
/// events as they're produced and ends once `task_execution_complete` has
/// been sent.
pub fn execute(services: Arc<EngineServices>, task: Task, cancel: CancellationToken) -> UnboundedReceiverStream<Event> {
    let (tx, rx) = events::channel();
    tokio::spawn(run(services, task, cancel, tx));
    rx
}

#[instrument(skip(services, cancel, events), fields(task_id = %task.task_id, user_id = %task.user_id))]
async fn run(services: Arc<EngineServices>, task: Task, cancel: CancellationToken, events: EventSender) {
    let _ = services.sink.update_task_status(&task.task_id, TaskStatus::InProgress).await;

    let workflow_len = task.preloaded_workflow.as_ref().map(|w| w.len());
    let complexity_class = complexity::classify(services.llm.as_ref(), &task.query, workflow_len).await;
    let max_iterations = complexity::step_budget(complexity_class, services.config.max_iterations_cap);

    events.send(Event::ExecutionStart {
        task_id: task.task_id.clone(),
        engine: "orkestra".to_string(),
        complexity: complexity_name(complexity_class),
        step_budget: max_iterations,
        timestamp: services.clock.now(),
    });

    let (workflow, components) = match &task.preloaded_workflow {
        Some(steps) => (steps.clone(), breakdown::synthesize_minimal(steps)),
        None => {
            let components = breakdown::derive(services.llm.as_ref(), &task.query).await;
            let available = available_services(&services.registry);
            let workflow = planner::plan(services.llm.as_ref(), &task.query, &available, &components).await;
            (workflow, components)
        }
    };

    if workflow.is_empty() {
        events.send(Event::TaskExecutionError {
            task_id: task.task_id.clone(),
            reason: "planner produced an empty workflow".to_string(),
        });
        let _ = services.sink.update_task_status(&task.task_id, TaskStatus::Failed).await;
        return;
    }

    if let Err(reason) = ensure_connections(&services, &task, &workflow, &events).await {
        events.send(Event::TaskExecutionError { task_id: task.task_id.clone(), reason });
        let _ = services.sink.update_task_status(&task.task_id, TaskStatus::Failed).await;
        return;
    }

    let mut state = ExecutionState::new(task.task_id.clone(), task.query.clone(), workflow, max_iterations);
    state.components = components;

    while state.current_step_index < state.workflow.len() && state.current_iteration < state.max_iterations {
        if cancel.is_cancelled() {
            state.terminate = Some(TerminateReason::Cancelled);
            break;
        }

        state.current_iteration += 1;
        let step_index = state.current_step_index;
        let step_id = state.workflow[step_index].step_index;
        let step_mcp_name = state.workflow[step_index].mcp_name.clone();
        let step_action = state.workflow[step_index].action.clone();
        let total = state.workflow.len() as u32;

        let outcome = execute_step(&services, &task, &mut state, step_index, &events, &cancel).await;

        // Whether the shared Observer call below still runs for this step.
        // It's skipped only when a strategy already forced termination —
        // there's nothing left to decide at that point.
        let mut consult_observer = true;

        match outcome {
            StepOutcome::Cancelled => {
                state.terminate = Some(TerminateReason::Cancelled);
                break;
            }
            StepOutcome::Done(result) => {
                state.completed_count += 1;
                state.set_step_result(step_id, result.clone());
                breakdown::mark_progress(&mut state.components, &state.workflow[step_index], &result);
                state.history.push(HistoryEntry {
                    step_index: step_id,
                    tool: step_mcp_name.clone(),
                    action: step_action.clone(),
                    success: true,
                    result_summary: truncate_summary(&result),
                });
                events.send(Event::StepComplete {
                    step: step_id,
                    agent_name: step_mcp_name.clone(),
                    progress: Progress { completed: state.completed_count, failed: state.failed_count, total },
                });
                state.current_step_index += 1;
            }
            StepOutcome::Failed(Strategy::Skip, error) => {
                state.failed_count += 1;
                state.errors.push(error.clone());
                state.history.push(HistoryEntry { step_index: step_id, tool: step_mcp_name.clone(), action: step_action.clone(), success: false, result_summary: error.clone() });
                events.send(Event::StepError {
                    step: step_id,
                    agent_name: step_mcp_name.clone(),
                    error,
                    tool_details: None,
                    progress: Progress { completed: state.completed_count, failed: state.failed_count, total },
                });
                state.terminate = Some(TerminateReason::Skip);
                consult_observer = false;
            }
            StepOutcome::Failed(Strategy::ManualIntervention, error) => {
                state.failed_count += 1;
                state.errors.push(error.clone());
                state.history.push(HistoryEntry { step_index: step_id, tool: step_mcp_name.clone(), action: step_action.clone(), success: false, result_summary: error.clone() });
                events.send(Event::StepError {
                    step: step_id,
                    agent_name: step_mcp_name.clone(),
                    error,
                    tool_details: None,
                    progress: Progress { completed: state.completed_count, failed: state.failed_count, total },
                });
                state.terminate = Some(TerminateReason::ManualIntervention);
                consult_observer = false;
            }
            StepOutcome::Failed(Strategy::Alternative, error) => {
                state.failed_count += 1;
                state.errors.push(error.clone());
                state.history.push(HistoryEntry { step_index: step_id, tool: step_mcp_name.clone(), action: step_action.clone(), success: false, result_summary: error.clone() });
                events.send(Event::StepError {
                    step: step_id,
                    agent_name: step_mcp_name.clone(),
                    error: error.clone(),
                    tool_details: None,
                    progress: Progress { completed: state.completed_count, failed: state.failed_count, total },
                });

                let attempts = state.failure_records.get(&step_mcp_name).map(|r| r.attempt_count).unwrap_or(0);
                if attempts >= 3 {
                    state.terminate = Some(TerminateReason::Skip);
                    consult_observer = false;
                } else {
                    // Leave the failed step behind and defer any replanning to the
                    // Observer's adapt decision below — §4.F step 8 only says the
                    // next plan "may" replan around it, not that this strategy
                    // replans on the spot. Keeping the single replan call site also
                    // keeps `completed_count + failed_count` reconciled against
                    // `workflow.len()` after a truncate: the tail is always cut at
                    // `current_step_index`, never at an index still counted as
                    // pending.
                    state.current_step_index += 1;
                }
            }
            StepOutcome::Failed(Strategy::Retry, _) => unreachable!("execute_step resolves Retry internally before returning"),
        }

        if !consult_observer {
            break;
        }

        let remaining = state.workflow.len() as u32 - state.current_step_index as u32;
        let data_store_keys: Vec<String> = state.data_store.keys().cloned().collect();
        let observation = observer::observe(
            services.llm.as_ref(),
            &task.query,
            &state.history,
            &data_store_keys,
            remaining,
            complexity_class,
            state.current_iteration,
            state.max_iterations,
            state.completed_count,
            state.failed_count,
            &state.components,
        )
        .await;

        events.send(Event::TaskObservation {
            step: step_id,
            should_continue: observation.should_continue,
            should_adapt_workflow: observation.should_adapt_workflow,
            confidence_score: observation.confidence_score,
        });

        if !observation.should_continue {
            state.terminate = Some(TerminateReason::ObserverCompleted);
            break;
        }

        if observation.should_adapt_workflow {
            let from_index = state.current_step_index as u32 + 1;
            let available = available_services(&services.registry);
            let reason = observation.reason.clone().unwrap_or_else(|| "observer requested adaptation".to_string());
            let history_summary = summarize_history(&state.history);
            let data_store_keys: Vec<String> = state.data_store.keys().cloned().collect();
            let new_tail = planner::replan_tail(
                services.llm.as_ref(),
                &task.query,
                &available,
                &state.components,
                &data_store_keys,
                &reason,
                &history_summary,
                from_index,
            )
            .await;
            if !new_tail.is_empty() {
                let new_indices: Vec<u32> = new_tail.iter().map(|s| s.step_index).collect();
                state.workflow.truncate(state.current_step_index);
                state.workflow.extend(new_tail);
                events.send(Event::WorkflowAdapted { reason, new_steps: new_indices });
            }
        }
    }

    services.manager.disconnect_all(&task.user_id).await;

    if matches!(state.terminate, Some(TerminateReason::Cancelled)) {
        let _ = services.sink.update_task_status(&task.task_id, TaskStatus::Failed).await;
        events.send(Event::TaskExecutionError { task_id: task.task_id.clone(), reason: "cancelled".to_string() });
        return;
    }

    let success = state.completed_count >= 1 && matches!(state.terminate, None | Some(TerminateReason::ObserverCompleted));
    let _ = services
        .sink
        .update_task_status(&task.task_id, if success { TaskStatus::Completed } else { TaskStatus::Failed })
        .await;

    let history_summary = summarize_history(&state.history);
    let summary = formatter::stream_summarize_run(services.llm.as_ref(), &task.query, &history_summary, |chunk| {
        events.send(Event::SummaryChunk { step: None, agent_name: "orkestra".to_string(), chunk });
    })
    .await;
    let _ = services.sink.save_final_result(&task.task_id, &summary).await;

    events.send(Event::TaskExecutionComplete {
        task_id: task.task_id.clone(),
        success,
        completed: state.completed_count,
        failed: state.failed_count,
        iterations: state.current_iteration,
    });
}

/// Validate and establish every distinct non-"llm" connection the workflow
/// needs before running it, so a missing-auth or unreachable-service failure
/// aborts the whole run up front instead of surfacing mid-execution as a
/// per-step failure. `execute_step` still connects per step too, since a
/// replanned tail can introduce a service not seen here.
async fn ensure_connections(services: &Arc<EngineServices>, task: &Task, workflow: &[WorkflowStep], events: &EventSender) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for step in workflow {
        if step.is_llm_step() || !seen.insert(step.mcp_name.clone()) {
            continue;
        }

        let Some(config) = services.registry.get(&step.mcp_name).cloned() else {
            events.send(Event::McpConnectionError {
                service: step.mcp_name.clone(),
                error_type: "unknown_service".to_string(),
                missing: Vec::new(),
            });
            return Err(format!("unknown service '{}'", step.mcp_name));
        };

        let env = match auth::inject(services.auth.as_ref(), &task.user_id, &config).await {
            Ok(env) => env,
            Err(missing) => {
                events.send(Event::McpConnectionError {
                    service: config.name.clone(),
                    error_type: "missing_auth".to_string(),
                    missing: missing.missing.clone(),
                });
                return Err(missing.to_string());
            }
        };

        if let Err(err) = services.manager.connect(&task.user_id, &config, env).await {
            events.send(Event::McpConnectionError {
                service: config.name.clone(),
                error_type: "connection_failed".to_string(),
                missing: Vec::new(),
            });
            return Err(err.to_string());
        }
    }
    Ok(())
}

/// A single attempt's result. `Err` carries the remediation strategy already
/// chosen for this failure, so the caller doesn't re-derive it.
type StepResult = Result<serde_json::Value, (Strategy, String)>;

/// A step's result after `execute_step` has resolved retries internally.
enum StepOutcome {
    Done(serde_json::Value),
    Failed(Strategy, String),
    /// The run was cancelled while waiting out a retry backoff.
    Cancelled,
}

/// Process-wide counter of executed steps: one `OnceLock`-cached
/// `opentelemetry` counter, registered lazily against the global meter.
fn step_counter() -> opentelemetry::metrics::Counter<u64> {
    static COUNTER: std::sync::OnceLock<opentelemetry::metrics::Counter<u64>> = std::sync::OnceLock::new();
    COUNTER
        .get_or_init(|| {
            opentelemetry::global::meter("orkestra")
                .u64_counter("orkestra.steps.total")
                .with_description("Total number of workflow steps executed")
                .build()
        })
        .clone()
}

/// Resolve the tool name and adapt its parameters once (§4.F steps 2-3),
/// then call it with up to `max_retries + 1` attempts (§4.F step 5),
/// backing off `1s × attempt` between tries. Resolution and parameter
/// adaptation are *not* redone on a retry — they're not part of "execute
/// with retry", only the call itself is.
///
/// Retries are resolved entirely inside this call so the outer loop in
/// `run` only ever sees a terminal `Done`/`Failed(..)` outcome: a step
/// whose retries would otherwise outlive the run's iteration budget (e.g.
/// a `simple_query`'s single-step budget) must still reach a terminal
/// state rather than being cut off mid-retry by the iteration cap.
async fn execute_step(
    services: &Arc<EngineServices>,
    task: &Task,
    state: &mut ExecutionState,
    step_index: usize,
    events: &EventSender,
    cancel: &CancellationToken,
) -> StepOutcome {
    let step = state.workflow[step_index].clone();

    if step.is_llm_step() {
        loop {
            state.workflow[step_index].attempts += 1;
            step_counter().add(1, &[opentelemetry::KeyValue::new("mcp_name", step.mcp_name.clone())]);

            match execute_llm_attempt(services, &step, state, events).await {
                Ok(result) => return StepOutcome::Done(result),
                Err((Strategy::Retry, error)) => {
                    match wait_out_retry(state, step_index, &step.mcp_name, step.step_index, error, events, cancel).await {
                        Some(outcome) => return outcome,
                        None => continue,
                    }
                }
                Err((strategy, error)) => return StepOutcome::Failed(strategy, error),
            }
        }
    }

    let Some(config) = services.registry.get(&step.mcp_name).cloned() else {
        let (strategy, error) = classify_failure(state, &step, ErrorClass::Other, format!("unknown service '{}'", step.mcp_name));
        return StepOutcome::Failed(strategy, error);
    };

    let env = match auth::inject(services.auth.as_ref(), &task.user_id, &config).await {
        Ok(env) => env,
        Err(missing) => {
            events.send(Event::McpConnectionError {
                service: config.name.clone(),
                error_type: "missing_auth".to_string(),
                missing: missing.missing.clone(),
            });
            return StepOutcome::Failed(Strategy::ManualIntervention, missing.to_string());
        }
    };

    if let Err(err) = services.manager.connect(&task.user_id, &config, env).await {
        events.send(Event::McpConnectionError {
            service: config.name.clone(),
            error_type: "connection_failed".to_string(),
            missing: Vec::new(),
        });
        let (strategy, error) = classify_failure(state, &step, ErrorClass::classify(&err.to_string()), err.to_string());
        return StepOutcome::Failed(strategy, error);
    }

    let tools = match services.manager.list_tools(&task.user_id, &config.name).await {
        Ok(tools) => tools,
        Err(err) => {
            let (strategy, error) = classify_failure(state, &step, ErrorClass::NotConnected, err.to_string());
            return StepOutcome::Failed(strategy, error);
        }
    };

    let Some(resolved_name) = resolver::resolve_tool_name(services.llm.as_ref(), &step.action, &tools).await else {
        let (strategy, error) = classify_failure(state, &step, ErrorClass::Other, format!("no tools available on '{}'", config.name));
        return StepOutcome::Failed(strategy, error);
    };

    let tool_descriptor = tools
        .iter()
        .find(|t| t.name == resolved_name)
        .cloned()
        .unwrap_or(ToolDescriptor { name: resolved_name.clone(), description: String::new(), input_schema: serde_json::json!({}) });

    let previous_output = state.data_store.get("last_result").cloned();
    let seeded_args = resolver::infer_step_input(&step.action, &step.input_args, previous_output.as_ref());
    let adapted_args = resolver::adapt_parameters(services.llm.as_ref(), &tool_descriptor, &seeded_args, previous_output.as_ref()).await;

    events.send(Event::StepExecuting {
        step: step.step_index,
        agent_name: config.name.clone(),
        tool: resolved_name.clone(),
        args: adapted_args.clone(),
        expected_output: step.reasoning.clone(),
        reasoning: step.reasoning.clone(),
    });

    loop {
        state.workflow[step_index].attempts += 1;
        step_counter().add(1, &[opentelemetry::KeyValue::new("mcp_name", step.mcp_name.clone())]);

        let call = tokio::time::timeout(
            services.config.tool_call_timeout(),
            services.manager.call_tool(&task.user_id, &config.name, &resolved_name, adapted_args.clone()),
        )
        .await;

        let attempt: StepResult = match call {
            Ok(Ok(outcome)) if !outcome.is_error => Ok(outcome.content),
            Ok(Ok(outcome)) => Err(classify_failure(state, &step, ErrorClass::classify(&outcome.content.to_string()), outcome.content.to_string())),
            Ok(Err(err)) => Err(classify_failure(state, &step, ErrorClass::classify(&err.to_string()), err.to_string())),
            Err(_) => Err(classify_failure(state, &step, ErrorClass::Transient, format!("tool call to '{resolved_name}' timed out"))),
        };

        let raw_content = match attempt {
            Ok(content) => content,
            Err((Strategy::Retry, error)) => {
                match wait_out_retry(state, step_index, &step.mcp_name, step.step_index, error, events, cancel).await {
                    Some(outcome) => return outcome,
                    None => continue,
                }
            }
            Err((strategy, error)) => return StepOutcome::Failed(strategy, error),
        };

        let formatted = formatter::stream_format_step_result(services.llm.as_ref(), &config.name, &resolved_name, &raw_content, |chunk| {
            events.send(Event::StepResultChunk { step: step.step_index, agent_name: config.name.clone(), chunk });
        })
        .await;

        events.send(Event::StepRawResult { step: step.step_index, agent_name: config.name.clone(), result: raw_content.clone() });
        events.send(Event::StepFormattedResult { step: step.step_index, agent_name: config.name.clone(), formatted_result: formatted.clone() });

        let _ = services.sink.record_step_result(&task.task_id, step.step_index, &config.name, "raw", &raw_content).await;
        let _ = services
            .sink
            .record_step_result(&task.task_id, step.step_index, &config.name, "formatted", &serde_json::Value::String(formatted))
            .await;

        return StepOutcome::Done(raw_content);
    }
}

/// Sleep out a `Retry` strategy's `1s × attempt` backoff, honoring
/// cancellation. Returns `Some(Cancelled)` if the wait was interrupted by
/// cancellation, `None` if the caller should retry its attempt.
async fn wait_out_retry(
    state: &ExecutionState,
    step_index: usize,
    agent_name: &str,
    step_id: u32,
    error: String,
    events: &EventSender,
    cancel: &CancellationToken,
) -> Option<StepOutcome> {
    events.send(Event::StepError {
        step: step_id,
        agent_name: agent_name.to_string(),
        error,
        tool_details: None,
        progress: Progress { completed: state.completed_count, failed: state.failed_count, total: state.workflow.len() as u32 },
    });
    let backoff = std::time::Duration::from_secs(state.workflow[step_index].attempts as u64);
    tokio::select! {
        _ = tokio::time::sleep(backoff) => None,
        _ = cancel.cancelled() => Some(StepOutcome::Cancelled),
    }
}

async fn execute_llm_attempt(services: &Arc<EngineServices>, step: &WorkflowStep, state: &mut ExecutionState, events: &EventSender) -> StepResult {
    events.send(Event::StepExecuting {
        step: step.step_index,
        agent_name: "llm".to_string(),
        tool: "llm".to_string(),
        args: step.input_args.clone(),
        expected_output: step.reasoning.clone(),
        reasoning: step.reasoning.clone(),
    });

    let context = state.data_store.get("last_result").map(|v| v.to_string()).unwrap_or_default();
    let prompt = format!("Task: {}\n\nPrior result context:\n{}\n\nOriginal request: {}", step.action, context, state.original_query);

    let response = match services.llm.complete(None, &prompt).await {
        Ok(response) => response,
        Err(err) => return Err(classify_failure(state, step, ErrorClass::Transient, err.to_string())),
    };

    let result = serde_json::Value::String(response.clone());

    events.send(Event::StepRawResult { step: step.step_index, agent_name: "llm".to_string(), result: result.clone() });
    events.send(Event::StepFormattedResult { step: step.step_index, agent_name: "llm".to_string(), formatted_result: response.clone() });

    let _ = services.sink.record_step_result(&state.task_id, step.step_index, "llm", "raw", &result).await;
    let _ = services
        .sink
        .record_step_result(&state.task_id, step.step_index, "llm", "formatted", &serde_json::Value::String(response))
        .await;

    Ok(result)
}

/// Record a failure against the step's tool and pick a strategy for it.
/// `attempt_count` accumulates across retries of the same tool
/// within a run, so a tool that failed once before and fails again counts
/// as its second attempt even if something else ran in between.
fn classify_failure(state: &mut ExecutionState, step: &WorkflowStep, class: ErrorClass, error: String) -> (Strategy, String) {
    let entry = state.failure_records.entry(step.mcp_name.clone()).or_insert_with(|| FailureRecord {
        step_index: step.step_index,
        tool: step.mcp_name.clone(),
        error: error.clone(),
        attempt_count: 0,
        last_attempt_at: chrono::Utc::now(),
        strategy: Strategy::Retry,
        max_retries: step.max_retries,
    });
    entry.attempt_count += 1;
    entry.error = error.clone();
    entry.last_attempt_at = chrono::Utc::now();

    let chosen = strategy::select_strategy(class, entry.attempt_count, step.max_retries);
    entry.strategy = chosen;

    (chosen, error)
}

fn available_services(registry: &ServiceRegistry) -> Vec<AvailableService> {
    registry
        .list()
        .into_iter()
        .map(|config| AvailableService {
            name: config.name.clone(),
            tools: config
                .declared_tools
                .iter()
                .map(|name| ToolDescriptor { name: name.clone(), description: String::new(), input_schema: serde_json::json!({}) })
                .collect(),
        })
        .collect()
}

fn summarize_history(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .map(|h| format!("step {} ({} · {}): {} — {}", h.step_index, h.tool, h.action, if h.success { "ok" } else { "failed" }, h.result_summary))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_summary(value: &serde_json::Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 500 {
        text.chars().take(500).collect::<String>() + "…"
    } else {
        text
    }
}

fn complexity_name(class: ComplexityClass) -> String {
    serde_json::to_value(class).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| "medium_task".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryAuthStore;
    use crate::clock::FixedClock;
    use crate::llm::StubLanguageModel;
    use crate::mcp::StubConnectionManager;
    use crate::mcp::ToolCallOutcome as McpToolCallOutcome;
    use crate::persistence::NullPersistence;
    use crate::registry::ServiceConfig;
    use futures::StreamExt;

    fn make_registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register(ServiceConfig::new("coingecko", "crypto prices", "npx").with_tools(["get_price"]));
        registry
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: "price lookup".to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {"coin_id": {"type": "string"}}}),
        }
    }

    async fn services_with(llm_responses: Vec<String>, manager: StubConnectionManager, registry: ServiceRegistry) -> Arc<EngineServices> {
        Arc::new(EngineServices {
            manager: Arc::new(manager),
            auth: Arc::new(InMemoryAuthStore::new()),
            llm: Arc::new(StubLanguageModel::new(llm_responses)),
            registry: Arc::new(registry),
            sink: Arc::new(NullPersistence),
            clock: Arc::new(FixedClock(chrono::Utc::now())),
            config: Config::default(),
        })
    }

    #[tokio::test]
    async fn simple_query_runs_one_step_and_completes() {
        let manager = StubConnectionManager::new();
        manager
            .with_service(
                "coingecko",
                vec![descriptor("get_price")],
                vec![Ok(McpToolCallOutcome { content: serde_json::json!({"price": 65000}), is_error: false })],
            )
            .await;

        let services = services_with(
            vec![
                r#"[{"mcp_name": "coingecko", "action": "get_price", "input_args": {"coin_id": "bitcoin"}, "reasoning": "price lookup"}]"#.to_string(),
                r#"{"coin_id": "bitcoin"}"#.to_string(),
                r#"{"should_continue": false, "should_adapt_workflow": false, "reason": "done", "confidence_score": 0.95}"#.to_string(),
                "Bitcoin is $65,000.".to_string(),
            ],
            manager,
            make_registry(),
        )
        .await;

        let task = Task {
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            query: "what is the price of bitcoin".to_string(),
            preloaded_workflow: None,
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let mut stream = execute(services, task, CancellationToken::new());
        let mut saw_complete = false;
        while let Some(event) = stream.next().await {
            if let Event::TaskExecutionComplete { success, completed, failed, .. } = event {
                assert!(success);
                assert_eq!(completed, 1);
                assert_eq!(failed, 0);
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn missing_auth_aborts_before_any_step_runs() {
        let mut registry = ServiceRegistry::new();
        registry.register(
            ServiceConfig::new("github", "github ops", "npx")
                .requiring_auth(vec![crate::registry::EnvSlot { var: "GITHUB_TOKEN".to_string(), aliases: vec!["GITHUB_TOKEN".to_string()] }])
                .with_tools(["get_issue"]),
        );

        let services = services_with(vec![], StubConnectionManager::new(), registry).await;

        let task = Task {
            task_id: "t2".to_string(),
            user_id: "u1".to_string(),
            query: "look up the issue".to_string(),
            preloaded_workflow: Some(vec![WorkflowStep::new(1, "github", "get_issue", serde_json::json!({}))]),
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let mut stream = execute(services, task, CancellationToken::new());
        let mut saw_error = false;
        let mut saw_step_executing = false;
        while let Some(event) = stream.next().await {
            match event {
                Event::TaskExecutionError { .. } => saw_error = true,
                Event::StepExecuting { .. } => saw_step_executing = true,
                Event::TaskExecutionComplete { .. } => panic!("should not reach completion"),
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(!saw_step_executing);
    }

    #[tokio::test]
    async fn retry_then_skip_on_repeated_transient_failure() {
        let manager = StubConnectionManager::new();
        manager
            .with_service(
                "coingecko",
                vec![descriptor("get_price")],
                vec![Err("request timed out".to_string()), Err("request timed out".to_string())],
            )
            .await;

        let services = services_with(
            vec![
                r#"{"coin_id": "bitcoin"}"#.to_string(),
                r#"{"coin_id": "bitcoin"}"#.to_string(),
                r#"{"should_continue": false, "should_adapt_workflow": false, "reason": "done", "confidence_score": 0.5}"#.to_string(),
                "No price could be retrieved.".to_string(),
            ],
            manager,
            make_registry(),
        )
        .await;

        let task = Task {
            task_id: "t3".to_string(),
            user_id: "u1".to_string(),
            query: "first check the current price".to_string(),
            preloaded_workflow: Some(vec![WorkflowStep::new(1, "coingecko", "get_price", serde_json::json!({"coin_id": "bitcoin"}))]),
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let mut stream = execute(services, task, CancellationToken::new());
        let mut completed_summary = None;
        while let Some(event) = stream.next().await {
            if let Event::TaskExecutionComplete { completed, failed, .. } = event {
                completed_summary = Some((completed, failed));
            }
        }
        // default max_retries is 2: the first timeout retries, the second hits the cap
        // and a transient error that's exhausted its retries is skipped outright.
        assert_eq!(completed_summary, Some((0, 1)));
    }

    #[tokio::test]
    async fn a_simple_querys_single_step_budget_does_not_truncate_an_in_flight_retry() {
        // simple_query caps max_iterations at 1 (complexity::step_budget). A step
        // whose first attempt is transient needs a second attempt to resolve to a
        // terminal strategy — that retry must happen inside this single iteration,
        // not be cut off by the outer budget before it gets to run.
        let manager = StubConnectionManager::new();
        manager
            .with_service(
                "coingecko",
                vec![descriptor("get_price")],
                vec![Err("request timed out".to_string()), Err("request timed out".to_string())],
            )
            .await;

        let services = services_with(vec![r#"{"coin_id": "bitcoin"}"#.to_string()], manager, make_registry()).await;

        let task = Task {
            task_id: "t-simple-retry".to_string(),
            user_id: "u1".to_string(),
            query: "what is the current price of bitcoin".to_string(),
            preloaded_workflow: Some(vec![WorkflowStep::new(1, "coingecko", "get_price", serde_json::json!({"coin_id": "bitcoin"}))]),
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let mut stream = execute(services, task, CancellationToken::new());
        let mut summary = None;
        while let Some(event) = stream.next().await {
            if let Event::TaskExecutionComplete { completed, failed, iterations, .. } = event {
                summary = Some((completed, failed, iterations));
            }
        }
        // Neither dropped (completed=0, failed=0) nor mysteriously still pending —
        // the step reaches a terminal `failed` state within the single iteration
        // the budget grants it.
        assert_eq!(summary, Some((0, 1, 1)));
    }

    #[tokio::test]
    async fn skip_strategy_terminates_the_run_without_running_later_steps() {
        let manager = StubConnectionManager::new();
        manager
            .with_service("coingecko", vec![descriptor("get_price")], vec![Err("connection closed unexpectedly".to_string())])
            .await;

        let services = services_with(
            vec![
                r#"{"coin_id": "bitcoin"}"#.to_string(),
                "no price available".to_string(),
            ],
            manager,
            make_registry(),
        )
        .await;

        let task = Task {
            task_id: "t4".to_string(),
            user_id: "u1".to_string(),
            query: "check the price twice".to_string(),
            preloaded_workflow: Some(vec![
                WorkflowStep::new(1, "coingecko", "get_price", serde_json::json!({"coin_id": "bitcoin"})),
                WorkflowStep::new(2, "coingecko", "get_price", serde_json::json!({"coin_id": "bitcoin"})),
            ]),
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let mut stream = execute(services, task, CancellationToken::new());
        let mut summary = None;
        while let Some(event) = stream.next().await {
            if let Event::TaskExecutionComplete { completed, failed, iterations, .. } = event {
                summary = Some((completed, failed, iterations));
            }
        }
        assert_eq!(summary, Some((0, 1, 1)));
    }

    #[tokio::test]
    async fn cancellation_emits_task_execution_error_instead_of_completion() {
        let manager = StubConnectionManager::new();
        manager
            .with_service(
                "coingecko",
                vec![descriptor("get_price")],
                vec![Err("request timed out".to_string())],
            )
            .await;

        let services = services_with(vec![r#"{"coin_id": "bitcoin"}"#.to_string()], manager, make_registry()).await;

        let task = Task {
            task_id: "t5".to_string(),
            user_id: "u1".to_string(),
            query: "check the price".to_string(),
            preloaded_workflow: Some(vec![WorkflowStep::new(1, "coingecko", "get_price", serde_json::json!({"coin_id": "bitcoin"}))]),
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut stream = execute(services, task, cancel);
        let mut saw_cancelled_error = false;
        while let Some(event) = stream.next().await {
            match event {
                Event::TaskExecutionError { reason, .. } => saw_cancelled_error = reason == "cancelled",
                Event::TaskExecutionComplete { .. } => panic!("a cancelled run must not complete"),
                _ => {}
            }
        }
        assert!(saw_cancelled_error);
    }

    #[tokio::test]
    async fn multi_target_fan_out_runs_one_step_per_target_and_completes_all_components() {
        let manager = StubConnectionManager::new();
        manager
            .with_service(
                "twitter",
                vec![descriptor("get_user_tweets")],
                vec![
                    Ok(McpToolCallOutcome { content: serde_json::json!({"tweets": ["hi from a"]}), is_error: false }),
                    Ok(McpToolCallOutcome { content: serde_json::json!({"tweets": ["hi from b"]}), is_error: false }),
                    Ok(McpToolCallOutcome { content: serde_json::json!({"tweets": ["hi from c"]}), is_error: false }),
                ],
            )
            .await;

        let mut registry = ServiceRegistry::new();
        registry.register(ServiceConfig::new("twitter", "social posts", "npx").with_tools(["get_user_tweets"]));

        let services = services_with(
            vec![
                // breakdown::derive
                r#"[{"id": "a", "type": "data_collection", "description": "fetch alice's latest posts"},
                    {"id": "b", "type": "data_collection", "description": "fetch bob's latest posts"},
                    {"id": "c", "type": "data_collection", "description": "fetch carol's latest posts"}]"#
                    .to_string(),
                // planner::plan
                r#"[{"mcp_name": "twitter", "action": "get_user_tweets", "input_args": {"username": "alice"}, "reasoning": "fetch alice"},
                    {"mcp_name": "twitter", "action": "get_user_tweets", "input_args": {"username": "bob"}, "reasoning": "fetch bob"},
                    {"mcp_name": "twitter", "action": "get_user_tweets", "input_args": {"username": "carol"}, "reasoning": "fetch carol"}]"#
                    .to_string(),
                // resolver::adapt_parameters x3 + observer x3, interleaved per step
                r#"{"username": "alice"}"#.to_string(),
                r#"{"should_continue": true, "should_adapt_workflow": false, "reason": "two left", "confidence_score": 0.6}"#.to_string(),
                r#"{"username": "bob"}"#.to_string(),
                r#"{"should_continue": true, "should_adapt_workflow": false, "reason": "one left", "confidence_score": 0.6}"#.to_string(),
                r#"{"username": "carol"}"#.to_string(),
                r#"{"should_continue": false, "should_adapt_workflow": false, "reason": "all three collected", "confidence_score": 0.9}"#.to_string(),
                "All three users' latest posts were collected.".to_string(),
            ],
            manager,
            registry,
        )
        .await;

        let task = Task {
            task_id: "t-fanout".to_string(),
            user_id: "u1".to_string(),
            query: "Collect the latest posts from alice, bob, and carol then compile a summary".to_string(),
            preloaded_workflow: None,
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let mut stream = execute(services, task, CancellationToken::new());
        let mut step_completes = 0;
        let mut summary = None;
        while let Some(event) = stream.next().await {
            match event {
                Event::StepComplete { .. } => step_completes += 1,
                Event::TaskExecutionComplete { completed, failed, .. } => summary = Some((completed, failed)),
                _ => {}
            }
        }
        assert_eq!(step_completes, 3);
        assert_eq!(summary, Some((3, 0)));
    }

    #[tokio::test]
    async fn mid_run_observer_adaptation_inserts_an_extra_step_and_still_completes() {
        let manager = StubConnectionManager::new();
        manager
            .with_service(
                "twitter",
                vec![descriptor("get_user_tweets")],
                vec![Ok(McpToolCallOutcome { content: serde_json::json!({"tweets": ["a very long blob".repeat(50)]}), is_error: false })],
            )
            .await;
        manager
            .with_service("poster", vec![descriptor("post_summary")], vec![])
            .await;

        let mut registry = ServiceRegistry::new();
        registry.register(ServiceConfig::new("twitter", "social posts", "npx").with_tools(["get_user_tweets"]));
        registry.register(ServiceConfig::new("poster", "posting", "npx").with_tools(["post_summary"]));

        let services = services_with(
            vec![
                // resolver::adapt_parameters for step 1
                r#"{"username": "alice"}"#.to_string(),
                // observer after step 1: adapt the workflow to insert a summarise step
                r#"{"should_continue": true, "should_adapt_workflow": true, "reason": "result too long, summarise first", "confidence_score": 0.7}"#
                    .to_string(),
                // planner::replan_tail produces one llm step replacing the rest
                r#"[{"mcp_name": "llm", "action": "summarise the tweet blob", "input_args": {}, "reasoning": "condense before posting"}]"#.to_string(),
                // execute_llm_attempt's completion call
                "Here is a short summary of the blob.".to_string(),
                // observer after the inserted llm step
                r#"{"should_continue": false, "should_adapt_workflow": false, "reason": "summary produced", "confidence_score": 0.8}"#.to_string(),
                "Fetched tweets and summarised them.".to_string(),
            ],
            manager,
            registry,
        )
        .await;

        let task = Task {
            task_id: "t-adapt".to_string(),
            user_id: "u1".to_string(),
            query: "get alice's tweets then post a summary".to_string(),
            preloaded_workflow: Some(vec![
                WorkflowStep::new(1, "twitter", "get_user_tweets", serde_json::json!({"username": "alice"})),
                WorkflowStep::new(2, "poster", "post_summary", serde_json::json!({})),
            ]),
            conversation_id: None,
            status: TaskStatus::Created,
        };

        let mut stream = execute(services, task, CancellationToken::new());
        let mut saw_adapted = false;
        let mut step_completes = 0;
        let mut summary = None;
        while let Some(event) = stream.next().await {
            match event {
                Event::WorkflowAdapted { .. } => saw_adapted = true,
                Event::StepComplete { .. } => step_completes += 1,
                Event::TaskExecutionComplete { completed, success, .. } => summary = Some((completed, success)),
                _ => {}
            }
        }
        assert!(saw_adapted);
        assert_eq!(step_completes, 2);
        assert_eq!(summary, Some((2, true)));
    }

    #[tokio::test]
    async fn per_user_connections_are_isolated() {
        let manager = StubConnectionManager::new();
        manager
            .with_service("coingecko", vec![descriptor("get_price")], vec![Ok(McpToolCallOutcome { content: serde_json::json!({"price": 1}), is_error: false })])
            .await;
        manager.connect("user_a", &ServiceConfig::new("coingecko", "d", "npx"), std::collections::HashMap::new()).await.unwrap();

        assert!(manager.list_connected("user_b").await.is_empty());
        assert!(manager.get_client("user_b", "coingecko").await.is_none());

        let user_a_connections = manager.list_connected("user_a").await;
        assert_eq!(user_a_connections.len(), 1);
        assert_eq!(user_a_connections[0].service_name, "coingecko");
    }
}
