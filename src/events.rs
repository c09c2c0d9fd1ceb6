//! Caller-facing event stream.
//!
//! Unlike the MCP Manager's multi-subscriber broadcast channel (one producer,
//! many long-lived listeners watching connection health), a single `execute`
//! run has exactly one consumer, so events are delivered over an
//! [`tokio::sync::mpsc::unbounded_channel`] wrapped as a [`tokio_stream::Stream`].
//! Ordering is enforced purely by call order — the channel is FIFO and
//! single-producer per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One emitted event. `data` always carries `step`/`agent_name` for step
/// events plus whatever fields that event name implies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum Event {
    ExecutionStart {
        task_id: String,
        engine: String,
        complexity: String,
        step_budget: u32,
        timestamp: DateTime<Utc>,
    },
    StepExecuting {
        step: u32,
        agent_name: String,
        tool: String,
        args: serde_json::Value,
        expected_output: Option<String>,
        reasoning: Option<String>,
    },
    StepResultChunk {
        step: u32,
        agent_name: String,
        chunk: String,
    },
    SummaryChunk {
        step: Option<u32>,
        agent_name: String,
        chunk: String,
    },
    StepRawResult {
        step: u32,
        agent_name: String,
        result: serde_json::Value,
    },
    StepFormattedResult {
        step: u32,
        agent_name: String,
        formatted_result: String,
    },
    StepComplete {
        step: u32,
        agent_name: String,
        progress: Progress,
    },
    StepError {
        step: u32,
        agent_name: String,
        error: String,
        tool_details: Option<serde_json::Value>,
        progress: Progress,
    },
    McpConnectionError {
        service: String,
        error_type: String,
        missing: Vec<String>,
    },
    WorkflowAdapted {
        reason: String,
        new_steps: Vec<u32>,
    },
    TaskObservation {
        step: u32,
        should_continue: bool,
        should_adapt_workflow: bool,
        confidence_score: f32,
    },
    TaskExecutionComplete {
        task_id: String,
        success: bool,
        completed: u32,
        failed: u32,
        iterations: u32,
    },
    TaskExecutionError {
        task_id: String,
        reason: String,
    },
}

/// Progress counters attached to `step_complete`/`step_error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u32,
    pub failed: u32,
    pub total: u32,
}

impl Event {
    /// The stable event name, used for the `name` discriminant consumers may
    /// switch on.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ExecutionStart { .. } => "execution_start",
            Event::StepExecuting { .. } => "step_executing",
            Event::StepResultChunk { .. } => "step_result_chunk",
            Event::SummaryChunk { .. } => "summary_chunk",
            Event::StepRawResult { .. } => "step_raw_result",
            Event::StepFormattedResult { .. } => "step_formatted_result",
            Event::StepComplete { .. } => "step_complete",
            Event::StepError { .. } => "step_error",
            Event::McpConnectionError { .. } => "mcp_connection_error",
            Event::WorkflowAdapted { .. } => "workflow_adapted",
            Event::TaskObservation { .. } => "task_observation",
            Event::TaskExecutionComplete { .. } => "task_execution_complete",
            Event::TaskExecutionError { .. } => "task_execution_error",
        }
    }
}

/// Sending half of a run's event stream. Cloned freely within a single
/// `execute` call (e.g. into the formatter), but never shared across runs.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Emit an event. Silently drops it if the receiver has already been
    /// dropped (the caller stopped listening) — sending to zero receivers
    /// is not an error.
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Create a new single-producer event channel. Returns the sender and a
/// `Stream<Item = Event>` the caller can poll or adapt into SSE.
pub fn channel() -> (EventSender, UnboundedReceiverStream<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, UnboundedReceiverStream::new(rx))
}
