//! Core data model: tasks, steps, execution state, and the
//! supporting records the Engine reads and writes during a run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Literal `mcp_name` denoting an LLM-only step rather than an MCP tool call.
pub const LLM_STEP: &str = "llm";

/// Lifecycle status of a single [`WorkflowStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// One element of a workflow plan.
///
/// `step_index` is 1-based and dense at all times within a workflow — the
/// Engine renumbers densely whenever it replaces a tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_index: u32,
    pub mcp_name: String,
    pub action: String,
    pub input_args: serde_json::Value,
    pub status: StepStatus,
    pub attempts: u32,
    pub max_retries: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Free-text reasoning the planner attached to this step, used by the
    /// Engine's breakdown-completion heuristic.
    pub reasoning: Option<String>,
}

impl WorkflowStep {
    pub fn new(step_index: u32, mcp_name: impl Into<String>, action: impl Into<String>, input_args: serde_json::Value) -> Self {
        Self {
            step_index,
            mcp_name: mcp_name.into(),
            action: action.into(),
            input_args,
            status: StepStatus::Pending,
            attempts: 0,
            max_retries: 2,
            result: None,
            error: None,
            reasoning: None,
        }
    }

    pub fn is_llm_step(&self) -> bool {
        self.mcp_name == LLM_STEP
    }
}

/// A typed sub-goal of the original query, used to decide early termination
/// for `complex_workflow`-class queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    DataCollection,
    DataProcessing,
    ActionExecution,
    Analysis,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComponent {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub description: String,
    pub is_completed: bool,
    pub completed_step_indices: Vec<u32>,
    pub dependencies: Vec<String>,
    pub required_data: Vec<String>,
    pub produced_data: Vec<String>,
}

impl TaskComponent {
    pub fn new(id: impl Into<String>, component_type: ComponentType, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type,
            description: description.into(),
            is_completed: false,
            completed_step_indices: Vec::new(),
            dependencies: Vec::new(),
            required_data: Vec::new(),
            produced_data: Vec::new(),
        }
    }
}

/// Remediation strategy chosen for a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Retry,
    Alternative,
    Skip,
    ManualIntervention,
}

/// One record per distinct tool seen to fail during a run; `attempt_count`
/// accumulates across retries and across replans that retarget the same tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub step_index: u32,
    pub tool: String,
    pub error: String,
    pub attempt_count: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub max_retries: u32,
}

/// One entry in the engine's append-only execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_index: u32,
    pub tool: String,
    pub action: String,
    pub success: bool,
    /// Short (truncated) summary of the raw result, for LLM prompt context.
    pub result_summary: String,
}

/// Engine-local, per-run state. Owned by exactly one `execute` run
/// and never shared or observed outside the core except as emitted events.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub task_id: String,
    pub original_query: String,
    pub workflow: Vec<WorkflowStep>,
    pub current_step_index: usize,
    pub history: Vec<HistoryEntry>,
    pub data_store: HashMap<String, serde_json::Value>,
    pub completed_count: u32,
    pub failed_count: u32,
    pub failure_records: HashMap<String, FailureRecord>,
    pub components: Vec<TaskComponent>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub errors: Vec<String>,
    pub terminate: Option<TerminateReason>,
}

/// Why the main loop stopped issuing new steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    ObserverCompleted,
    Skip,
    ManualIntervention,
    Cancelled,
}

impl ExecutionState {
    pub fn new(task_id: impl Into<String>, original_query: impl Into<String>, workflow: Vec<WorkflowStep>, max_iterations: u32) -> Self {
        Self {
            task_id: task_id.into(),
            original_query: original_query.into(),
            workflow,
            current_step_index: 0,
            history: Vec::new(),
            data_store: HashMap::new(),
            completed_count: 0,
            failed_count: 0,
            failure_records: HashMap::new(),
            components: Vec::new(),
            current_iteration: 0,
            max_iterations,
            errors: Vec::new(),
            terminate: None,
        }
    }

    /// `completed + failed + pending == len(workflow)` invariant.
    pub fn pending_count(&self) -> u32 {
        self.workflow.len() as u32 - self.completed_count - self.failed_count
    }

    pub fn set_last_result(&mut self, value: serde_json::Value) {
        self.data_store.insert("last_result".to_string(), value.clone());
    }

    pub fn set_step_result(&mut self, step_index: u32, value: serde_json::Value) {
        self.data_store.insert(format!("step_{step_index}_result"), value.clone());
        self.set_last_result(value);
    }
}

/// Lifecycle status of a [`Task`], set externally except for the terminal
/// transition, which the Engine performs via [`crate::persistence::PersistenceSink::update_task_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    InProgress,
    Completed,
    Failed,
}

/// The caller-supplied unit of work. Created externally (outside
/// the core); the Engine reads `user_id`, `query`, `preloaded_workflow`, and
/// `conversation_id`, and writes only the terminal `status` via the
/// persistence sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub user_id: String,
    pub query: String,
    pub preloaded_workflow: Option<Vec<WorkflowStep>>,
    pub conversation_id: Option<String>,
    pub status: TaskStatus,
}

/// Tool metadata cached per MCP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Per-user, per-service credential record, persisted by the
/// (external) auth subsystem and only ever read by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPAuth {
    pub user_id: String,
    pub service_name: String,
    pub auth_data: HashMap<String, String>,
    pub is_verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Complexity classification used to size the iteration and observation
/// budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    SimpleQuery,
    MediumTask,
    ComplexWorkflow,
}

impl ComplexityClass {
    pub fn default_step_budget(self) -> u32 {
        match self {
            ComplexityClass::SimpleQuery => 1,
            ComplexityClass::MediumTask => 3,
            ComplexityClass::ComplexWorkflow => 6,
        }
    }
}
