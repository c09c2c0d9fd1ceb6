//! Demonstration binary: wires a real `OpenAiClient`, a real `McpManager`,
//! sqlite-backed auth and persistence, and the built-in service catalog into
//! one `EngineServices` bundle, then drives a single workflow from the
//! command line and prints its event stream.
//!
//! This is a harness for exercising the library end to end against a live
//! LLM endpoint and real MCP subprocesses, not a product surface.

use std::sync::Arc;

use clap::Parser;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use orkestra::auth::SqliteAuthStore;
use orkestra::clock::SystemClock;
use orkestra::config::Config;
use orkestra::engine::{self, EngineServices};
use orkestra::llm::OpenAiClient;
use orkestra::mcp::McpManager;
use orkestra::persistence::{NullPersistence, PersistenceSink, SqlitePersistence};
use orkestra::registry::ServiceRegistry;
use orkestra::types::{Task, TaskStatus};
use orkestra::Event;

/// Run one task through the orchestrator and print what happened.
#[derive(Parser, Debug)]
#[command(name = "orkestra", about = "Dynamic LLM-driven workflow orchestrator demo")]
struct Cli {
    /// Natural-language request to execute.
    query: String,

    /// User id the request runs as (auth and connections are scoped to this).
    #[arg(long, default_value = "local")]
    user_id: String,

    /// Path to an `orkestra.toml` config file. Falls back to env vars / defaults.
    #[arg(long)]
    config: Option<String>,

    /// Path to a services TOML file (`[[service]]` entries). Falls back to
    /// the built-in catalog when omitted.
    #[arg(long)]
    services: Option<String>,

    /// Skip sqlite persistence and auth storage entirely, running in memory.
    #[arg(long)]
    no_persist: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    let registry = match &cli.services {
        Some(path) => ServiceRegistry::load(path)?,
        None => ServiceRegistry::with_defaults(),
    };

    let llm = OpenAiClient::new(&config.llm_endpoint, config.llm_model.clone());
    let manager = McpManager::new();

    let sink: Arc<dyn PersistenceSink> = if cli.no_persist {
        Arc::new(NullPersistence)
    } else {
        Arc::new(SqlitePersistence::open(&config.db_path)?)
    };
    let auth: Arc<SqliteAuthStore> = if cli.no_persist {
        Arc::new(SqliteAuthStore::in_memory()?)
    } else {
        Arc::new(SqliteAuthStore::open(&config.db_path)?)
    };

    let services = Arc::new(EngineServices {
        manager: Arc::new(manager),
        auth,
        llm: Arc::new(llm),
        registry: Arc::new(registry),
        sink,
        clock: Arc::new(SystemClock),
        config,
    });

    let task = Task {
        task_id: Uuid::new_v4().to_string(),
        user_id: cli.user_id,
        query: cli.query,
        preloaded_workflow: None,
        conversation_id: None,
        status: TaskStatus::Created,
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let mut events = engine::execute(services, task, cancel);
    while let Some(event) = events.next().await {
        print_event(&event);
    }

    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::ExecutionStart { complexity, step_budget, .. } => {
            println!("== starting ({complexity}, budget {step_budget} steps) ==");
        }
        Event::StepExecuting { step, agent_name, tool, .. } => {
            println!("[{step}] -> {agent_name}::{tool}");
        }
        Event::StepResultChunk { chunk, .. } => {
            print!("{chunk}");
        }
        Event::StepFormattedResult { step, .. } => {
            println!("\n[{step}] formatted result ready");
        }
        Event::StepRawResult { .. } => {}
        Event::StepComplete { step, agent_name, progress } => {
            println!("[{step}] {agent_name} done ({}/{})", progress.completed, progress.total);
        }
        Event::StepError { step, agent_name, error, .. } => {
            println!("[{step}] {agent_name} failed: {error}");
        }
        Event::McpConnectionError { service, error_type, missing } => {
            println!("connection error for {service} ({error_type}), missing: {missing:?}");
        }
        Event::WorkflowAdapted { reason, new_steps } => {
            println!("workflow adapted: {reason} (new steps: {new_steps:?})");
        }
        Event::TaskObservation { should_continue, confidence_score, .. } => {
            println!("observer: continue={should_continue}, confidence={confidence_score:.2}");
        }
        Event::SummaryChunk { chunk, .. } => {
            print!("{chunk}");
        }
        Event::TaskExecutionComplete { success, completed, failed, .. } => {
            println!("\n== complete: success={success} ({completed} ok, {failed} failed) ==");
        }
        Event::TaskExecutionError { reason, .. } => {
            println!("\n== execution error: {reason} ==");
        }
    }
}
