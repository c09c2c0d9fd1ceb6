//! orkestra — a dynamic, LLM-driven workflow orchestrator for tool-using agents.
//!
//! A caller submits a natural-language query; [`engine::execute`] decomposes it
//! into an ordered [`types::WorkflowStep`] plan, executes steps one at a time
//! against MCP tool subprocesses (see [`mcp`]), consults an LLM observer after
//! every step to decide whether to stop or replan, and streams [`events::Event`]s
//! back to the caller for incremental rendering.
//!
//! The HTTP/chat surface, conversation persistence backing store, auth/JWT, and
//! service registry metadata are treated as external collaborators with narrow
//! interfaces — see [`persistence`], [`auth`], and [`registry`].

pub mod auth;
pub mod breakdown;
pub mod clock;
pub mod complexity;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod formatter;
pub mod llm;
pub mod mcp;
pub mod observer;
pub mod persistence;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod strategy;
pub mod types;

pub use engine::{execute, EngineServices};
pub use error::EngineError;
pub use events::Event;
