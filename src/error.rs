//! Error taxonomy for the orchestrator core.
//!
//! Everything that can end a *run* is an [`EngineError`]; everything that can
//! end a single *step* attempt is folded into a [`types::FailureRecord`] via
//! [`crate::strategy`] instead, since step failures never propagate out of
//! [`crate::engine::execute`] (they're surfaced as `step_error` events).

use thiserror::Error;

/// Fatal errors that can terminate an `execute()` run before or during
/// preparation, or on cancellation. Step-level failures (tool errors,
/// timeouts, protocol errors during a call) do not produce this type — they
/// become [`crate::types::FailureRecord`]s and `step_error` events instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown service name or malformed service config.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or unverified credentials for a required MCP service.
    #[error("missing auth for service '{service}': requires {missing:?}")]
    Authentication {
        service: String,
        missing: Vec<String>,
    },

    /// Subprocess failed to start or the pipe broke outside of a single
    /// step's retry window (e.g. during initial connection).
    #[error("connection error for service '{service}': {source}")]
    Connection {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    /// The run was cancelled via its `CancellationToken`.
    #[error("run cancelled")]
    Cancelled,
}

/// Classification of a single tool-call failure, used by
/// [`crate::strategy::select_strategy`] to pick a [`crate::types::Strategy`].
///
/// This is distinct from [`EngineError`]: an `ErrorClass` describes one failed
/// attempt at one step, not a reason the whole run died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Subprocess/module crashed or reported a system-level error.
    System,
    /// Response shape didn't match schema, or exceeded a size/character limit.
    Shape,
    /// Authentication or permission was rejected by the tool/service.
    AuthPermission,
    /// The MCP connection was not established, or was closed mid-call.
    NotConnected,
    /// Timeout or transient network/server error.
    Transient,
    /// Anything else (including tool-reported application errors).
    Other,
}

impl ErrorClass {
    /// Classify a raw error message using the same substring heuristics the
    /// original system used, strategy-selection table.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("not connected") || lower.contains("connection closed") {
            ErrorClass::NotConnected
        } else if lower.contains("auth") || lower.contains("permission") || lower.contains("forbidden") {
            ErrorClass::AuthPermission
        } else if lower.contains("system") || lower.contains("module") || lower.contains("panic") {
            ErrorClass::System
        } else if lower.contains("character limit")
            || lower.contains("too long")
            || lower.contains("shape")
            || lower.contains("schema")
        {
            ErrorClass::Shape
        } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("server error") || lower.contains("network") {
            ErrorClass::Transient
        } else {
            ErrorClass::Other
        }
    }
}
