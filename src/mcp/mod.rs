//! MCP Connection Manager: spawns and owns subprocess
//! connections to MCP tool services, one per `(user_id, service_name)` pair.

mod manager;

pub use manager::{ConnectionManager, ConnectionStatus, McpManager, StubConnectionManager, ToolCallOutcome};
