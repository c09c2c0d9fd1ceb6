//! Connection table keyed by `(user_id, service_name)`, one rmcp child
//! process per key, so two users never share a subprocess or its auth
//! environment.
//!
//! `connect` is one-shot — it succeeds, or returns an error the caller
//! classifies and acts on, same as any other step failure. There is no
//! background retry loop: a workflow step that needs a connection already
//! has its own retry/strategy machinery, so a second layer of retries here
//! would just double the backoff for no benefit.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, Tool};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::TokioChildProcess;
use rmcp::RoleClient;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::registry::ServiceConfig;
use crate::types::ToolDescriptor;

type McpService = RunningService<RoleClient, ()>;

/// Connection key: a service subprocess is never shared across users.
type ConnKey = (String, String);

struct ManagedConnection {
    service: Arc<McpService>,
    tools: Vec<Tool>,
    /// Serializes calls on this connection. MCP stdio transports correlate
    /// responses by request id, but not every server implementation handles
    /// concurrent in-flight calls cleanly, so one in-flight call per
    /// connection at a time.
    call_lock: Mutex<()>,
}

/// Snapshot of one connection's state, for diagnostics/listing.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub user_id: String,
    pub service_name: String,
    pub tool_count: usize,
}

/// Result of a single tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub content: serde_json::Value,
    pub is_error: bool,
}

/// Seam the Engine depends on (`Arc<dyn ConnectionManager>`), so tests can
/// substitute a stub that never spawns a real subprocess.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Connect to `config`, spawning its subprocess with `env` applied on
    /// top of the parent environment. Idempotent: an existing connection for
    /// the same `(user_id, config.name)` is reused without respawning.
    async fn connect(
        &self,
        user_id: &str,
        config: &ServiceConfig,
        env: HashMap<String, String>,
    ) -> Result<usize, EngineError>;

    async fn disconnect(&self, user_id: &str, service_name: &str);

    async fn disconnect_all(&self, user_id: &str);

    async fn list_connected(&self, user_id: &str) -> Vec<ConnectionStatus>;

    /// Look up the connection for `(user_id, service_name)` without calling
    /// it, for callers (diagnostics, health checks) that just need to know a
    /// connection exists and how many tools it declared. The engine itself
    /// never needs this — `list_tools`/`call_tool` already imply "connected".
    async fn get_client(&self, user_id: &str, service_name: &str) -> Option<ConnectionStatus>;

    async fn list_tools(&self, user_id: &str, service_name: &str) -> Result<Vec<ToolDescriptor>, EngineError>;

    async fn call_tool(
        &self,
        user_id: &str,
        service_name: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<ToolCallOutcome, EngineError>;
}

/// Real, rmcp-backed manager. One `TokioChildProcess` per connection.
#[derive(Default)]
pub struct McpManager {
    connections: RwLock<HashMap<ConnKey, ManagedConnection>>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn spawn(config: &ServiceConfig, env: &HashMap<String, String>) -> anyhow::Result<(McpService, Vec<Tool>)> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::null());

        let transport = TokioChildProcess::new(cmd)?;
        let service = ().serve(transport).await.map_err(|e| anyhow::anyhow!("mcp handshake failed: {e}"))?;

        let tools_result = service.list_tools(Default::default()).await.map_err(|e| anyhow::anyhow!("list_tools failed: {e}"))?;

        Ok((service, tools_result.tools))
    }
}

#[async_trait]
impl ConnectionManager for McpManager {
    #[instrument(skip(self, env), fields(service = %config.name))]
    async fn connect(&self, user_id: &str, config: &ServiceConfig, env: HashMap<String, String>) -> Result<usize, EngineError> {
        let key = (user_id.to_string(), config.name.clone());

        {
            let connections = self.connections.read().await;
            if let Some(existing) = connections.get(&key) {
                return Ok(existing.tools.len());
            }
        }

        info!(user_id, service = %config.name, command = %config.command, "spawning MCP service");

        let (service, tools) = Self::spawn(config, &env).await.map_err(|source| EngineError::Connection {
            service: config.name.clone(),
            source,
        })?;

        let tool_count = tools.len();
        let managed = ManagedConnection {
            service: Arc::new(service),
            tools,
            call_lock: Mutex::new(()),
        };

        self.connections.write().await.insert(key, managed);
        Ok(tool_count)
    }

    async fn disconnect(&self, user_id: &str, service_name: &str) {
        let key = (user_id.to_string(), service_name.to_string());
        if let Some(conn) = self.connections.write().await.remove(&key) {
            debug!(user_id, service = service_name, "disconnecting MCP service");
            conn.service.cancellation_token().cancel();
        }
    }

    async fn disconnect_all(&self, user_id: &str) {
        let keys: Vec<ConnKey> = {
            let connections = self.connections.read().await;
            connections.keys().filter(|(u, _)| u == user_id).cloned().collect()
        };
        for (_, service_name) in keys {
            self.disconnect(user_id, &service_name).await;
        }
    }

    async fn list_connected(&self, user_id: &str) -> Vec<ConnectionStatus> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|((u, _), _)| u == user_id)
            .map(|((u, s), conn)| ConnectionStatus {
                user_id: u.clone(),
                service_name: s.clone(),
                tool_count: conn.tools.len(),
            })
            .collect()
    }

    async fn get_client(&self, user_id: &str, service_name: &str) -> Option<ConnectionStatus> {
        let key = (user_id.to_string(), service_name.to_string());
        let connections = self.connections.read().await;
        connections.get(&key).map(|conn| ConnectionStatus {
            user_id: user_id.to_string(),
            service_name: service_name.to_string(),
            tool_count: conn.tools.len(),
        })
    }

    async fn list_tools(&self, user_id: &str, service_name: &str) -> Result<Vec<ToolDescriptor>, EngineError> {
        let key = (user_id.to_string(), service_name.to_string());
        let connections = self.connections.read().await;
        let conn = connections.get(&key).ok_or_else(|| EngineError::Connection {
            service: service_name.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;

        Ok(conn
            .tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.clone().unwrap_or_default().to_string(),
                input_schema: serde_json::Value::Object((*t.input_schema).clone()),
            })
            .collect())
    }

    #[instrument(skip(self, args), fields(service = service_name, tool = tool_name))]
    async fn call_tool(&self, user_id: &str, service_name: &str, tool_name: &str, args: serde_json::Value) -> Result<ToolCallOutcome, EngineError> {
        let key = (user_id.to_string(), service_name.to_string());
        let service = {
            let connections = self.connections.read().await;
            let conn = connections.get(&key).ok_or_else(|| EngineError::Connection {
                service: service_name.to_string(),
                source: anyhow::anyhow!("not connected"),
            })?;
            conn.service.clone()
        };

        let _permit = {
            let connections = self.connections.read().await;
            let conn = connections.get(&key).expect("checked above");
            conn.call_lock.lock().await
        };

        debug!(user_id, service = service_name, tool = tool_name, "calling tool");

        let result = service
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments: args.as_object().cloned(),
            })
            .await
            .map_err(|e| {
                warn!(user_id, service = service_name, tool = tool_name, error = %e, "tool call failed");
                EngineError::Connection {
                    service: service_name.to_string(),
                    source: anyhow::anyhow!("tool call failed: {e}"),
                }
            })?;

        let text = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");

        let content = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

        Ok(ToolCallOutcome {
            content,
            is_error: result.is_error.unwrap_or(false),
        })
    }
}

/// In-memory [`ConnectionManager`] for engine/integration tests — never
/// spawns a subprocess. Tools and call results are configured per service
/// up front (shared across users, like the real service registry); `connect`
/// always succeeds unless the service was registered via
/// [`StubConnectionManager::failing`]. Which `(user_id, service_name)` pairs
/// have actually connected is tracked separately, the same way `McpManager`
/// keys its real connection table, so per-user isolation is something this
/// stub can actually fail to uphold rather than something it fakes by
/// construction.
#[derive(Default)]
pub struct StubConnectionManager {
    services: RwLock<HashMap<String, StubService>>,
    connections: RwLock<HashSet<ConnKey>>,
}

struct StubService {
    tools: Vec<ToolDescriptor>,
    responses: Mutex<Vec<Result<ToolCallOutcome, String>>>,
    connect_error: Option<String>,
}

impl StubConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service with a fixed tool list and a queue of call
    /// outcomes returned in order (repeating the last one once drained).
    pub async fn with_service(&self, service_name: &str, tools: Vec<ToolDescriptor>, responses: Vec<Result<ToolCallOutcome, String>>) {
        self.services.write().await.insert(
            service_name.to_string(),
            StubService {
                tools,
                responses: Mutex::new(responses),
                connect_error: None,
            },
        );
    }

    /// Register a service whose `connect` always fails with `error`.
    pub async fn failing(&self, service_name: &str, error: &str) {
        self.services.write().await.insert(
            service_name.to_string(),
            StubService {
                tools: Vec::new(),
                responses: Mutex::new(Vec::new()),
                connect_error: Some(error.to_string()),
            },
        );
    }
}

#[async_trait]
impl ConnectionManager for StubConnectionManager {
    async fn connect(&self, user_id: &str, config: &ServiceConfig, _env: HashMap<String, String>) -> Result<usize, EngineError> {
        let tool_count = {
            let services = self.services.read().await;
            let service = services.get(&config.name).ok_or_else(|| EngineError::Connection {
                service: config.name.clone(),
                source: anyhow::anyhow!("stub has no service registered for '{}'", config.name),
            })?;
            if let Some(error) = &service.connect_error {
                return Err(EngineError::Connection {
                    service: config.name.clone(),
                    source: anyhow::anyhow!(error.clone()),
                });
            }
            service.tools.len()
        };
        self.connections.write().await.insert((user_id.to_string(), config.name.clone()));
        Ok(tool_count)
    }

    async fn disconnect(&self, user_id: &str, service_name: &str) {
        self.connections.write().await.remove(&(user_id.to_string(), service_name.to_string()));
    }

    async fn disconnect_all(&self, user_id: &str) {
        self.connections.write().await.retain(|(u, _)| u != user_id);
    }

    async fn list_connected(&self, user_id: &str) -> Vec<ConnectionStatus> {
        let connections = self.connections.read().await;
        let services = self.services.read().await;
        connections
            .iter()
            .filter(|(u, _)| u == user_id)
            .filter_map(|(u, s)| {
                services.get(s).map(|svc| ConnectionStatus {
                    user_id: u.clone(),
                    service_name: s.clone(),
                    tool_count: svc.tools.len(),
                })
            })
            .collect()
    }

    async fn get_client(&self, user_id: &str, service_name: &str) -> Option<ConnectionStatus> {
        let key = (user_id.to_string(), service_name.to_string());
        if !self.connections.read().await.contains(&key) {
            return None;
        }
        let services = self.services.read().await;
        services.get(service_name).map(|s| ConnectionStatus {
            user_id: user_id.to_string(),
            service_name: service_name.to_string(),
            tool_count: s.tools.len(),
        })
    }

    async fn list_tools(&self, user_id: &str, service_name: &str) -> Result<Vec<ToolDescriptor>, EngineError> {
        let key = (user_id.to_string(), service_name.to_string());
        if !self.connections.read().await.contains(&key) {
            return Err(EngineError::Connection {
                service: service_name.to_string(),
                source: anyhow::anyhow!("not connected"),
            });
        }
        let services = self.services.read().await;
        let service = services.get(service_name).ok_or_else(|| EngineError::Connection {
            service: service_name.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;
        Ok(service.tools.clone())
    }

    async fn call_tool(&self, user_id: &str, service_name: &str, _tool_name: &str, _args: serde_json::Value) -> Result<ToolCallOutcome, EngineError> {
        let key = (user_id.to_string(), service_name.to_string());
        if !self.connections.read().await.contains(&key) {
            return Err(EngineError::Connection {
                service: service_name.to_string(),
                source: anyhow::anyhow!("not connected"),
            });
        }
        let services = self.services.read().await;
        let service = services.get(service_name).ok_or_else(|| EngineError::Connection {
            service: service_name.to_string(),
            source: anyhow::anyhow!("not connected"),
        })?;
        let mut responses = service.responses.lock().await;
        let outcome = if responses.is_empty() {
            Err("stub has no more queued responses".to_string())
        } else {
            responses.remove(0)
        };
        outcome.map_err(|e| EngineError::Connection {
            service: service_name.to_string(),
            source: anyhow::anyhow!(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_carries_key() {
        let status = ConnectionStatus {
            user_id: "u1".to_string(),
            service_name: "coingecko".to_string(),
            tool_count: 2,
        };
        assert_eq!(status.user_id, "u1");
        assert_eq!(status.tool_count, 2);
    }

    #[tokio::test]
    async fn disconnect_of_unknown_connection_is_a_noop() {
        let manager = McpManager::new();
        manager.disconnect("u1", "nonexistent").await;
        assert!(manager.list_connected("u1").await.is_empty());
    }

    #[tokio::test]
    async fn get_client_is_none_for_an_unconnected_pair() {
        let manager = McpManager::new();
        assert!(manager.get_client("u1", "coingecko").await.is_none());
    }

    #[tokio::test]
    async fn stub_get_client_reports_registered_tool_count() {
        let manager = StubConnectionManager::new();
        manager.with_service("coingecko", vec![ToolDescriptor { name: "get_price".to_string(), description: String::new(), input_schema: serde_json::json!({}) }], vec![]).await;
        manager.connect("u1", &ServiceConfig::new("coingecko", "d", "npx"), HashMap::new()).await.unwrap();
        let status = manager.get_client("u1", "coingecko").await.unwrap();
        assert_eq!(status.tool_count, 1);
        assert!(manager.get_client("u1", "nonexistent").await.is_none());
        assert!(manager.get_client("u2", "coingecko").await.is_none());
    }
}
