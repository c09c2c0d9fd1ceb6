//! Static catalog of predefined MCP services.
//!
//! The Engine consults this by name to build a subprocess spawn config; it
//! never mutates the registry at runtime. A plain `HashMap` lookup with a
//! `with_defaults()` constructor seeding a couple of illustrative entries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One environment variable slot a service's command expects, and which
/// credential key(s) can fill it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSlot {
    /// Environment variable name passed to the subprocess.
    pub var: String,
    /// Credential keys (in `MCPAuth::auth_data`) that can fill this slot,
    /// in preference order. The first present key wins.
    pub aliases: Vec<String>,
}

/// Spawn and auth configuration for one predefined MCP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub description: String,
    pub command: String,
    pub args: Vec<String>,
    pub env_declaration: Vec<EnvSlot>,
    pub auth_required: bool,
    /// Tool names this service declares, if known ahead of connecting
    /// (used by the Planner's available-services prompt; the live
    /// `listTools` call is still authoritative).
    pub declared_tools: Vec<String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            command: command.into(),
            args: Vec::new(),
            env_declaration: Vec::new(),
            auth_required: false,
            declared_tools: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn requiring_auth(mut self, slots: Vec<EnvSlot>) -> Self {
        self.auth_required = true;
        self.env_declaration = slots;
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.declared_tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

/// The catalog itself: service name → config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceConfig>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: ServiceConfig) {
        self.services.insert(config.name.clone(), config);
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    pub fn list(&self) -> Vec<&ServiceConfig> {
        self.services.values().collect()
    }

    /// Load from a TOML file with a top-level `[[service]]` array.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default, rename = "service")]
            services: Vec<ServiceConfig>,
        }
        let text = std::fs::read_to_string(path)?;
        let wrapper: Wrapper = toml::from_str(&text)?;
        let mut registry = Self::new();
        for service in wrapper.services {
            registry.register(service);
        }
        Ok(registry)
    }

    /// A couple of illustrative entries for running without a services file.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ServiceConfig::new(
            "coingecko",
            "Cryptocurrency price and market data",
            "npx",
        ).with_args(["-y", "@coingecko/mcp-server"])
            .with_tools(["get_price", "get_market_chart"]));

        registry.register(
            ServiceConfig::new("github", "GitHub repository operations", "npx")
                .with_args(["-y", "@modelcontextprotocol/server-github"])
                .requiring_auth(vec![EnvSlot {
                    var: "GITHUB_PERSONAL_ACCESS_TOKEN".to_string(),
                    aliases: vec!["GITHUB_PERSONAL_ACCESS_TOKEN".to_string(), "github_token".to_string()],
                }])
                .with_tools(["search_repositories", "get_issue", "create_issue"]),
        );

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let registry = ServiceRegistry::with_defaults();
        assert!(registry.get("coingecko").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.toml");
        std::fs::write(
            &path,
            r#"
            [[service]]
            name = "weather"
            description = "Weather lookups"
            command = "weather-mcp"
            args = []
            env_declaration = []
            auth_required = false
            declared_tools = ["get_forecast"]
            "#,
        )
        .unwrap();
        let registry = ServiceRegistry::load(&path).unwrap();
        let svc = registry.get("weather").unwrap();
        assert_eq!(svc.declared_tools, vec!["get_forecast"]);
    }
}
