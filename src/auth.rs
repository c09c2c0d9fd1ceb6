//! Credential Store & Auth Injector.
//!
//! `AuthStore` is the read side (the external auth subsystem owns writes —
//! this core only ever reads). `AuthInjector` derives a spawn
//! config with environment slots populated from a verified record, or
//! refuses with the offending service/key names.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::registry::{EnvSlot, ServiceConfig};
use crate::types::MCPAuth;

/// Read access to persisted [`MCPAuth`] records. The engine never writes
/// through this trait; verification happens out-of-band.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn get(&self, user_id: &str, service_name: &str) -> anyhow::Result<Option<MCPAuth>>;
}

/// SQLite-backed store: a `Mutex<Connection>` guarding records keyed by
/// `(user_id, service_name)`.
pub struct SqliteAuthStore {
    conn: Mutex<Connection>,
}

impl SqliteAuthStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.lock().unwrap().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mcp_auth (
                user_id TEXT NOT NULL,
                service_name TEXT NOT NULL,
                auth_data TEXT NOT NULL,
                is_verified INTEGER NOT NULL,
                verified_at TEXT,
                PRIMARY KEY (user_id, service_name)
            );
            "#,
        )?;
        Ok(())
    }

    /// Upsert a record (used by tests and by whatever external system owns
    /// verification — not part of the engine's read-only contract).
    pub fn upsert(&self, record: &MCPAuth) -> anyhow::Result<()> {
        let auth_json = serde_json::to_string(&record.auth_data)?;
        let verified_at = record.verified_at.map(|t| t.to_rfc3339());
        self.conn.lock().unwrap().execute(
            "INSERT INTO mcp_auth (user_id, service_name, auth_data, is_verified, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, service_name) DO UPDATE SET
                auth_data = excluded.auth_data,
                is_verified = excluded.is_verified,
                verified_at = excluded.verified_at",
            params![record.user_id, record.service_name, auth_json, record.is_verified as i32, verified_at],
        )?;
        Ok(())
    }
}

#[async_trait]
impl AuthStore for SqliteAuthStore {
    async fn get(&self, user_id: &str, service_name: &str) -> anyhow::Result<Option<MCPAuth>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT auth_data, is_verified, verified_at FROM mcp_auth WHERE user_id = ?1 AND service_name = ?2",
        )?;
        let mut rows = stmt.query(params![user_id, service_name])?;
        if let Some(row) = rows.next()? {
            let auth_json: String = row.get(0)?;
            let is_verified: i32 = row.get(1)?;
            let verified_at: Option<String> = row.get(2)?;
            Ok(Some(MCPAuth {
                user_id: user_id.to_string(),
                service_name: service_name.to_string(),
                auth_data: serde_json::from_str(&auth_json)?,
                is_verified: is_verified != 0,
                verified_at: verified_at.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&chrono::Utc)),
            }))
        } else {
            Ok(None)
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryAuthStore {
    records: Mutex<HashMap<(String, String), MCPAuth>>,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: MCPAuth) {
        self.records.lock().unwrap().insert((record.user_id.clone(), record.service_name.clone()), record);
    }
}

#[async_trait]
impl AuthStore for InMemoryAuthStore {
    async fn get(&self, user_id: &str, service_name: &str) -> anyhow::Result<Option<MCPAuth>> {
        Ok(self.records.lock().unwrap().get(&(user_id.to_string(), service_name.to_string())).cloned())
    }
}

/// Error returned when a service's auth requirement can't be satisfied.
#[derive(Debug, thiserror::Error)]
#[error("missing auth for service '{service}': requires {missing:?}")]
pub struct MissingAuth {
    pub service: String,
    pub missing: Vec<String>,
}

/// Derives a spawn config identical to `config.args`/`command` except with
/// environment slots populated from the user's verified auth record.
pub async fn inject(auth: &dyn AuthStore, user_id: &str, config: &ServiceConfig) -> Result<HashMap<String, String>, MissingAuth> {
    if !config.auth_required {
        return Ok(HashMap::new());
    }

    let record = auth
        .get(user_id, &config.name)
        .await
        .ok()
        .flatten()
        .filter(|r| r.is_verified);

    let Some(record) = record else {
        return Err(MissingAuth {
            service: config.name.clone(),
            missing: config.env_declaration.iter().map(|s| s.var.clone()).collect(),
        });
    };

    let mut env = HashMap::new();
    let mut missing = Vec::new();
    for slot in &config.env_declaration {
        let value = slot.aliases.iter().find_map(|alias| record.auth_data.get(alias));
        match value {
            Some(v) => {
                env.insert(slot.var.clone(), v.clone());
            }
            None => missing.push(slot.var.clone()),
        }
    }

    if !missing.is_empty() {
        return Err(MissingAuth { service: config.name.clone(), missing });
    }

    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn verified(user: &str, service: &str, data: &[(&str, &str)]) -> MCPAuth {
        let mut auth_data = StdHashMap::new();
        for (k, v) in data {
            auth_data.insert(k.to_string(), v.to_string());
        }
        MCPAuth {
            user_id: user.to_string(),
            service_name: service.to_string(),
            auth_data,
            is_verified: true,
            verified_at: Some(chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn injects_when_verified_and_complete() {
        let store = InMemoryAuthStore::new();
        store.insert(verified("u1", "github", &[("GITHUB_PERSONAL_ACCESS_TOKEN", "ghp_abc")]));

        let config = ServiceConfig::new("github", "desc", "npx").requiring_auth(vec![EnvSlot {
            var: "GITHUB_PERSONAL_ACCESS_TOKEN".to_string(),
            aliases: vec!["GITHUB_PERSONAL_ACCESS_TOKEN".to_string()],
        }]);

        let env = inject(&store, "u1", &config).await.unwrap();
        assert_eq!(env.get("GITHUB_PERSONAL_ACCESS_TOKEN"), Some(&"ghp_abc".to_string()));
    }

    #[tokio::test]
    async fn refuses_when_missing() {
        let store = InMemoryAuthStore::new();
        let config = ServiceConfig::new("github", "desc", "npx").requiring_auth(vec![EnvSlot {
            var: "GITHUB_PERSONAL_ACCESS_TOKEN".to_string(),
            aliases: vec!["GITHUB_PERSONAL_ACCESS_TOKEN".to_string()],
        }]);

        let err = inject(&store, "u1", &config).await.unwrap_err();
        assert_eq!(err.service, "github");
        assert_eq!(err.missing, vec!["GITHUB_PERSONAL_ACCESS_TOKEN".to_string()]);
    }

    #[tokio::test]
    async fn refuses_when_unverified() {
        let store = InMemoryAuthStore::new();
        let mut record = verified("u1", "github", &[("GITHUB_PERSONAL_ACCESS_TOKEN", "ghp_abc")]);
        record.is_verified = false;
        store.insert(record);

        let config = ServiceConfig::new("github", "desc", "npx").requiring_auth(vec![EnvSlot {
            var: "GITHUB_PERSONAL_ACCESS_TOKEN".to_string(),
            aliases: vec!["GITHUB_PERSONAL_ACCESS_TOKEN".to_string()],
        }]);

        assert!(inject(&store, "u1", &config).await.is_err());
    }

    #[tokio::test]
    async fn no_auth_required_short_circuits() {
        let store = InMemoryAuthStore::new();
        let config = ServiceConfig::new("coingecko", "desc", "npx");
        let env = inject(&store, "anyone", &config).await.unwrap();
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn sqlite_store_roundtrips() {
        let store = SqliteAuthStore::in_memory().unwrap();
        store.upsert(&verified("u1", "github", &[("tok", "v")])).unwrap();
        let fetched = store.get("u1", "github").await.unwrap().unwrap();
        assert!(fetched.is_verified);
        assert_eq!(fetched.auth_data.get("tok"), Some(&"v".to_string()));
        assert!(store.get("u2", "github").await.unwrap().is_none());
    }
}
