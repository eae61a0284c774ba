use crate::backend::{MemoryBackend, NullBackend};
use crate::config::{
    HonchoSettings, load_settings_at, resolve_credential, update_settings_at, write_env_key,
};
use crate::error::MemoryError;
use crate::ledger::MigrationLedger;
use crate::local_store::{FileLocalStore, LocalStore};
use crate::paths::{config_path_in, env_path_in, ledger_path_in, resolve_nanobot_home};
use crate::remote::{RemoteClientConfig, RemoteMemoryClient};
use crate::session::{SessionManager, SessionSettings};
use crate::types::Capability;
use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LEDGER_EVENTS_SHOWN: usize = 10;

fn ok(action: &str, data: Value) -> Value {
    json!({
        "ok": true,
        "action": action,
        "data": data,
    })
}

fn err(action: &str, message: impl AsRef<str>) -> Value {
    json!({
        "ok": false,
        "action": action,
        "error": message.as_ref(),
    })
}

#[must_use]
pub fn capabilities_for(settings: &HonchoSettings) -> Vec<Capability> {
    let mut capabilities = Vec::new();
    if settings.prefetch {
        capabilities.push(Capability::Prefetch);
    }
    if settings.enabled {
        capabilities.push(Capability::QueryUserContext);
    }
    capabilities
}

fn session_settings(settings: &HonchoSettings) -> SessionSettings {
    SessionSettings {
        assistant_peer_id: settings.assistant_peer_id.clone(),
        default_token_budget: settings.context_tokens,
        prefetch: settings.prefetch,
    }
}

pub fn status_at(home: &Path) -> Result<Value> {
    let settings = load_settings_at(&config_path_in(home))?;
    let credential = resolve_credential(&env_path_in(home)).is_some();
    let local = FileLocalStore::in_home(home);
    let conversations = local.list_conversations()?;

    let ledger_path = ledger_path_in(home);
    let records = if ledger_path.exists() {
        MigrationLedger::open(&ledger_path)?.list()?
    } else {
        Vec::new()
    };
    let migrated = records.iter().filter(|record| record.migrated).count();

    Ok(ok(
        "status",
        json!({
            "home": home.display().to_string(),
            "settings": settings,
            "credential_present": credential,
            "capabilities": capabilities_for(&settings),
            "local_conversations": conversations.len(),
            "migrated_conversations": migrated,
            "records": records,
        }),
    ))
}

pub fn enable_at(home: &Path, api_key: Option<&str>) -> Result<Value> {
    let env_path = env_path_in(home);
    if let Some(api_key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
        write_env_key(&env_path, api_key)?;
    }
    let credential = resolve_credential(&env_path).is_some();
    if !credential {
        tracing::warn!("remote memory enabled without an API key; set HONCHO_API_KEY");
    }

    let settings = update_settings_at(&config_path_in(home), |section| {
        section.insert("enabled".to_string(), Value::Bool(true));
        section.insert("prefetch".to_string(), Value::Bool(true));
        section
            .entry("workspaceId")
            .or_insert_with(|| Value::String(HonchoSettings::default().workspace_id));
    })?;
    tracing::info!(workspace = %settings.workspace_id, "remote memory enabled");
    Ok(ok(
        "enable",
        json!({ "settings": settings, "credential_present": credential }),
    ))
}

pub fn disable_at(home: &Path) -> Result<Value> {
    let settings = update_settings_at(&config_path_in(home), |section| {
        section.insert("enabled".to_string(), Value::Bool(false));
    })?;
    tracing::info!("remote memory disabled");
    Ok(ok("disable", json!({ "settings": settings })))
}

pub struct MemoryService {
    home: PathBuf,
    settings: HonchoSettings,
    local: Arc<FileLocalStore>,
    ledger: Arc<MigrationLedger>,
    sessions: Arc<SessionManager>,
    capabilities: Vec<Capability>,
}

impl MemoryService {
    pub fn new() -> Result<Self> {
        Self::new_with_home(&resolve_nanobot_home())
    }

    pub fn new_with_home(home: &Path) -> Result<Self> {
        let settings = load_settings_at(&config_path_in(home))?;
        if !settings.enabled {
            // Writes are dropped here, so migration records must not outlive the process.
            let ledger = MigrationLedger::open_in_memory()?;
            return Ok(Self::assemble(home, settings, Arc::new(NullBackend), ledger));
        }

        let api_key = resolve_credential(&env_path_in(home));
        let config = RemoteClientConfig::from_settings(&settings, api_key.as_deref())
            .context("configure remote memory")?;
        let client = RemoteMemoryClient::new(config).context("build remote memory client")?;
        let ledger = MigrationLedger::open(&ledger_path_in(home))?;
        Ok(Self::assemble(home, settings, Arc::new(client), ledger))
    }

    pub fn with_backend(
        home: &Path,
        settings: HonchoSettings,
        backend: Arc<dyn MemoryBackend>,
    ) -> Result<Self> {
        let ledger = MigrationLedger::open(&ledger_path_in(home))?;
        Ok(Self::assemble(home, settings, backend, ledger))
    }

    fn assemble(
        home: &Path,
        settings: HonchoSettings,
        backend: Arc<dyn MemoryBackend>,
        ledger: MigrationLedger,
    ) -> Self {
        let local = Arc::new(FileLocalStore::in_home(home));
        let ledger = Arc::new(ledger);
        let sessions = Arc::new(SessionManager::new(
            backend,
            Arc::clone(&local) as Arc<dyn LocalStore>,
            Arc::clone(&ledger),
            session_settings(&settings),
        ));
        let capabilities = capabilities_for(&settings);
        tracing::debug!(
            backend = sessions.backend_name(),
            ?capabilities,
            "memory service ready"
        );

        Self {
            home: home.to_path_buf(),
            settings,
            local,
            ledger,
            sessions,
            capabilities,
        }
    }

    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    #[must_use]
    pub fn settings(&self) -> &HonchoSettings {
        &self.settings
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn local_store(&self) -> &Arc<FileLocalStore> {
        &self.local
    }

    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub async fn migrate_all(&self) -> Result<Value> {
        if self.sessions.backend_name() == "null" {
            return Ok(err(
                "migrate",
                "remote memory is disabled; run `nanobot-memory enable` first",
            ));
        }

        let keys = self.local.list_conversations()?;
        let mut results = Vec::with_capacity(keys.len());
        let mut failures = 0_usize;
        for key in keys {
            let was_migrated = self.ledger.is_migrated(&key)?;
            let entry = match self.sessions.resolve(&key).await {
                Ok(session) => {
                    let outcome = if was_migrated { "skipped" } else { "migrated" };
                    let record = self.ledger.get(&key)?;
                    json!({
                        "key": key,
                        "session": session.id(),
                        "outcome": outcome,
                        "count": record.map_or(0, |record| record.migrated_count),
                    })
                }
                Err(error) => {
                    failures += 1;
                    json!({ "key": key, "outcome": "failed", "reason": error.to_string() })
                }
            };
            results.push(entry);
        }

        Ok(ok(
            "migrate",
            json!({
                "conversations": results.len(),
                "failures": failures,
                "results": results,
            }),
        ))
    }

    pub async fn context(&self, key: &str, token_budget: Option<u32>) -> Result<Value> {
        let window = self.sessions.get_user_context(key, token_budget).await;
        let session = self.sessions.session_id(key).await;
        let rendered = window.render();
        Ok(ok(
            "context",
            json!({
                "key": key,
                "session": session,
                "state": self.sessions.state(key),
                "empty": window.is_empty(),
                "window": window,
                "rendered": rendered,
            }),
        ))
    }

    pub async fn reconcile(&self, key: &str) -> Result<Value> {
        match self.sessions.reconcile(key).await {
            Ok(replayed) => Ok(ok(
                "reconcile",
                json!({
                    "key": key,
                    "replayed": replayed,
                    "record": self.ledger.get(key)?,
                    "events": self.ledger.events(key, LEDGER_EVENTS_SHOWN)?,
                }),
            )),
            Err(error @ MemoryError::LocalStore(_)) => {
                Err(anyhow::Error::new(error).context(format!("reconcile {key}")))
            }
            Err(error) => Ok(err("reconcile", error.to_string())),
        }
    }

    pub async fn ask(&self, key: &str, query: &str) -> Result<Value> {
        if !self.has_capability(Capability::QueryUserContext) {
            return Ok(err("ask", "user queries need remote memory to be enabled"));
        }
        let answer = self.sessions.query_user_context(key, query).await;
        Ok(ok("ask", json!({ "key": key, "answer": answer })))
    }
}

#[cfg(test)]
mod tests {
    use super::{capabilities_for, disable_at, enable_at, status_at};
    use crate::config::HonchoSettings;
    use crate::types::Capability;
    use std::fs;

    #[test]
    fn capabilities_follow_settings() {
        let mut settings = HonchoSettings::default();
        assert_eq!(capabilities_for(&settings), vec![Capability::Prefetch]);

        settings.enabled = true;
        settings.prefetch = false;
        assert_eq!(
            capabilities_for(&settings),
            vec![Capability::QueryUserContext]
        );
    }

    #[test]
    fn enable_and_disable_preserve_unrelated_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path();
        fs::write(
            home.join("config.json"),
            r#"{"agents": {"model": "x"}, "honcho": {"workspaceId": "mine"}}"#,
        )
        .expect("write config");

        let enabled = enable_at(home, Some("sk-test")).expect("enable");
        assert_eq!(enabled["ok"], true);
        assert_eq!(enabled["data"]["settings"]["enabled"], true);
        assert_eq!(enabled["data"]["settings"]["workspaceId"], "mine");
        let env = fs::read_to_string(home.join(".env")).expect("env");
        assert!(env.contains("HONCHO_API_KEY=sk-test"));

        let disabled = disable_at(home).expect("disable");
        assert_eq!(disabled["data"]["settings"]["enabled"], false);

        let raw = fs::read_to_string(home.join("config.json")).expect("config");
        assert!(raw.contains("\"model\": \"x\""));

        let status = status_at(home).expect("status");
        assert_eq!(status["ok"], true);
        assert_eq!(status["data"]["credential_present"], true);
        assert!(!status.to_string().contains("sk-test"));
    }

    #[test]
    fn enable_defaults_workspace_and_turns_prefetch_on() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path();
        fs::write(
            home.join("config.json"),
            r#"{"honcho": {"prefetch": false}}"#,
        )
        .expect("write config");

        let enabled = enable_at(home, None).expect("enable");
        assert_eq!(enabled["ok"], true);
        assert_eq!(enabled["data"]["settings"]["enabled"], true);
        assert_eq!(enabled["data"]["settings"]["prefetch"], true);

        let raw: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(home.join("config.json")).expect("config"),
        )
        .expect("json");
        assert_eq!(raw["honcho"]["workspaceId"], "nanobot");
        assert_eq!(raw["honcho"]["prefetch"], true);
    }
}
