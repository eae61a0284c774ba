use crate::backend::MemoryBackend;
use crate::error::{MemoryError, MemoryResult};
use crate::ledger::MigrationLedger;
use crate::local_store::LocalStore;
use crate::types::{HistoryEntry, MigrationOutcome, RemoteMessage, RemoteSession};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    pub history: Vec<HistoryEntry>,
    pub facts: Option<String>,
    pub history_note: Option<String>,
}

impl LocalSnapshot {
    pub fn load(store: &dyn LocalStore, key: &str) -> anyhow::Result<Self> {
        Ok(Self {
            history: store.read_history(key)?,
            facts: store.read_facts()?,
            history_note: store.read_history_note()?,
        })
    }

    fn conversational_messages(&self) -> Vec<RemoteMessage> {
        self.history
            .iter()
            .filter(|entry| entry.role.is_conversational())
            .map(RemoteMessage::from)
            .collect()
    }

    fn seed_notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if let Some(facts) = self.facts.as_deref().filter(|f| !f.trim().is_empty()) {
            notes.push(format!("Facts remembered about the user:\n{facts}"));
        }
        if let Some(note) = self.history_note.as_deref().filter(|n| !n.trim().is_empty()) {
            notes.push(format!("Summary of earlier conversations:\n{note}"));
        }
        notes
    }
}

pub struct MigrationEngine {
    backend: Arc<dyn MemoryBackend>,
    ledger: Arc<MigrationLedger>,
    invocations: AtomicUsize,
}

impl MigrationEngine {
    pub fn new(backend: Arc<dyn MemoryBackend>, ledger: Arc<MigrationLedger>) -> Self {
        Self {
            backend,
            ledger,
            invocations: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<MigrationLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    pub async fn migrate(
        &self,
        key: &str,
        session: &RemoteSession,
        local: &LocalSnapshot,
    ) -> MigrationOutcome {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        match self.ledger.is_migrated(key) {
            Ok(true) => {
                tracing::debug!(key, "already migrated");
                return MigrationOutcome::Skipped;
            }
            Ok(false) => {}
            Err(error) => {
                return self.fail(key, format!("read migration ledger: {error}"));
            }
        }

        let messages = local.conversational_messages();
        let notes = local.seed_notes();

        if messages.is_empty() && notes.is_empty() {
            if let Err(error) = self.ledger.mark_migrated(key, local.history.len(), 0) {
                return self.fail(key, format!("write migration ledger: {error}"));
            }
            self.ledger
                .record_event(key, "skipped", Some(&json!({"reason": "empty local store"})));
            tracing::debug!(key, "nothing to migrate");
            return MigrationOutcome::Skipped;
        }

        tracing::info!(
            key,
            session = %session.id(),
            messages = messages.len(),
            notes = notes.len(),
            "migrating local history to remote memory"
        );

        if !messages.is_empty()
            && let Err(error) = self.backend.add_messages(session, &messages).await
        {
            return self.fail(key, error.to_string());
        }
        for note in &notes {
            if let Err(error) = self.backend.record_fact(session, note).await {
                return self.fail(key, error.to_string());
            }
        }

        if let Err(error) = self
            .ledger
            .mark_migrated(key, local.history.len(), messages.len())
        {
            return self.fail(key, format!("write migration ledger: {error}"));
        }
        self.ledger.record_event(
            key,
            "migrated",
            Some(&json!({
                "session": session.id(),
                "messages": messages.len(),
                "notes": notes.len(),
            })),
        );
        tracing::info!(key, count = messages.len(), "local history migration complete");

        MigrationOutcome::Migrated {
            count: messages.len(),
        }
    }

    fn fail(&self, key: &str, reason: String) -> MigrationOutcome {
        tracing::warn!(key, %reason, "migration failed; will retry on next resolve");
        self.ledger
            .record_event(key, "failed", Some(&json!({"reason": reason})));
        MigrationOutcome::Failed { reason }
    }

    pub async fn replay_pending(
        &self,
        key: &str,
        session: &RemoteSession,
        history: &[HistoryEntry],
    ) -> MemoryResult<usize> {
        let record = self
            .ledger
            .get(key)
            .map_err(|error| MemoryError::LocalStore(error.to_string()))?
            .filter(|record| record.migrated)
            .ok_or_else(|| MemoryError::MigrationFailure {
                key: key.to_string(),
                reason: "conversation has not been migrated yet".to_string(),
            })?;

        let start = record.cursor.min(history.len());
        let pending = history[start..]
            .iter()
            .filter(|entry| entry.pending_sync && entry.role.is_conversational())
            .map(RemoteMessage::from)
            .collect::<Vec<_>>();

        if !pending.is_empty() {
            self.backend.add_messages(session, &pending).await?;
        }
        self.ledger
            .advance_cursor(key, history.len(), pending.len())
            .map_err(|error| MemoryError::LocalStore(error.to_string()))?;
        self.ledger.record_event(
            key,
            "reconciled",
            Some(&json!({"messages": pending.len(), "cursor": history.len()})),
        );
        Ok(pending.len())
    }
}
