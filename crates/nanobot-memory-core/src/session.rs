use crate::backend::MemoryBackend;
use crate::context::ContextWindow;
use crate::error::{MemoryError, MemoryResult};
use crate::ledger::MigrationLedger;
use crate::local_store::LocalStore;
use crate::migration::{LocalSnapshot, MigrationEngine};
use crate::sanitize::{CollisionGuard, SanitizedId, sanitize};
use crate::types::{
    HistoryEntry, MigrationOutcome, MigrationRecord, RemoteMessage, RemoteSession, Role,
    SessionState, SyncOutcome,
};
use crate::utils::now_iso;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub assistant_peer_id: String,
    pub default_token_budget: Option<u32>,
    pub prefetch: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            assistant_peer_id: "nanobot".to_string(),
            default_token_budget: None,
            prefetch: true,
        }
    }
}

#[derive(Debug, Default)]
struct KeySlot {
    session: Option<RemoteSession>,
    rotated_id: Option<SanitizedId>,
}

type SlotHandle = Arc<AsyncMutex<KeySlot>>;

fn lock_sync<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rotation_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct SessionManager {
    backend: Arc<dyn MemoryBackend>,
    local: Arc<dyn LocalStore>,
    engine: MigrationEngine,
    settings: SessionSettings,
    assistant_id: SanitizedId,
    guard: CollisionGuard,
    slots: Mutex<HashMap<String, SlotHandle>>,
    states: Mutex<HashMap<String, SessionState>>,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        local: Arc<dyn LocalStore>,
        ledger: Arc<MigrationLedger>,
        settings: SessionSettings,
    ) -> Self {
        let assistant_id = sanitize(&settings.assistant_peer_id);
        Self {
            engine: MigrationEngine::new(Arc::clone(&backend), ledger),
            backend,
            local,
            settings,
            assistant_id,
            guard: CollisionGuard::default(),
            slots: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    #[must_use]
    pub fn migration_invocations(&self) -> usize {
        self.engine.invocations()
    }

    #[must_use]
    pub fn state(&self, key: &str) -> SessionState {
        lock_sync(&self.states)
            .get(key)
            .copied()
            .unwrap_or(SessionState::Unresolved)
    }

    pub fn migration_record(&self, key: &str) -> MemoryResult<Option<MigrationRecord>> {
        self.engine
            .ledger()
            .get(key)
            .map_err(|error| MemoryError::LocalStore(error.to_string()))
    }

    fn set_state(&self, key: &str, state: SessionState) {
        lock_sync(&self.states).insert(key.to_string(), state);
    }

    fn slot(&self, key: &str) -> SlotHandle {
        let mut slots = lock_sync(&self.slots);
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    fn open_session(&self, key: &str, rotated_id: Option<SanitizedId>) -> RemoteSession {
        let base = self.guard.sanitize(key);
        let session_id = rotated_id.unwrap_or_else(|| base.clone());
        let user = self.backend.get_or_create_peer(base, true);
        let assistant = self
            .backend
            .get_or_create_peer(self.assistant_id.clone(), false);
        self.backend
            .get_or_create_session(session_id, user, assistant)
    }

    fn load_snapshot(&self, key: &str) -> MemoryResult<LocalSnapshot> {
        let already = self
            .engine
            .ledger()
            .is_migrated(key)
            .map_err(|error| MemoryError::LocalStore(error.to_string()))?;
        if already {
            return Ok(LocalSnapshot::default());
        }
        LocalSnapshot::load(self.local.as_ref(), key).map_err(|error| {
            MemoryError::MigrationFailure {
                key: key.to_string(),
                reason: format!("read local store: {error}"),
            }
        })
    }

    async fn resolve_locked(&self, key: &str, slot: &mut KeySlot) -> MemoryResult<RemoteSession> {
        if let Some(session) = &slot.session {
            return Ok(session.clone());
        }
        if self.state(key) == SessionState::Active {
            let session = self.open_session(key, slot.rotated_id.clone());
            slot.session = Some(session.clone());
            tracing::debug!(key, session = %session.id(), "opened rotated session");
            return Ok(session);
        }

        self.set_state(key, SessionState::Migrating);
        let session = self.open_session(key, slot.rotated_id.clone());

        let snapshot = match self.load_snapshot(key) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.set_state(key, SessionState::Unresolved);
                return Err(error);
            }
        };

        match self.engine.migrate(key, &session, &snapshot).await {
            MigrationOutcome::Migrated { .. } | MigrationOutcome::Skipped => {
                slot.session = Some(session.clone());
                self.set_state(key, SessionState::Active);
                tracing::debug!(key, session = %session.id(), "session active");
                Ok(session)
            }
            MigrationOutcome::Failed { reason } => {
                self.set_state(key, SessionState::Unresolved);
                Err(MemoryError::MigrationFailure {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }

    pub async fn resolve(&self, key: &str) -> MemoryResult<RemoteSession> {
        let handle = self.slot(key);
        let mut slot = handle.lock().await;
        self.resolve_locked(key, &mut slot).await
    }

    pub async fn sync_exchange(
        &self,
        key: &str,
        user_message: &str,
        assistant_message: &str,
    ) -> MemoryResult<SyncOutcome> {
        let handle = self.slot(key);
        let mut slot = handle.lock().await;

        let stamp = now_iso();
        let entries = [
            HistoryEntry {
                timestamp: Some(stamp.clone()),
                ..HistoryEntry::new(Role::User, user_message)
            },
            HistoryEntry {
                timestamp: Some(stamp),
                ..HistoryEntry::new(Role::Assistant, assistant_message)
            },
        ];

        let result = match self.resolve_locked(key, &mut slot).await {
            Ok(session) => {
                let messages = entries.iter().map(RemoteMessage::from).collect::<Vec<_>>();
                self.backend.add_messages(&session, &messages).await
            }
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => Ok(SyncOutcome::Remote),
            Err(error) => {
                tracing::warn!(key, %error, "remote sync failed; queueing exchange locally");
                self.local
                    .append_pending(key, &entries)
                    .map_err(|error| MemoryError::LocalStore(error.to_string()))?;
                Ok(SyncOutcome::LocalFallback)
            }
        }
    }

    fn local_window(&self, key: &str, token_budget: Option<u32>) -> ContextWindow {
        match self.local.read_facts() {
            Ok(facts) => ContextWindow::from_facts(facts, token_budget),
            Err(error) => {
                tracing::warn!(key, %error, "failed to read local facts");
                ContextWindow::empty(token_budget)
            }
        }
    }

    pub async fn get_user_context(&self, key: &str, token_budget: Option<u32>) -> ContextWindow {
        let budget = token_budget.or(self.settings.default_token_budget);
        let handle = self.slot(key);
        let mut slot = handle.lock().await;

        let session = match self.resolve_locked(key, &mut slot).await {
            Ok(session) => session,
            Err(error) => {
                tracing::debug!(key, %error, "using local facts as context");
                return self.local_window(key, budget);
            }
        };

        match self.backend.context(&session, budget).await {
            Ok(context) => ContextWindow::from_remote(context, budget),
            Err(error) => {
                tracing::debug!(key, %error, "remote context unavailable; using local facts");
                self.local_window(key, budget)
            }
        }
    }

    pub async fn query_user_context(&self, key: &str, query: &str) -> String {
        let handle = self.slot(key);
        let mut slot = handle.lock().await;

        let answer = match self.resolve_locked(key, &mut slot).await {
            Ok(session) => self.backend.query(&session, query).await,
            Err(error) => Err(error),
        };
        match answer {
            Ok(answer) if !answer.trim().is_empty() => answer,
            Ok(_) => String::new(),
            Err(error) => {
                tracing::debug!(key, %error, "user query unavailable; answering from local facts");
                self.local.read_facts().ok().flatten().unwrap_or_default()
            }
        }
    }

    pub async fn rotate_session(&self, key: &str) -> SanitizedId {
        let handle = self.slot(key);
        let mut slot = handle.lock().await;

        let base = self.guard.sanitize(key);
        let current = slot
            .session
            .as_ref()
            .map(|session| session.id().clone())
            .or_else(|| slot.rotated_id.clone())
            .unwrap_or_else(|| base.clone());

        let mut next = base.with_suffix(&rotation_suffix());
        while next == current {
            next = base.with_suffix(&rotation_suffix());
        }

        slot.session = None;
        slot.rotated_id = Some(next.clone());
        tracing::info!(key, previous = %current, next = %next, "rotated remote session");
        next
    }

    pub async fn session_id(&self, key: &str) -> Option<SanitizedId> {
        let handle = self.slot(key);
        let slot = handle.lock().await;
        slot.session
            .as_ref()
            .map(|session| session.id().clone())
            .or_else(|| slot.rotated_id.clone())
    }

    pub async fn reconcile(&self, key: &str) -> MemoryResult<usize> {
        let handle = self.slot(key);
        let mut slot = handle.lock().await;

        let session = self.resolve_locked(key, &mut slot).await?;
        let history = self
            .local
            .read_history(key)
            .map_err(|error| MemoryError::LocalStore(error.to_string()))?;
        let replayed = self.engine.replay_pending(key, &session, &history).await?;
        tracing::info!(key, replayed, "reconciled fallback-queued exchanges");
        Ok(replayed)
    }

    pub async fn on_turn_start(&self, key: &str) -> ContextWindow {
        if self.settings.prefetch {
            return self.get_user_context(key, None).await;
        }
        if let Err(error) = self.resolve(key).await {
            tracing::debug!(key, %error, "resolve failed during turn start");
        }
        ContextWindow::empty(self.settings.default_token_budget)
    }

    pub async fn on_turn_end(&self, key: &str, user_message: &str, assistant_message: &str) {
        match self
            .sync_exchange(key, user_message, assistant_message)
            .await
        {
            Ok(outcome) => tracing::debug!(key, ?outcome, "exchange persisted"),
            Err(error) => {
                tracing::error!(key, %error, "exchange could not be persisted remotely or locally");
            }
        }
    }
}
