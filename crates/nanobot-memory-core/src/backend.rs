use crate::error::{MemoryError, MemoryResult};
use crate::sanitize::SanitizedId;
use crate::types::{Peer, RemoteMessage, RemoteSession, SessionContext};
use async_trait::async_trait;

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn get_or_create_peer(&self, id: SanitizedId, observed: bool) -> Peer {
        if observed {
            Peer::user(id)
        } else {
            Peer::assistant(id)
        }
    }

    fn get_or_create_session(&self, id: SanitizedId, user: Peer, assistant: Peer) -> RemoteSession {
        RemoteSession::new(id, user, assistant)
    }

    async fn add_messages(
        &self,
        session: &RemoteSession,
        messages: &[RemoteMessage],
    ) -> MemoryResult<()>;

    async fn context(
        &self,
        session: &RemoteSession,
        token_budget: Option<u32>,
    ) -> MemoryResult<SessionContext>;

    async fn record_fact(&self, session: &RemoteSession, fact: &str) -> MemoryResult<()>;

    async fn query(&self, session: &RemoteSession, query: &str) -> MemoryResult<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

const DISABLED: &str = "remote memory is disabled";

#[async_trait]
impl MemoryBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn add_messages(
        &self,
        _session: &RemoteSession,
        _messages: &[RemoteMessage],
    ) -> MemoryResult<()> {
        Ok(())
    }

    async fn context(
        &self,
        _session: &RemoteSession,
        _token_budget: Option<u32>,
    ) -> MemoryResult<SessionContext> {
        Err(MemoryError::unavailable(DISABLED))
    }

    async fn record_fact(&self, _session: &RemoteSession, _fact: &str) -> MemoryResult<()> {
        Ok(())
    }

    async fn query(&self, _session: &RemoteSession, _query: &str) -> MemoryResult<String> {
        Err(MemoryError::unavailable(DISABLED))
    }
}
