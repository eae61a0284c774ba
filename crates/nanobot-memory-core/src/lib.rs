pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod ledger;
pub mod local_store;
pub mod migration;
pub mod paths;
pub mod remote;
pub mod sanitize;
pub mod service;
pub mod session;
pub mod types;
pub mod utils;

pub use backend::{MemoryBackend, NullBackend};
pub use config::HonchoSettings;
pub use context::{ContextWindow, PromptMessage, PromptPayload, build_prompt};
pub use error::{MemoryError, MemoryResult};
pub use local_store::{FileLocalStore, LocalStore};
pub use remote::{RemoteClientConfig, RemoteMemoryClient};
pub use sanitize::{SanitizedId, sanitize};
pub use service::MemoryService;
pub use session::{SessionManager, SessionSettings};
pub use types::{
    Capability, HistoryEntry, MigrationOutcome, MigrationRecord, Peer, RemoteMessage,
    RemoteSession, Role, SessionContext, SessionState, SyncOutcome,
};
