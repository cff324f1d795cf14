use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use switchboard_config::Store;
use switchboard_kernel::ConversationSession;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store misconfigured: {0}")]
    Config(String),
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    sessions: HashMap<String, ConversationSession>,
}

pub(crate) struct SqliteStore {
    conn: Connection,
}

pub(crate) enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub(crate) fn open(cfg: &Store) -> Result<Self, StoreError> {
        if cfg.kind == "sqlite" {
            let path = cfg.sqlite_path.as_deref().ok_or_else(|| {
                StoreError::Config("store.sqlite_path is required for sqlite store".to_string())
            })?;
            Ok(StoreBackend::Sqlite(SqliteStore::new(path)?))
        } else {
            Ok(StoreBackend::Memory(MemoryStore::default()))
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Sqlite(_) => "sqlite",
        }
    }

    pub(crate) fn get_session(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSession>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.sessions.get(conversation_id).cloned()),
            StoreBackend::Sqlite(store) => store.get_session(conversation_id),
        }
    }

    pub(crate) fn save_session(&mut self, session: &ConversationSession) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .sessions
                    .insert(session.conversation_id.clone(), session.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_session(session),
        }
    }

    pub(crate) fn remove_session(&mut self, conversation_id: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store.sessions.remove(conversation_id);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.remove_session(conversation_id),
        }
    }

    /// Drops every session idle since before `cutoff`. Returns how many went.
    pub(crate) fn purge_idle_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let before = store.sessions.len();
                store
                    .sessions
                    .retain(|_, session| session.last_activity_at >= cutoff);
                Ok(before - store.sessions.len())
            }
            StoreBackend::Sqlite(store) => store.purge_idle_before(cutoff),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversation_sessions (
                conversation_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                last_activity_ms INTEGER NOT NULL,
                session_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_last_activity
                ON conversation_sessions(last_activity_ms);
            ",
        )?;
        Ok(Self { conn })
    }

    fn get_session(&self, conversation_id: &str) -> Result<Option<ConversationSession>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT session_json FROM conversation_sessions WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    fn save_session(&mut self, session: &ConversationSession) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        let state = serde_json::to_value(session.state)?
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        self.conn.execute(
            "
            INSERT INTO conversation_sessions(conversation_id, state, last_activity_ms, session_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(conversation_id) DO UPDATE SET
                state=excluded.state,
                last_activity_ms=excluded.last_activity_ms,
                session_json=excluded.session_json
            ",
            params![
                session.conversation_id,
                state,
                session.last_activity_at.timestamp_millis(),
                json
            ],
        )?;
        Ok(())
    }

    fn remove_session(&mut self, conversation_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM conversation_sessions WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    fn purge_idle_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM conversation_sessions WHERE last_activity_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

/// Per-conversation async locks. At most one event per conversation is in
/// flight; different conversations never contend.
#[derive(Default)]
pub(crate) struct ConversationLocks {
    locks: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl ConversationLocks {
    pub(crate) fn acquire(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(conversation_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(Mutex::new(()));
        locks.insert(conversation_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
