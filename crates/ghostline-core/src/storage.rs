//! Local session store boundary and its implementations
//!
//! The store persists an ordered, deduplicated message log per session
//! plus read marks for unread counts. [`RedbStore`] is the ACID-backed
//! implementation; [`MemoryStore`] backs tests and ephemeral profiles.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::session::Session;
use crate::types::{ChatMessage, SessionId};

const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const READ_MARKS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("read_marks");

/// Persistence boundary for chat sessions.
///
/// `append_message_if_new` is the only log mutation path: it
/// deduplicates by message id and keeps the log sorted by timestamp.
pub trait SessionStore: Send + Sync + 'static {
    /// Load a session by id
    fn load_session(&self, id: &SessionId) -> ChatResult<Option<Session>>;

    /// Persist a session (insert or overwrite)
    fn save_session(&self, session: &Session) -> ChatResult<()>;

    /// Append a message to a session's log if its id is new.
    ///
    /// Returns the updated session, or `None` if the session does not
    /// exist. Appending a duplicate id is a no-op that still returns
    /// the (unchanged) session.
    fn append_message_if_new(
        &self,
        id: &SessionId,
        message: &ChatMessage,
    ) -> ChatResult<Option<Session>>;

    /// All stored sessions, most recently active first
    fn list_sessions(&self) -> ChatResult<Vec<Session>>;

    /// Delete one session and its read mark
    fn delete_session(&self, id: &SessionId) -> ChatResult<()>;

    /// Delete every session and read mark
    fn delete_all(&self) -> ChatResult<()>;

    /// Record that every message in the session has been read
    fn mark_read(&self, id: &SessionId) -> ChatResult<()>;

    /// Number of messages appended since the last `mark_read`
    fn unread_count(&self, id: &SessionId) -> ChatResult<usize>;

    /// Set or clear a session's display label
    fn set_label(&self, id: &SessionId, label: Option<&str>) -> ChatResult<()>;
}

fn sort_by_activity(sessions: &mut [Session]) {
    sessions.sort_by_key(|s| std::cmp::Reverse(s.activity_at()));
}

/// In-memory session store
#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    read_marks: Arc<RwLock<HashMap<SessionId, usize>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load_session(&self, id: &SessionId) -> ChatResult<Option<Session>> {
        Ok(self.sessions.read().get(id).cloned())
    }

    fn save_session(&self, session: &Session) -> ChatResult<()> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn append_message_if_new(
        &self,
        id: &SessionId,
        message: &ChatMessage,
    ) -> ChatResult<Option<Session>> {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return Ok(None);
        };
        session.insert_message(message.clone());
        Ok(Some(session.clone()))
    }

    fn list_sessions(&self) -> ChatResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sort_by_activity(&mut sessions);
        Ok(sessions)
    }

    fn delete_session(&self, id: &SessionId) -> ChatResult<()> {
        self.sessions.write().remove(id);
        self.read_marks.write().remove(id);
        Ok(())
    }

    fn delete_all(&self) -> ChatResult<()> {
        self.sessions.write().clear();
        self.read_marks.write().clear();
        Ok(())
    }

    fn mark_read(&self, id: &SessionId) -> ChatResult<()> {
        let count = self
            .sessions
            .read()
            .get(id)
            .map(|s| s.messages.len())
            .unwrap_or(0);
        self.read_marks.write().insert(id.clone(), count);
        Ok(())
    }

    fn unread_count(&self, id: &SessionId) -> ChatResult<usize> {
        let total = self
            .sessions
            .read()
            .get(id)
            .map(|s| s.messages.len())
            .unwrap_or(0);
        let read = self.read_marks.read().get(id).copied().unwrap_or(0);
        Ok(total.saturating_sub(read))
    }

    fn set_label(&self, id: &SessionId, label: Option<&str>) -> ChatResult<()> {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.label = label.map(str::to_string);
        }
        Ok(())
    }
}

/// Session store backed by redb for ACID-compliant persistence
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl RedbStore {
    /// Create or open a store at the given path.
    ///
    /// Creates the parent directory and all tables if they do not exist.
    pub fn new(path: impl AsRef<Path>) -> ChatResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(READ_MARKS_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %path.display(), "opened session store");
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn encode(session: &Session) -> ChatResult<Vec<u8>> {
        postcard::to_allocvec(session).map_err(|e| ChatError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> ChatResult<Session> {
        postcard::from_bytes(bytes).map_err(|e| ChatError::Serialization(e.to_string()))
    }

    fn write_session(&self, session: &Session) -> ChatResult<()> {
        let bytes = Self::encode(session)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(session.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl SessionStore for RedbStore {
    fn load_session(&self, id: &SessionId) -> ChatResult<Option<Session>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        match table.get(id.as_str())? {
            Some(guard) => Ok(Some(Self::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn save_session(&self, session: &Session) -> ChatResult<()> {
        self.write_session(session)
    }

    fn append_message_if_new(
        &self,
        id: &SessionId,
        message: &ChatMessage,
    ) -> ChatResult<Option<Session>> {
        let Some(mut session) = self.load_session(id)? else {
            return Ok(None);
        };
        if session.insert_message(message.clone()) {
            self.write_session(&session)?;
        }
        Ok(Some(session))
    }

    fn list_sessions(&self) -> ChatResult<Vec<Session>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let mut sessions = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            sessions.push(Self::decode(value.value())?);
        }
        sort_by_activity(&mut sessions);
        Ok(sessions)
    }

    fn delete_session(&self, id: &SessionId) -> ChatResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut sessions = write_txn.open_table(SESSIONS_TABLE)?;
            sessions.remove(id.as_str())?;
            let mut marks = write_txn.open_table(READ_MARKS_TABLE)?;
            marks.remove(id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_all(&self) -> ChatResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            // Recreating the tables is the cheapest full wipe
            write_txn.delete_table(SESSIONS_TABLE)?;
            write_txn.delete_table(READ_MARKS_TABLE)?;
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(READ_MARKS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn mark_read(&self, id: &SessionId) -> ChatResult<()> {
        let count = self
            .load_session(id)?
            .map(|s| s.messages.len() as u64)
            .unwrap_or(0);
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut marks = write_txn.open_table(READ_MARKS_TABLE)?;
            marks.insert(id.as_str(), count)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn unread_count(&self, id: &SessionId) -> ChatResult<usize> {
        let total = self
            .load_session(id)?
            .map(|s| s.messages.len())
            .unwrap_or(0);
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let marks = read_txn.open_table(READ_MARKS_TABLE)?;
        let read = marks.get(id.as_str())?.map(|g| g.value()).unwrap_or(0) as usize;
        Ok(total.saturating_sub(read))
    }

    fn set_label(&self, id: &SessionId, label: Option<&str>) -> ChatResult<()> {
        let Some(mut session) = self.load_session(id)? else {
            return Err(ChatError::SessionNotFound(id.to_string()));
        };
        session.label = label.map(str::to_string);
        self.write_session(&session)
    }
}
