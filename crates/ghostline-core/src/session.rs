//! Session entity: one two-party chat relationship
//!
//! A session holds the ordered, deduplicated message log plus the
//! persisted flags the sync engine needs to be restart-safe
//! (`join_announced`, `welcome_sent`, `created_by_me`). All state is
//! self-contained on the entity; nothing lives in ad-hoc side lookups.

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, ChatMessage, SessionId};

/// A persisted chat session with one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Deterministic session id (see [`SessionId::derive`])
    pub id: SessionId,
    /// Local keypair seed (opaque string, owned by the crypto layer)
    pub my_seed: String,
    /// Peer's public key (the directory key we resolve)
    pub peer_pub_key: String,
    /// Shared symmetric key reference (opaque string)
    pub enc_key: String,
    /// Ordered, deduplicated message log
    pub messages: Vec<ChatMessage>,
    /// Creation time, unix millis
    pub created_at: i64,
    /// Last time a sync touched this session
    #[serde(default)]
    pub last_sync_at: Option<i64>,
    /// Peer's last advertised nickname
    #[serde(default)]
    pub nick: Option<String>,
    /// User-assigned display label
    #[serde(default)]
    pub label: Option<String>,
    /// Whether this party created the session (vs joined via invite)
    #[serde(default)]
    pub created_by_me: bool,
    /// Whether the one-time join announcement has been sent
    #[serde(default)]
    pub join_announced: bool,
    /// Whether the creator's one-time welcome has been sent
    #[serde(default)]
    pub welcome_sent: bool,
}

impl Session {
    /// Create a fresh session
    pub fn new(
        id: SessionId,
        my_seed: impl Into<String>,
        peer_pub_key: impl Into<String>,
        enc_key: impl Into<String>,
        created_by_me: bool,
    ) -> Self {
        Self {
            id,
            my_seed: my_seed.into(),
            peer_pub_key: peer_pub_key.into(),
            enc_key: enc_key.into(),
            messages: Vec::new(),
            created_at: now_millis(),
            last_sync_at: None,
            nick: None,
            label: None,
            created_by_me,
            // The creator never announces a join
            join_announced: created_by_me,
            welcome_sent: false,
        }
    }

    /// Insert a message, deduplicating by id and keeping the log sorted
    /// by timestamp.
    ///
    /// Returns `false` if a message with the same id already exists
    /// (the log is unchanged). Captures the peer's nickname from
    /// peer-originated messages that carry one.
    pub fn insert_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }

        if message.is_peer_originated() {
            if let Some(ref nick) = message.nick {
                self.nick = Some(nick.clone());
            }
        }

        self.messages.push(message);
        // Stable sort keeps insertion order for equal timestamps
        self.messages.sort_by_key(|m| m.timestamp);
        self.last_sync_at = Some(now_millis());
        true
    }

    /// Highest timestamp among peer-originated messages in the log.
    ///
    /// Seeds `last_seen_timestamp` and `my_ack` when a session is reloaded.
    pub fn max_peer_timestamp(&self) -> i64 {
        self.messages
            .iter()
            .filter(|m| m.is_peer_originated())
            .map(|m| m.timestamp)
            .max()
            .unwrap_or(0)
    }

    /// Display name for the peer: label, then nickname, then key prefix
    pub fn display_name(&self) -> String {
        if let Some(ref label) = self.label {
            return label.clone();
        }
        if let Some(ref nick) = self.nick {
            return nick.clone();
        }
        let prefix: String = self.peer_pub_key.chars().take(12).collect();
        format!("{}...", prefix)
    }

    /// Sort key for session lists: most recently synced first
    pub fn activity_at(&self) -> i64 {
        self.last_sync_at.unwrap_or(self.created_at)
    }
}
