//! Core types for the ghostline chat core

use serde::{Deserialize, Serialize};

/// Exact text of the join announcement published by the joining party.
///
/// Inbound messages matching this text exactly are classified as join
/// events rather than ordinary peer messages.
pub const JOIN_TEXT: &str = "👋 joined";

/// Unique identifier for a chat session
///
/// Derived deterministically from the local seed prefix and the peer's
/// public-key prefix, so both restarts and re-navigations land on the
/// same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Length of the prefix taken from each key material input
    const PREFIX_LEN: usize = 8;

    /// Derive a session id from the local seed and the peer's public key.
    ///
    /// Pure and deterministic: the same two inputs always yield the same id.
    pub fn derive(my_seed: &str, peer_pub_key: &str) -> Self {
        let seed_prefix: String = my_seed.chars().take(Self::PREFIX_LEN).collect();
        let peer_prefix: String = peer_pub_key.chars().take(Self::PREFIX_LEN).collect();
        let hash = blake3::hash(format!("{}{}", seed_prefix, peer_prefix).as_bytes());
        Self(bs58::encode(&hash.as_bytes()[..8]).into_string())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who authored a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// Authored locally
    Me,
    /// Authored by the remote peer
    Peer,
    /// Synthetic entry (join announcements, call log events)
    System,
}

/// Directory-level diagnostics attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Directory key the payload was published under / resolved from
    pub directory_key: String,
    /// Size of the encrypted payload the message arrived in
    pub encrypted_payload_length: usize,
    /// Raw record names present in the resolved packet
    pub record_names: Vec<String>,
    /// Timestamp the directory reported for the packet itself
    pub packet_timestamp: Option<i64>,
}

/// A system-originated event carried inside a chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    /// A party joined the session
    Join {
        /// Public key of the joining party
        pub_key: String,
    },
}

/// Kind of call log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventKind {
    /// Local party started a call
    Started,
    /// An inbound offer was observed
    Received,
    /// The transport reported a connection
    Connected,
    /// A connected call ended
    Ended,
    /// The remote party hung up before the call was accepted
    Missed,
    /// Local party rejected an inbound offer
    Rejected,
}

/// A call log entry recorded as a system chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    /// What happened
    pub kind: CallEventKind,
    /// Whether video was involved
    pub has_video: bool,
    /// Call duration in milliseconds (set on `Ended`)
    pub duration_ms: Option<i64>,
}

/// A single chat message in a session log.
///
/// The `id` is the dedup key within a session; the `timestamp` is the
/// ordering and acknowledgment key. Locally authored ids are `me_<ts>`,
/// remote ids `peer_<ts>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier within the session
    pub id: String,
    /// Message text
    pub text: String,
    /// Who authored the message
    pub sender: Sender,
    /// Unix timestamp in milliseconds; the ordering and ack key
    pub timestamp: i64,
    /// Nickname the author advertised with this message
    #[serde(default)]
    pub nick: Option<String>,
    /// Directory diagnostics
    #[serde(default)]
    pub meta: Option<MessageMeta>,
    /// System event payload, if this is a system message
    #[serde(default)]
    pub system_event: Option<SystemEvent>,
    /// Call log payload, if this is a call event entry
    #[serde(default)]
    pub call_event: Option<CallEvent>,
}

impl ChatMessage {
    /// Create a locally authored message
    pub fn local(timestamp: i64, text: impl Into<String>, nick: Option<String>) -> Self {
        Self {
            id: format!("me_{}", timestamp),
            text: text.into(),
            sender: Sender::Me,
            timestamp,
            nick,
            meta: None,
            system_event: None,
            call_event: None,
        }
    }

    /// Create a message from a resolved remote entry.
    ///
    /// Messages whose text matches the join announcement are classified
    /// as system join events carrying the peer's public key.
    pub fn remote(
        timestamp: i64,
        text: impl Into<String>,
        nick: Option<String>,
        peer_pub_key: &str,
        meta: Option<MessageMeta>,
    ) -> Self {
        let text = text.into();
        let is_join = text == JOIN_TEXT;
        Self {
            id: format!("peer_{}", timestamp),
            sender: if is_join { Sender::System } else { Sender::Peer },
            system_event: is_join.then(|| SystemEvent::Join {
                pub_key: peer_pub_key.to_string(),
            }),
            text,
            timestamp,
            nick,
            meta,
            call_event: None,
        }
    }

    /// Create a local system message carrying a call log event
    pub fn call_event(timestamp: i64, text: impl Into<String>, event: CallEvent) -> Self {
        Self {
            id: format!("me_{}", timestamp),
            text: text.into(),
            sender: Sender::System,
            timestamp,
            nick: None,
            meta: None,
            system_event: None,
            call_event: Some(event),
        }
    }

    /// Whether this message originated from the remote peer
    /// (ordinary peer messages and remote join announcements alike)
    pub fn is_peer_originated(&self) -> bool {
        self.id.starts_with("peer_")
    }
}

/// Connection status surfaced to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Session is initializing
    Connecting,
    /// Last directory operation succeeded
    Online,
    /// Session has been burned
    Offline,
    /// Last directory operation failed; retried next cycle
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// An unacknowledged outgoing message as published to the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactMessage {
    /// Send timestamp (the ack key)
    pub t: i64,
    /// Message text
    pub m: String,
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
