//! Directory boundary: the external publish/resolve key-value network
//!
//! The directory is an opaque collaborator. It stores one small record
//! per keypair (the unacknowledged message buffer, an ack watermark, an
//! optional nickname and an optional call signal) and resolves the
//! latest record published by a peer. It is best-effort: records may be
//! silently dropped, delivered late, or delivered repeatedly; the sync
//! engine is responsible for tolerating all of that.
//!
//! [`MemoryDirectory`] is an in-process implementation used as a test
//! loopback: two engines sharing one `MemoryDirectory` exchange messages
//! exactly as they would over the real network, including record-size
//! trimming.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::types::{now_millis, CompactMessage};

/// Approximate size budget for one directory record, in bytes.
///
/// Publishes that exceed it are trimmed oldest-first; a publish that
/// cannot fit even one message retains zero messages.
pub const MAX_RECORD_BYTES: usize = 1000;

/// One publish request: everything that rides in a single directory record
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    /// The publisher's keypair seed
    pub seed: &'a str,
    /// The full current outgoing buffer
    pub messages: &'a [CompactMessage],
    /// Shared symmetric key reference
    pub enc_key: &'a str,
    /// Highest peer timestamp we acknowledge
    pub ack_timestamp: i64,
    /// Publisher's nickname
    pub nick: Option<&'a str>,
    /// Encoded call signal, if a call is being negotiated
    pub call_signal: Option<&'a str>,
}

/// One decrypted message from a resolved record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryMessage {
    /// Message text
    pub text: String,
    /// Sender-assigned timestamp
    pub timestamp: i64,
    /// Sender's nickname at publish time
    pub nick: Option<String>,
}

/// A resolved directory record, decrypted
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBatch {
    /// Messages currently in the peer's record
    pub messages: Vec<DirectoryMessage>,
    /// Highest timestamp among `messages` (0 when empty)
    pub latest_timestamp: i64,
    /// The peer's ack watermark for our messages
    pub peer_ack: i64,
    /// Raw record names present in the packet
    pub raw_record_names: Vec<String>,
    /// Size of the encrypted payload
    pub encrypted_payload_length: usize,
    /// Timestamp the directory reported for the packet
    pub packet_timestamp: i64,
    /// Number of messages in the record
    pub message_count: usize,
    /// Encoded call signal, if the peer published one
    pub call_signal: Option<String>,
}

/// The publish/resolve boundary with the external directory network
pub trait Directory: Send + Sync + 'static {
    /// Derive the public key for a keypair seed
    fn public_key(&self, seed: &str) -> impl Future<Output = ChatResult<String>> + Send;

    /// Publish a record under the seed's keypair.
    ///
    /// Returns the number of messages actually retained after
    /// size-limit trimming.
    fn publish(&self, req: PublishRequest<'_>) -> impl Future<Output = ChatResult<usize>> + Send;

    /// Resolve the latest record published by `peer_pub_key`.
    ///
    /// `None` means no record exists (yet); errors mean the directory
    /// was unreachable.
    fn resolve(
        &self,
        peer_pub_key: &str,
        enc_key: &str,
    ) -> impl Future<Output = ChatResult<Option<ResolvedBatch>>> + Send;
}

/// The record a [`MemoryDirectory`] stores per public key
#[derive(Debug, Clone, Default)]
struct StoredRecord {
    messages: Vec<CompactMessage>,
    ack: i64,
    nick: Option<String>,
    call_signal: Option<String>,
    packet_timestamp: i64,
}

/// In-process directory used as a loopback for tests and demos.
///
/// Key derivation is a stand-in (a hash of the seed), which is fine
/// because every party in a loopback shares the same instance.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    records: Arc<RwLock<HashMap<String, StoredRecord>>>,
    failing: Arc<RwLock<bool>>,
}

impl MemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish/resolve fail with a transport
    /// error until cleared, to simulate an outage
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write() = failing;
    }

    fn check_reachable(&self) -> ChatResult<()> {
        if *self.failing.read() {
            return Err(ChatError::Transport("directory unreachable".to_string()));
        }
        Ok(())
    }

    fn derive_key(seed: &str) -> String {
        let hash = blake3::hash(seed.as_bytes());
        bs58::encode(&hash.as_bytes()[..16]).into_string()
    }

    fn record_names(record: &StoredRecord) -> Vec<String> {
        let mut names = vec!["_msgs".to_string(), "_ts".to_string(), "_ack".to_string()];
        if record.nick.is_some() {
            names.push("_nick".to_string());
        }
        if record.call_signal.is_some() {
            names.push("_call".to_string());
        }
        names
    }

    fn encoded_len(messages: &[CompactMessage]) -> usize {
        serde_json::to_string(messages).map(|s| s.len()).unwrap_or(0)
    }
}

impl Directory for MemoryDirectory {
    async fn public_key(&self, seed: &str) -> ChatResult<String> {
        Ok(Self::derive_key(seed))
    }

    async fn publish(&self, req: PublishRequest<'_>) -> ChatResult<usize> {
        self.check_reachable()?;

        // Trim oldest-first until the record fits its size budget
        let mut kept: Vec<CompactMessage> = req.messages.to_vec();
        while !kept.is_empty() && Self::encoded_len(&kept) > MAX_RECORD_BYTES {
            kept.remove(0);
        }
        let kept_count = kept.len();

        let key = Self::derive_key(req.seed);
        debug!(key = %key, kept = kept_count, ack = req.ack_timestamp, "memory directory publish");

        self.records.write().insert(
            key,
            StoredRecord {
                messages: kept,
                ack: req.ack_timestamp,
                nick: req.nick.map(str::to_string),
                call_signal: req.call_signal.map(str::to_string),
                packet_timestamp: now_millis(),
            },
        );

        Ok(kept_count)
    }

    async fn resolve(&self, peer_pub_key: &str, _enc_key: &str) -> ChatResult<Option<ResolvedBatch>> {
        self.check_reachable()?;

        let records = self.records.read();
        let Some(record) = records.get(peer_pub_key) else {
            return Ok(None);
        };

        let messages: Vec<DirectoryMessage> = record
            .messages
            .iter()
            .map(|m| DirectoryMessage {
                text: m.m.clone(),
                timestamp: m.t,
                nick: record.nick.clone(),
            })
            .collect();
        let latest_timestamp = messages.iter().map(|m| m.timestamp).max().unwrap_or(0);

        Ok(Some(ResolvedBatch {
            latest_timestamp,
            peer_ack: record.ack,
            raw_record_names: Self::record_names(record),
            encrypted_payload_length: Self::encoded_len(&record.messages),
            packet_timestamp: record.packet_timestamp,
            message_count: messages.len(),
            call_signal: record.call_signal.clone(),
            messages,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact(t: i64, m: &str) -> CompactMessage {
        CompactMessage { t, m: m.to_string() }
    }

    #[tokio::test]
    async fn test_publish_then_resolve() {
        let dir = MemoryDirectory::new();
        let msgs = vec![compact(10, "a"), compact(20, "b")];

        let kept = dir
            .publish(PublishRequest {
                seed: "seed-a",
                messages: &msgs,
                enc_key: "k",
                ack_timestamp: 5,
                nick: Some("Wisp"),
                call_signal: None,
            })
            .await
            .unwrap();
        assert_eq!(kept, 2);

        let key = dir.public_key("seed-a").await.unwrap();
        let batch = dir.resolve(&key, "k").await.unwrap().unwrap();
        assert_eq!(batch.latest_timestamp, 20);
        assert_eq!(batch.peer_ack, 5);
        assert_eq!(batch.message_count, 2);
        assert_eq!(batch.messages[0].text, "a");
        assert_eq!(batch.messages[0].nick.as_deref(), Some("Wisp"));
        assert!(batch.raw_record_names.contains(&"_nick".to_string()));
        assert!(batch.call_signal.is_none());
    }

    #[tokio::test]
    async fn test_resolve_unknown_key_is_none() {
        let dir = MemoryDirectory::new();
        assert!(dir.resolve("nobody", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_trims_oldest_first() {
        let dir = MemoryDirectory::new();
        let big = "x".repeat(400);
        let msgs = vec![compact(1, &big), compact(2, &big), compact(3, &big)];

        let kept = dir
            .publish(PublishRequest {
                seed: "seed-a",
                messages: &msgs,
                enc_key: "k",
                ack_timestamp: 0,
                nick: None,
                call_signal: None,
            })
            .await
            .unwrap();
        assert_eq!(kept, 2);

        let key = dir.public_key("seed-a").await.unwrap();
        let batch = dir.resolve(&key, "k").await.unwrap().unwrap();
        // The oldest entry was dropped
        assert_eq!(batch.messages[0].timestamp, 2);
    }

    #[tokio::test]
    async fn test_oversized_publish_keeps_zero() {
        let dir = MemoryDirectory::new();
        let huge = "x".repeat(2000);
        let msgs = vec![compact(1, &huge)];

        let kept = dir
            .publish(PublishRequest {
                seed: "seed-a",
                messages: &msgs,
                enc_key: "k",
                ack_timestamp: 0,
                nick: None,
                call_signal: None,
            })
            .await
            .unwrap();
        assert_eq!(kept, 0);
    }

    #[tokio::test]
    async fn test_failing_directory_errors() {
        let dir = MemoryDirectory::new();
        dir.set_failing(true);
        assert!(dir.resolve("any", "k").await.is_err());

        dir.set_failing(false);
        assert!(dir.resolve("any", "k").await.is_ok());
    }
}
