//! Background Poller
//!
//! Sweeps every stored session on a slow cadence so messages keep
//! arriving for sessions that are not open. The active session is
//! skipped; its own [`SessionSync`](crate::engine::SessionSync) loop
//! polls faster and also publishes acks, which the background sweep
//! deliberately does not do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::storage::SessionStore;
use crate::types::{ChatMessage, MessageMeta, SessionId};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Background sweep cadence
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay before the first sweep, kept short so a freshly opened
    /// app shows new messages quickly
    pub initial_delay: Duration,
    /// Interval between sweeps
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_500),
            interval: Duration::from_secs(20),
        }
    }
}

/// Notifications emitted by the poller
#[derive(Debug, Clone)]
pub enum PollerEvent {
    /// A sweep began
    SyncStarted,
    /// A sweep finished
    SyncFinished,
    /// The first sweep after startup completed
    InitialSyncComplete,
    /// A background session received new messages
    SessionUpdated {
        session_id: SessionId,
        new_messages: usize,
    },
}

struct PollerShared<D, S> {
    directory: Arc<D>,
    store: Arc<S>,
    config: PollerConfig,
    /// Session currently owned by a foreground sync engine
    active: Mutex<Option<SessionId>>,
    /// Highest peer timestamp already incorporated, per session.
    /// Seeded lazily from the stored log so a restart does not re-append
    /// old messages.
    last_seen: Mutex<HashMap<SessionId, i64>>,
    event_tx: broadcast::Sender<PollerEvent>,
    cancel: CancellationToken,
}

/// Handle to the background sweep task
pub struct BackgroundPoller<D, S> {
    shared: Arc<PollerShared<D, S>>,
}

impl<D, S> Clone for BackgroundPoller<D, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Directory, S: SessionStore> BackgroundPoller<D, S> {
    /// Start the sweep task
    pub fn start(directory: Arc<D>, store: Arc<S>, config: PollerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let poller = Self {
            shared: Arc::new(PollerShared {
                directory,
                store,
                config,
                active: Mutex::new(None),
                last_seen: Mutex::new(HashMap::new()),
                event_tx,
                cancel: CancellationToken::new(),
            }),
        };

        let runner = poller.clone();
        tokio::spawn(async move { runner.run().await });
        poller
    }

    /// Subscribe to poller events
    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Mark a session as foreground-owned; the sweep skips it
    pub fn set_active_session(&self, id: Option<SessionId>) {
        *self.shared.active.lock() = id;
    }

    /// Stop the sweep task
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    async fn run(self) {
        tokio::select! {
            _ = self.shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.shared.config.initial_delay) => {}
        }

        let mut first_round = true;
        loop {
            self.sweep().await;
            if first_round {
                first_round = false;
                let _ = self.shared.event_tx.send(PollerEvent::InitialSyncComplete);
                info!("initial background sync complete");
            }
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.shared.config.interval) => {}
            }
        }
        debug!("background poller stopped");
    }

    async fn sweep(&self) {
        let _ = self.shared.event_tx.send(PollerEvent::SyncStarted);

        let sessions = match self.shared.store.list_sessions() {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(%err, "failed to list sessions for background sweep");
                let _ = self.shared.event_tx.send(PollerEvent::SyncFinished);
                return;
            }
        };
        let active = self.shared.active.lock().clone();

        for session in sessions {
            if self.shared.cancel.is_cancelled() {
                break;
            }
            if active.as_ref() == Some(&session.id) {
                continue;
            }
            self.poll_session(&session.id, &session.peer_pub_key, &session.enc_key, session.max_peer_timestamp())
                .await;
        }

        let _ = self.shared.event_tx.send(PollerEvent::SyncFinished);
    }

    async fn poll_session(
        &self,
        id: &SessionId,
        peer_pub_key: &str,
        enc_key: &str,
        stored_max: i64,
    ) {
        let last_seen = {
            let mut map = self.shared.last_seen.lock();
            *map.entry(id.clone()).or_insert(stored_max)
        };

        let batch = match self.shared.directory.resolve(peer_pub_key, enc_key).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(err) => {
                debug!(session = %id, %err, "background poll failed");
                return;
            }
        };
        if batch.latest_timestamp <= last_seen {
            return;
        }

        let meta = MessageMeta {
            directory_key: peer_pub_key.to_string(),
            encrypted_payload_length: batch.encrypted_payload_length,
            record_names: batch.raw_record_names.clone(),
            packet_timestamp: Some(batch.packet_timestamp),
        };
        let mut appended = 0;
        for resolved in &batch.messages {
            if resolved.timestamp <= last_seen {
                continue;
            }
            let msg = ChatMessage::remote(
                resolved.timestamp,
                resolved.text.clone(),
                resolved.nick.clone(),
                peer_pub_key,
                Some(meta.clone()),
            );
            match self.shared.store.append_message_if_new(id, &msg) {
                Ok(Some(_)) => appended += 1,
                Ok(None) => {
                    // Session deleted mid-sweep
                    return;
                }
                Err(err) => {
                    warn!(session = %id, %err, "failed to persist background message");
                }
            }
        }

        self.shared
            .last_seen
            .lock()
            .insert(id.clone(), batch.latest_timestamp);

        if appended > 0 {
            debug!(session = %id, appended, "background messages received");
            let _ = self.shared.event_tx.send(PollerEvent::SessionUpdated {
                session_id: id.clone(),
                new_messages: appended,
            });
        }
    }
}
