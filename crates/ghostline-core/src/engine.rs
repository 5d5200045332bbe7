//! Session Synchronization Engine
//!
//! Keeps one session's message log and acknowledgment state consistent
//! over the poll-only directory channel. One [`SessionSync`] per active
//! session; each owns two cooperative tasks (poll loop, republish loop)
//! that hold a shared [`CancellationToken`], so teardown cancels every
//! timer at once and a slow in-flight resolve can never mutate state
//! after the session is gone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionSync                                                    │
//! │  ├── poll loop: resolve → apply batch → ack publish             │
//! │  │   cadence: fast (1s) / active (2s) / idle (8s), recomputed   │
//! │  │   after every poll; a completed send supersedes the pending  │
//! │  │   sleep via Notify                                           │
//! │  ├── republish loop: re-publishes buffer+ack every 30 min to    │
//! │  │   keep the directory record alive                            │
//! │  └── event_tx: broadcast::Sender<SyncEvent> for UI updates      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Directory failures never escape to callers: background failures
//! downgrade the session status, and only explicit actions (sending)
//! surface errors.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::{Directory, PublishRequest, ResolvedBatch};
use crate::error::{ChatError, ChatResult};
use crate::session::Session;
use crate::storage::SessionStore;
use crate::types::{
    now_millis, CallEvent, CallEventKind, ChatMessage, CompactMessage, ConnectionStatus,
    MessageMeta, Sender, SessionId, SystemEvent, JOIN_TEXT,
};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Timing and size configuration for one session's sync
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Poll interval while the session is active
    pub active_interval: Duration,
    /// Poll interval once the session has been idle past the threshold
    pub idle_interval: Duration,
    /// Poll interval while a call-signaling fast-poll override is on
    pub fast_interval: Duration,
    /// How long without activity before the idle interval applies
    pub idle_threshold: Duration,
    /// How often the record is re-published to keep it alive
    pub republish_interval: Duration,
    /// Per-message text ceiling, in encoded bytes
    pub max_text_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(2),
            idle_interval: Duration::from_secs(8),
            fast_interval: Duration::from_secs(1),
            idle_threshold: Duration::from_secs(60),
            republish_interval: Duration::from_secs(30 * 60),
            max_text_bytes: 500,
        }
    }
}

/// Parameters identifying one session
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Local keypair seed
    pub seed: String,
    /// Peer's public key
    pub peer_pub_key: String,
    /// Shared symmetric key reference
    pub enc_key: String,
    /// Whether this party created the session (vs joined via invite).
    /// Only consulted when the session does not exist yet.
    pub created_by_me: bool,
}

/// Notifications emitted by a [`SessionSync`]
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The session log changed (new local or remote messages)
    MessagesUpdated,
    /// The connection status changed
    StatusChanged(ConnectionStatus),
    /// The peer acknowledged our messages up to this timestamp
    PeerAckAdvanced(i64),
    /// The peer published a call signal (raw wire string)
    CallSignalReceived(String),
    /// The session was burned
    Burned,
}

/// Diagnostics snapshot for the tech panel
#[derive(Debug, Clone)]
pub struct TechInfo {
    /// Session id
    pub session_id: SessionId,
    /// Our directory key
    pub my_pub_key: String,
    /// The peer's directory key
    pub peer_pub_key: String,
    /// Polls completed so far
    pub poll_count: u64,
    /// Poll interval currently in effect
    pub current_interval: Duration,
    /// Republish cadence
    pub republish_interval: Duration,
    /// Highest peer timestamp we acknowledge
    pub my_ack: i64,
    /// Highest of our timestamps the peer confirmed
    pub peer_ack: i64,
    /// Unacknowledged outgoing messages
    pub outgoing_len: usize,
}

/// Mutable per-session sync state.
///
/// Mutated only under the state mutex by the engine's own operations;
/// the poll loop is a single task, so at most one poll is ever in
/// flight per session.
#[derive(Debug)]
pub(crate) struct SyncState {
    /// Highest peer timestamp incorporated into the log
    pub last_seen_timestamp: i64,
    /// Highest peer timestamp we will advertise as acknowledged
    pub my_ack: i64,
    /// Highest of our timestamps the peer has confirmed
    pub peer_ack: i64,
    /// Unacknowledged outgoing messages; the only source of truth for
    /// what gets republished
    pub outgoing: Vec<CompactMessage>,
    /// Last local send or remote arrival, unix millis
    pub last_activity: i64,
    /// Highest locally assigned timestamp, for monotonic message ids
    pub last_local_ts: i64,
    /// Call-signaling fast-poll override
    pub fast_poll: bool,
    /// Irreversible stop flag
    pub burned: bool,
    /// Status surfaced to the UI
    pub status: ConnectionStatus,
    /// Completed polls
    pub poll_count: u64,
    /// Last successful sync, unix millis
    pub last_sync: Option<i64>,
    /// Our advertised nickname
    pub nick: Option<String>,
    /// Outgoing call signal riding in our record
    pub call_signal_out: Option<String>,
}

impl SyncState {
    fn new(seed_ack: i64) -> Self {
        Self {
            last_seen_timestamp: seed_ack,
            my_ack: seed_ack,
            peer_ack: 0,
            outgoing: Vec::new(),
            last_activity: now_millis(),
            last_local_ts: 0,
            fast_poll: false,
            burned: false,
            status: ConnectionStatus::Connecting,
            poll_count: 0,
            last_sync: None,
            nick: None,
            call_signal_out: None,
        }
    }

    /// Allocate a strictly monotonic local timestamp, so same-millisecond
    /// sends never collide on message id or ack key
    fn next_local_timestamp(&mut self) -> i64 {
        let ts = now_millis().max(self.last_local_ts + 1);
        self.last_local_ts = ts;
        ts
    }
}

/// Result of applying one resolved batch to the sync state
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    /// Whether any new remote data was incorporated
    pub received_new: bool,
    /// Remote messages to append to the log, in timestamp order
    pub new_messages: Vec<ChatMessage>,
    /// Whether a join announcement was among the new messages
    pub join_seen: bool,
    /// Whether the peer's ack advanced (buffer was pruned)
    pub ack_advanced: bool,
    /// Call signal carried in the batch
    pub call_signal: Option<String>,
}

/// Apply one resolved batch: prune the outgoing buffer by the peer's
/// ack, then incorporate messages newer than `last_seen_timestamp`.
///
/// Pure with respect to I/O; idempotent for a repeated batch (the
/// second application is a no-op on log and ack state).
pub(crate) fn apply_batch(
    state: &mut SyncState,
    peer_pub_key: &str,
    batch: &ResolvedBatch,
) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        call_signal: batch.call_signal.clone(),
        ..Default::default()
    };

    if batch.peer_ack > 0 {
        let before = state.outgoing.len();
        state.outgoing.retain(|m| m.t > batch.peer_ack);
        if state.outgoing.len() != before {
            debug!(
                before,
                after = state.outgoing.len(),
                peer_ack = batch.peer_ack,
                "peer acked, buffer pruned"
            );
        }
        if batch.peer_ack > state.peer_ack {
            state.peer_ack = batch.peer_ack;
            outcome.ack_advanced = true;
        }
    }

    if batch.latest_timestamp > 0 && batch.latest_timestamp > state.last_seen_timestamp {
        let meta = MessageMeta {
            directory_key: peer_pub_key.to_string(),
            encrypted_payload_length: batch.encrypted_payload_length,
            record_names: batch.raw_record_names.clone(),
            packet_timestamp: Some(batch.packet_timestamp),
        };
        for resolved in &batch.messages {
            if resolved.timestamp <= state.last_seen_timestamp {
                continue;
            }
            let msg = ChatMessage::remote(
                resolved.timestamp,
                resolved.text.clone(),
                resolved.nick.clone(),
                peer_pub_key,
                Some(meta.clone()),
            );
            if msg.text == JOIN_TEXT {
                outcome.join_seen = true;
            }
            outcome.new_messages.push(msg);
        }
        state.last_seen_timestamp = batch.latest_timestamp;
        state.my_ack = batch.latest_timestamp;
        state.last_activity = now_millis();
        outcome.received_new = true;
    }

    outcome
}

struct SyncShared<D, S> {
    session_id: SessionId,
    seed: String,
    peer_pub_key: String,
    enc_key: String,
    my_pub_key: String,
    directory: Arc<D>,
    store: Arc<S>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    event_tx: broadcast::Sender<SyncEvent>,
    poll_now: Notify,
    cancel: CancellationToken,
}

/// Handle to one session's synchronization engine.
///
/// Cheap to clone; dropping the last handle does not stop the engine.
/// Call [`SessionSync::shutdown`] (teardown) or [`SessionSync::burn`]
/// (irreversible stop).
pub struct SessionSync<D, S> {
    shared: Arc<SyncShared<D, S>>,
}

impl<D, S> Clone for SessionSync<D, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Directory, S: SessionStore> SessionSync<D, S> {
    /// Initialize a session and start its poll and republish loops.
    ///
    /// Loads or creates the session, seeds the ack state from the
    /// persisted log, publishes the restored ack if any, sends the
    /// one-time join announcement when this party is the joiner, then
    /// spawns the background tasks.
    pub async fn start(
        directory: Arc<D>,
        store: Arc<S>,
        params: SessionParams,
        config: SyncConfig,
    ) -> ChatResult<Self> {
        let my_pub_key = directory.public_key(&params.seed).await?;
        let session_id = SessionId::derive(&params.seed, &params.peer_pub_key);

        let session = match store.load_session(&session_id)? {
            Some(existing) => existing,
            None => {
                let fresh = Session::new(
                    session_id.clone(),
                    &params.seed,
                    &params.peer_pub_key,
                    &params.enc_key,
                    params.created_by_me,
                );
                store.save_session(&fresh)?;
                fresh
            }
        };

        let seed_ack = session.max_peer_timestamp();
        info!(
            session = %session_id,
            seed_ack,
            creator = session.created_by_me,
            "session sync initializing"
        );

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(SyncShared {
            session_id,
            seed: params.seed,
            peer_pub_key: params.peer_pub_key,
            enc_key: params.enc_key,
            my_pub_key,
            directory,
            store,
            config,
            state: Mutex::new(SyncState::new(seed_ack)),
            event_tx,
            poll_now: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let sync = Self { shared };

        // Restore the ack watermark in our record before the first poll
        if seed_ack > 0 {
            if let Err(err) = sync.do_publish().await {
                warn!(session = %sync.shared.session_id, %err, "initial publish failed");
            }
        }

        if !session.join_announced {
            sync.announce_join().await;
        }

        sync.set_status(ConnectionStatus::Online);

        let poll_shared = sync.clone();
        tokio::spawn(async move { poll_shared.poll_loop().await });
        let repub_shared = sync.clone();
        tokio::spawn(async move { repub_shared.republish_loop().await });

        Ok(sync)
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.event_tx.subscribe()
    }

    /// This session's id
    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    /// Our directory key
    pub fn my_public_key(&self) -> &str {
        &self.shared.my_pub_key
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().status
    }

    /// Whether the session has been burned
    pub fn is_burned(&self) -> bool {
        self.shared.state.lock().burned
    }

    /// Current message log, loaded from the store
    pub fn messages(&self) -> ChatResult<Vec<ChatMessage>> {
        Ok(self
            .shared
            .store
            .load_session(&self.shared.session_id)?
            .map(|s| s.messages)
            .unwrap_or_default())
    }

    /// Diagnostics snapshot
    pub fn tech_info(&self) -> TechInfo {
        let state = self.shared.state.lock();
        TechInfo {
            session_id: self.shared.session_id.clone(),
            my_pub_key: self.shared.my_pub_key.clone(),
            peer_pub_key: self.shared.peer_pub_key.clone(),
            poll_count: state.poll_count,
            current_interval: Self::interval_for(&self.shared.config, &state),
            republish_interval: self.shared.config.republish_interval,
            my_ack: state.my_ack,
            peer_ack: state.peer_ack,
            outgoing_len: state.outgoing.len(),
        }
    }

    /// Set the nickname advertised with our publishes
    pub fn set_nick(&self, nick: Option<String>) {
        self.shared.state.lock().nick = nick.filter(|n| !n.is_empty());
    }

    /// Toggle the call-signaling fast-poll override.
    ///
    /// Enabling it supersedes the pending scheduled poll so the faster
    /// cadence takes effect immediately.
    pub fn set_fast_poll(&self, fast: bool) {
        self.shared.state.lock().fast_poll = fast;
        if fast {
            self.shared.poll_now.notify_one();
        }
    }

    /// Poll immediately instead of waiting for the scheduled cycle
    pub fn force_refresh(&self) {
        self.shared.poll_now.notify_one();
    }

    /// Send a chat message.
    ///
    /// Rejects burned sessions and over-ceiling texts without mutating
    /// the log or buffer. On success the message is appended to the
    /// log, buffered until the peer acks it, published, and one
    /// immediate poll is triggered to pick up the peer's response.
    pub async fn send(&self, text: &str) -> ChatResult<()> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        let (ts, nick, has_call_signal) = {
            let mut state = self.shared.state.lock();
            // The irreversible stop wins over the size ceiling
            if state.burned {
                return Err(ChatError::Burned);
            }
            let byte_len = trimmed.len();
            if byte_len > self.shared.config.max_text_bytes {
                return Err(ChatError::PayloadTooLarge {
                    len: byte_len,
                    max: self.shared.config.max_text_bytes,
                });
            }
            state.last_activity = now_millis();
            let ts = state.next_local_timestamp();
            state.outgoing.push(CompactMessage {
                t: ts,
                m: trimmed.to_string(),
            });
            (ts, state.nick.clone(), state.call_signal_out.is_some())
        };

        let mut msg = ChatMessage::local(ts, trimmed, nick.clone());
        msg.meta = Some(self.local_meta(ts, nick.is_some(), has_call_signal));
        if let Err(err) = self.shared.store.append_message_if_new(&self.shared.session_id, &msg) {
            warn!(session = %self.shared.session_id, %err, "failed to persist outgoing message");
        }
        self.emit(SyncEvent::MessagesUpdated);

        match self.do_publish().await {
            Ok(0) => Err(ChatError::RecordLimitExceeded),
            Ok(kept) => {
                debug!(session = %self.shared.session_id, ts, kept, "message published");
                // Supersede the pending scheduled poll to fetch the
                // peer's response without waiting
                self.shared.poll_now.notify_one();
                Ok(())
            }
            Err(err) => {
                warn!(session = %self.shared.session_id, %err, "publish failed");
                self.set_status(ConnectionStatus::Error);
                Err(ChatError::Transport(
                    "Failed to send message. Check your connection.".to_string(),
                ))
            }
        }
    }

    /// Publish (or clear) the outgoing call signal and poll immediately.
    ///
    /// Publish failures are downgraded to the status flag; signaling
    /// retries ride the next poll cycle.
    pub async fn set_call_signal(&self, signal: Option<String>) {
        {
            let mut state = self.shared.state.lock();
            if state.burned {
                return;
            }
            state.call_signal_out = signal;
            state.last_activity = now_millis();
        }
        if let Err(err) = self.do_publish().await {
            warn!(session = %self.shared.session_id, %err, "call signal publish failed");
            self.set_status(ConnectionStatus::Error);
        }
        self.shared.poll_now.notify_one();
    }

    /// Record a call log event as a system chat entry
    pub fn add_call_event(&self, event: CallEvent) {
        let ts = self.shared.state.lock().next_local_timestamp();
        let msg = ChatMessage::call_event(ts, call_event_text(&event), event);
        if let Err(err) = self.shared.store.append_message_if_new(&self.shared.session_id, &msg) {
            warn!(session = %self.shared.session_id, %err, "failed to persist call event");
        }
        self.emit(SyncEvent::MessagesUpdated);
    }

    /// Irreversibly stop all polling and publishing for this session.
    ///
    /// Persisted history is untouched; deleting it is the store
    /// owner's call.
    pub fn burn(&self) {
        {
            let mut state = self.shared.state.lock();
            state.burned = true;
            state.status = ConnectionStatus::Offline;
        }
        self.shared.cancel.cancel();
        info!(session = %self.shared.session_id, "session burned");
        self.emit(SyncEvent::StatusChanged(ConnectionStatus::Offline));
        self.emit(SyncEvent::Burned);
    }

    /// Tear down the engine's background tasks without burning.
    ///
    /// Used when navigating away; a later `start` resumes the session.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut state = self.shared.state.lock();
            let changed = state.status != status;
            state.status = status;
            changed
        };
        if changed {
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    fn local_meta(&self, ts: i64, has_nick: bool, has_call_signal: bool) -> MessageMeta {
        let mut record_names = vec!["_msgs".to_string(), "_ts".to_string(), "_ack".to_string()];
        if has_nick {
            record_names.push("_nick".to_string());
        }
        if has_call_signal {
            record_names.push("_call".to_string());
        }
        MessageMeta {
            directory_key: self.shared.my_pub_key.clone(),
            encrypted_payload_length: 0,
            record_names,
            packet_timestamp: Some(ts),
        }
    }

    fn interval_for(config: &SyncConfig, state: &SyncState) -> Duration {
        if state.fast_poll {
            config.fast_interval
        } else if now_millis() - state.last_activity > config.idle_threshold.as_millis() as i64 {
            config.idle_interval
        } else {
            config.active_interval
        }
    }

    async fn do_publish(&self) -> ChatResult<usize> {
        let (outgoing, ack, nick, call_signal) = {
            let state = self.shared.state.lock();
            (
                state.outgoing.clone(),
                state.my_ack,
                state.nick.clone(),
                state.call_signal_out.clone(),
            )
        };
        self.shared
            .directory
            .publish(PublishRequest {
                seed: &self.shared.seed,
                messages: &outgoing,
                enc_key: &self.shared.enc_key,
                ack_timestamp: ack,
                nick: nick.as_deref(),
                call_signal: call_signal.as_deref(),
            })
            .await
    }

    /// Send the one-time join announcement (joiner side).
    ///
    /// The `join_announced` flag persists before the publish attempt so
    /// a flaky first publish never turns into a second announcement;
    /// the message stays in the outgoing buffer and rides the next
    /// publish anyway.
    async fn announce_join(&self) {
        let ts = {
            let mut state = self.shared.state.lock();
            let ts = state.next_local_timestamp();
            state.outgoing.push(CompactMessage {
                t: ts,
                m: JOIN_TEXT.to_string(),
            });
            ts
        };

        let nick = self.shared.state.lock().nick.clone();
        let msg = ChatMessage {
            id: format!("me_{}", ts),
            text: JOIN_TEXT.to_string(),
            sender: Sender::System,
            timestamp: ts,
            nick,
            meta: None,
            system_event: Some(SystemEvent::Join {
                pub_key: self.shared.my_pub_key.clone(),
            }),
            call_event: None,
        };

        let persisted = (|| -> ChatResult<()> {
            self.shared
                .store
                .append_message_if_new(&self.shared.session_id, &msg)?;
            let mut session = self
                .shared
                .store
                .load_session(&self.shared.session_id)?
                .ok_or_else(|| ChatError::SessionNotFound(self.shared.session_id.to_string()))?;
            session.join_announced = true;
            self.shared.store.save_session(&session)
        })();
        if let Err(err) = persisted {
            warn!(session = %self.shared.session_id, %err, "failed to persist join announcement");
        }
        self.emit(SyncEvent::MessagesUpdated);

        match self.do_publish().await {
            Ok(_) => info!(session = %self.shared.session_id, "join announcement sent"),
            Err(err) => {
                warn!(session = %self.shared.session_id, %err, "failed to send join announcement")
            }
        }
    }

    /// Creator side: answer the first observed join with one welcome
    /// message carrying our nickname.
    async fn maybe_send_welcome(&self) {
        let session = match self.shared.store.load_session(&self.shared.session_id) {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(err) => {
                warn!(session = %self.shared.session_id, %err, "failed to load session for welcome");
                return;
            }
        };
        if !session.created_by_me || session.welcome_sent {
            return;
        }

        let (ts, nick) = {
            let mut state = self.shared.state.lock();
            let ts = state.next_local_timestamp();
            (ts, state.nick.clone())
        };
        let text = match &nick {
            Some(nick) => format!("👋 welcome! I'm {}", nick),
            None => "👋 welcome".to_string(),
        };

        {
            let mut state = self.shared.state.lock();
            state.outgoing.push(CompactMessage {
                t: ts,
                m: text.clone(),
            });
        }

        let msg = ChatMessage::local(ts, text, nick);
        let persisted = (|| -> ChatResult<()> {
            self.shared
                .store
                .append_message_if_new(&self.shared.session_id, &msg)?;
            let mut session = self
                .shared
                .store
                .load_session(&self.shared.session_id)?
                .ok_or_else(|| ChatError::SessionNotFound(self.shared.session_id.to_string()))?;
            session.welcome_sent = true;
            self.shared.store.save_session(&session)
        })();
        if let Err(err) = persisted {
            warn!(session = %self.shared.session_id, %err, "failed to persist welcome");
        }
        self.emit(SyncEvent::MessagesUpdated);

        match self.do_publish().await {
            Ok(_) => info!(session = %self.shared.session_id, "welcome sent"),
            Err(err) => warn!(session = %self.shared.session_id, %err, "failed to send welcome"),
        }
    }

    async fn poll_loop(self) {
        loop {
            if self.shared.cancel.is_cancelled() {
                break;
            }
            self.do_poll().await;

            let interval = {
                let state = self.shared.state.lock();
                if state.burned {
                    break;
                }
                Self::interval_for(&self.shared.config, &state)
            };
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = self.shared.poll_now.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(session = %self.shared.session_id, "poll loop stopped");
    }

    async fn do_poll(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.burned {
                return;
            }
            state.poll_count += 1;
        }

        let resolved = self
            .shared
            .directory
            .resolve(&self.shared.peer_pub_key, &self.shared.enc_key)
            .await;
        if self.shared.cancel.is_cancelled() {
            return;
        }

        match resolved {
            Ok(batch) => {
                let outcome = batch.map(|batch| {
                    let mut state = self.shared.state.lock();
                    apply_batch(&mut state, &self.shared.peer_pub_key, &batch)
                });

                if let Some(outcome) = outcome {
                    if !outcome.new_messages.is_empty() {
                        debug!(
                            session = %self.shared.session_id,
                            count = outcome.new_messages.len(),
                            "new remote messages"
                        );
                    }
                    for msg in &outcome.new_messages {
                        if let Err(err) = self
                            .shared
                            .store
                            .append_message_if_new(&self.shared.session_id, msg)
                        {
                            warn!(session = %self.shared.session_id, %err, "failed to persist remote message");
                        }
                    }

                    if outcome.ack_advanced {
                        let peer_ack = self.shared.state.lock().peer_ack;
                        self.emit(SyncEvent::PeerAckAdvanced(peer_ack));
                    }
                    if outcome.received_new {
                        self.emit(SyncEvent::MessagesUpdated);
                    }
                    if outcome.join_seen {
                        self.maybe_send_welcome().await;
                    }
                    if let Some(signal) = outcome.call_signal {
                        self.emit(SyncEvent::CallSignalReceived(signal));
                    }
                    if outcome.received_new {
                        // Carry the advanced ack to the peer right away
                        if let Err(err) = self.do_publish().await {
                            warn!(session = %self.shared.session_id, %err, "ack publish failed");
                        }
                    }
                }

                self.shared.state.lock().last_sync = Some(now_millis());
                self.set_status(ConnectionStatus::Online);
            }
            Err(err) => {
                warn!(session = %self.shared.session_id, %err, "poll failed");
                self.set_status(ConnectionStatus::Error);
            }
        }
    }

    async fn republish_loop(self) {
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.shared.config.republish_interval) => {}
            }

            let skip = {
                let state = self.shared.state.lock();
                if state.burned {
                    break;
                }
                // Nothing worth keeping alive
                state.outgoing.is_empty() && state.my_ack == 0
            };
            if skip {
                continue;
            }

            match self.do_publish().await {
                Ok(kept) => debug!(session = %self.shared.session_id, kept, "record republished"),
                Err(err) => warn!(session = %self.shared.session_id, %err, "republish failed"),
            }
        }
        debug!(session = %self.shared.session_id, "republish loop stopped");
    }
}

/// Display text for a call log entry
fn call_event_text(event: &CallEvent) -> String {
    let icon = if event.has_video { "📹" } else { "📞" };
    match event.kind {
        CallEventKind::Started => format!("{} call started", icon),
        CallEventKind::Received => format!("{} incoming call", icon),
        CallEventKind::Connected => format!("{} call connected", icon),
        CallEventKind::Ended => match event.duration_ms {
            Some(ms) => format!("{} call ended ({})", icon, format_duration(ms)),
            None => format!("{} call ended", icon),
        },
        CallEventKind::Missed => format!("{} missed call", icon),
        CallEventKind::Rejected => format!("{} call rejected", icon),
    }
}

fn format_duration(ms: i64) -> String {
    let secs = ms / 1000;
    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryMessage, ResolvedBatch};

    fn batch(messages: Vec<(i64, &str)>, latest: i64, peer_ack: i64) -> ResolvedBatch {
        ResolvedBatch {
            messages: messages
                .into_iter()
                .map(|(t, m)| DirectoryMessage {
                    text: m.to_string(),
                    timestamp: t,
                    nick: None,
                })
                .collect(),
            latest_timestamp: latest,
            peer_ack,
            raw_record_names: vec!["_msgs".into(), "_ts".into(), "_ack".into()],
            encrypted_payload_length: 64,
            packet_timestamp: 12345,
            message_count: 0,
            call_signal: None,
        }
    }

    #[test]
    fn test_apply_batch_incorporates_new_messages() {
        // Scenario A: fresh creator sees the joiner's "hi" at t=100
        let mut state = SyncState::new(0);
        let outcome = apply_batch(&mut state, "peer-key", &batch(vec![(100, "hi")], 100, 0));

        assert!(outcome.received_new);
        assert_eq!(outcome.new_messages.len(), 1);
        assert_eq!(outcome.new_messages[0].id, "peer_100");
        assert_eq!(state.last_seen_timestamp, 100);
        assert_eq!(state.my_ack, 100);
    }

    #[test]
    fn test_apply_batch_prunes_buffer_by_ack() {
        // Scenario B: peer acks t=10, entry a is pruned
        let mut state = SyncState::new(0);
        state.outgoing = vec![
            CompactMessage { t: 10, m: "a".into() },
            CompactMessage { t: 20, m: "b".into() },
        ];

        let outcome = apply_batch(&mut state, "pk", &batch(vec![], 0, 10));
        assert!(outcome.ack_advanced);
        assert_eq!(state.outgoing.len(), 1);
        assert_eq!(state.outgoing[0].t, 20);
        assert_eq!(state.peer_ack, 10);
    }

    #[test]
    fn test_apply_batch_is_idempotent() {
        // Scenario E: the identical batch applied twice is a pure no-op
        let mut state = SyncState::new(0);
        let b = batch(vec![(100, "hi"), (150, "again")], 150, 0);

        let first = apply_batch(&mut state, "pk", &b);
        assert_eq!(first.new_messages.len(), 2);
        let (seen, ack) = (state.last_seen_timestamp, state.my_ack);

        let second = apply_batch(&mut state, "pk", &b);
        assert!(!second.received_new);
        assert!(second.new_messages.is_empty());
        assert_eq!(state.last_seen_timestamp, seen);
        assert_eq!(state.my_ack, ack);
    }

    #[test]
    fn test_apply_batch_filters_already_seen() {
        let mut state = SyncState::new(100);
        let outcome = apply_batch(&mut state, "pk", &batch(vec![(80, "old"), (120, "new")], 120, 0));
        assert_eq!(outcome.new_messages.len(), 1);
        assert_eq!(outcome.new_messages[0].timestamp, 120);
    }

    #[test]
    fn test_apply_batch_ack_is_monotonic() {
        let mut state = SyncState::new(0);
        state.peer_ack = 50;
        let outcome = apply_batch(&mut state, "pk", &batch(vec![], 0, 30));
        assert!(!outcome.ack_advanced);
        assert_eq!(state.peer_ack, 50);
    }

    #[test]
    fn test_apply_batch_classifies_join() {
        let mut state = SyncState::new(0);
        let outcome = apply_batch(&mut state, "pk", &batch(vec![(100, JOIN_TEXT)], 100, 0));
        assert!(outcome.join_seen);
        assert_eq!(outcome.new_messages[0].sender, Sender::System);
    }

    #[test]
    fn test_apply_batch_passes_call_signal() {
        let mut state = SyncState::new(0);
        let mut b = batch(vec![], 0, 0);
        b.call_signal = Some("{\"t\":\"h\",\"ts\":1}".to_string());
        let outcome = apply_batch(&mut state, "pk", &b);
        assert_eq!(outcome.call_signal.as_deref(), Some("{\"t\":\"h\",\"ts\":1}"));
    }

    #[test]
    fn test_local_timestamps_are_strictly_monotonic() {
        let mut state = SyncState::new(0);
        let a = state.next_local_timestamp();
        let b = state.next_local_timestamp();
        let c = state.next_local_timestamp();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_interval_selection() {
        let config = SyncConfig::default();
        let mut state = SyncState::new(0);

        state.last_activity = now_millis();
        assert_eq!(
            SessionSync::<crate::directory::MemoryDirectory, crate::storage::MemoryStore>::interval_for(&config, &state),
            config.active_interval
        );

        state.last_activity = now_millis() - 120_000;
        assert_eq!(
            SessionSync::<crate::directory::MemoryDirectory, crate::storage::MemoryStore>::interval_for(&config, &state),
            config.idle_interval
        );

        // Fast-poll override wins over idleness
        state.fast_poll = true;
        assert_eq!(
            SessionSync::<crate::directory::MemoryDirectory, crate::storage::MemoryStore>::interval_for(&config, &state),
            config.fast_interval
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A buffer entry survives a poll iff the peer has not
            /// acked it, for any buffer and any ack value
            #[test]
            fn buffer_pruned_exactly_by_peer_ack(
                timestamps in proptest::collection::vec(1i64..10_000, 0..30),
                peer_ack in 0i64..10_000,
            ) {
                let mut state = SyncState::new(0);
                state.outgoing = timestamps
                    .iter()
                    .map(|&t| CompactMessage { t, m: format!("m{}", t) })
                    .collect();

                apply_batch(&mut state, "pk", &batch(vec![], 0, peer_ack));

                for &t in &timestamps {
                    let kept = state.outgoing.iter().any(|m| m.t == t);
                    prop_assert_eq!(kept, t > peer_ack);
                }
            }

            /// Applying any batch twice changes nothing the second time
            #[test]
            fn batch_application_is_idempotent(
                timestamps in proptest::collection::vec(1i64..10_000, 1..20),
                peer_ack in 0i64..10_000,
            ) {
                let latest = *timestamps.iter().max().unwrap();
                let msgs: Vec<(i64, &str)> = timestamps.iter().map(|&t| (t, "x")).collect();
                let b = batch(msgs, latest, peer_ack);

                let mut state = SyncState::new(0);
                apply_batch(&mut state, "pk", &b);
                let (seen, my_ack, peer, buf_len) =
                    (state.last_seen_timestamp, state.my_ack, state.peer_ack, state.outgoing.len());

                let second = apply_batch(&mut state, "pk", &b);
                prop_assert!(!second.received_new);
                prop_assert!(second.new_messages.is_empty());
                prop_assert_eq!(state.last_seen_timestamp, seen);
                prop_assert_eq!(state.my_ack, my_ack);
                prop_assert_eq!(state.peer_ack, peer);
                prop_assert_eq!(state.outgoing.len(), buf_len);
            }
        }
    }

    #[test]
    fn test_call_event_text() {
        let ended = CallEvent {
            kind: CallEventKind::Ended,
            has_video: false,
            duration_ms: Some(83_000),
        };
        assert_eq!(call_event_text(&ended), "📞 call ended (1m 23s)");

        let video_start = CallEvent {
            kind: CallEventKind::Started,
            has_video: true,
            duration_ms: None,
        };
        assert_eq!(call_event_text(&video_start), "📹 call started");
    }
}
