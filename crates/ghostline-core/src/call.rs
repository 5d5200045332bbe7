//! Call Signaling Engine
//!
//! Negotiates one call at a time over the directory channel. The
//! decision logic lives in [`CallMachine`], a pure state machine that
//! consumes [`CallInput`]s and emits [`CallAction`]s without touching
//! I/O; [`CallSession`] drives it, wiring actions to the sync engine
//! and a [`CallTransport`].
//!
//! Because signals travel as fields of the regular directory record,
//! both sides may see stale or duplicated signals. The machine defends
//! with a strict signal-timestamp watermark: anything at or below the
//! last processed timestamp is dropped, glare (simultaneous offers)
//! resolves by ordering, and a connected call honors nothing but a
//! hangup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{build_sdp, compress_sdp};
use crate::directory::Directory;
use crate::engine::{SessionSync, SyncEvent};
use crate::error::ChatResult;
use crate::signal::{CallSignal, SignalKind, TransportParams};
use crate::storage::SessionStore;
use crate::types::{now_millis, CallEvent, CallEventKind};

/// How long a published hangup stays in the record before being
/// cleared, so a peer polling slowly still sees it
pub const HANGUP_LINGER_MS: u64 = 5_000;

/// Call negotiation states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call
    Idle,
    /// We published an offer and await an answer
    Offering,
    /// We received an offer and await the user's decision
    Incoming,
    /// The user accepted; local media and answer are being prepared
    Answering,
    /// Signals exchanged; transport connectivity pending
    Connecting,
    /// Media is flowing
    Connected,
}

/// Inputs the machine consumes
#[derive(Debug, Clone)]
pub enum CallInput {
    /// User starts a call
    Start { video: bool },
    /// User accepts the incoming call
    Accept { video: bool },
    /// User rejects the incoming call
    Reject,
    /// User hangs up
    HangUp,
    /// The transport produced our local offer
    OfferBuilt { params: TransportParams },
    /// The transport produced our local answer
    AnswerBuilt { params: TransportParams },
    /// Media acquisition or connection setup failed locally
    MediaFailed,
    /// A signal arrived from the peer
    Signal(CallSignal),
    /// The transport reports media flowing
    TransportConnected,
    /// The transport reports a terminal failure
    TransportFailed,
    /// The transport reports the connection closed
    TransportClosed,
}

/// Effects the machine requests; the driver executes them in order
#[derive(Debug, Clone)]
pub enum CallAction {
    /// Acquire media and build a local offer
    BeginOffer { video: bool },
    /// Acquire media, apply the remote offer, build a local answer
    BeginAnswer { video: bool, offer: CallSignal },
    /// Apply the remote answer to the in-flight connection
    ApplyRemoteAnswer(CallSignal),
    /// Publish this signal in our directory record
    PublishSignal(CallSignal),
    /// Clear the signal field of our record now
    ClearSignal,
    /// Clear the signal field after a delay
    ScheduleSignalClear { after_ms: u64 },
    /// Toggle the sync engine's fast-poll override
    SetFastPoll(bool),
    /// Stop local media and close the transport
    Teardown,
    /// Append a call log entry to the session
    RecordEvent(CallEvent),
}

/// Pure call negotiation state machine.
///
/// `handle` never blocks and never performs I/O; every transition is a
/// plain function of (state, input, now).
#[derive(Debug)]
pub struct CallMachine {
    state: CallState,
    /// Strict watermark over processed signal timestamps
    last_processed_ts: i64,
    /// Timestamp of our own outstanding offer; answers at or below it
    /// are stale echoes of an earlier negotiation
    my_offer_ts: i64,
    /// The remote offer awaiting the user's decision
    pending_offer: Option<CallSignal>,
    has_video: bool,
    connected_at: Option<i64>,
    /// Guards the one-time Connected log entry
    connected_fired: bool,
}

impl Default for CallMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            last_processed_ts: 0,
            my_offer_ts: 0,
            pending_offer: None,
            has_video: false,
            connected_at: None,
            connected_fired: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn has_video(&self) -> bool {
        self.has_video
    }

    /// Reset negotiation state while keeping the signal watermark, so
    /// stale signals from the finished call stay dead
    fn reset(&mut self) {
        self.state = CallState::Idle;
        self.my_offer_ts = 0;
        self.pending_offer = None;
        self.connected_at = None;
        self.connected_fired = false;
    }

    fn event(&self, kind: CallEventKind) -> CallEvent {
        CallEvent {
            kind,
            has_video: self.has_video,
            duration_ms: None,
        }
    }

    /// Advance the machine and return the actions the driver must run,
    /// in order
    pub fn handle(&mut self, input: CallInput, now: i64) -> Vec<CallAction> {
        match input {
            CallInput::Start { video } => {
                if self.state != CallState::Idle {
                    return vec![];
                }
                self.state = CallState::Offering;
                self.has_video = video;
                self.connected_fired = false;
                vec![
                    CallAction::SetFastPoll(true),
                    CallAction::RecordEvent(self.event(CallEventKind::Started)),
                    CallAction::BeginOffer { video },
                ]
            }

            CallInput::OfferBuilt { params } => {
                // A hangup may have landed while media was starting
                if self.state != CallState::Offering {
                    return vec![];
                }
                self.my_offer_ts = now;
                vec![CallAction::PublishSignal(CallSignal::offer(now, params))]
            }

            CallInput::Accept { video } => {
                if self.state != CallState::Incoming {
                    return vec![];
                }
                let Some(offer) = self.pending_offer.take() else {
                    return vec![];
                };
                self.state = CallState::Answering;
                self.has_video = video || offer.has_video();
                self.connected_fired = false;
                vec![CallAction::BeginAnswer { video, offer }]
            }

            CallInput::AnswerBuilt { params } => {
                if self.state != CallState::Answering {
                    return vec![];
                }
                self.state = CallState::Connecting;
                vec![CallAction::PublishSignal(CallSignal::answer(now, params))]
            }

            CallInput::Reject => {
                if self.state != CallState::Incoming {
                    return vec![];
                }
                let event = self.event(CallEventKind::Rejected);
                self.reset();
                vec![
                    CallAction::RecordEvent(event),
                    CallAction::PublishSignal(CallSignal::hangup(now)),
                    CallAction::ScheduleSignalClear {
                        after_ms: HANGUP_LINGER_MS,
                    },
                    CallAction::SetFastPoll(false),
                ]
            }

            CallInput::HangUp => {
                if self.state == CallState::Idle {
                    return vec![];
                }
                let ended = self.connected_fired.then(|| CallEvent {
                    kind: CallEventKind::Ended,
                    has_video: self.has_video,
                    duration_ms: self.connected_at.map(|at| now - at),
                });
                self.reset();
                // Media must stop before the hangup goes out
                let mut actions = vec![
                    CallAction::Teardown,
                    CallAction::PublishSignal(CallSignal::hangup(now)),
                    CallAction::ScheduleSignalClear {
                        after_ms: HANGUP_LINGER_MS,
                    },
                ];
                if let Some(event) = ended {
                    actions.push(CallAction::RecordEvent(event));
                }
                actions.push(CallAction::SetFastPoll(false));
                actions
            }

            CallInput::MediaFailed => {
                if self.state == CallState::Idle {
                    return vec![];
                }
                self.reset();
                vec![CallAction::Teardown, CallAction::SetFastPoll(false)]
            }

            CallInput::TransportConnected => {
                if !matches!(
                    self.state,
                    CallState::Offering | CallState::Answering | CallState::Connecting
                ) {
                    return vec![];
                }
                self.state = CallState::Connected;
                self.connected_at = Some(now);
                let mut actions = vec![CallAction::SetFastPoll(false)];
                if !self.connected_fired {
                    self.connected_fired = true;
                    actions.push(CallAction::RecordEvent(self.event(CallEventKind::Connected)));
                }
                actions
            }

            CallInput::TransportFailed => {
                if self.state == CallState::Idle {
                    return vec![];
                }
                self.reset();
                // The peer may never see the failure otherwise
                vec![
                    CallAction::Teardown,
                    CallAction::PublishSignal(CallSignal::hangup(now)),
                    CallAction::ScheduleSignalClear {
                        after_ms: HANGUP_LINGER_MS,
                    },
                    CallAction::SetFastPoll(false),
                ]
            }

            CallInput::TransportClosed => {
                if self.state == CallState::Idle {
                    return vec![];
                }
                self.reset();
                vec![
                    CallAction::Teardown,
                    CallAction::ClearSignal,
                    CallAction::SetFastPoll(false),
                ]
            }

            CallInput::Signal(signal) => self.handle_signal(signal, now),
        }
    }

    fn handle_signal(&mut self, signal: CallSignal, now: i64) -> Vec<CallAction> {
        if signal.timestamp <= self.last_processed_ts {
            return vec![];
        }
        // A connected call honors nothing but a hangup
        if self.state == CallState::Connected && signal.kind != SignalKind::Hangup {
            return vec![];
        }

        match signal.kind {
            SignalKind::Offer => {
                if self.state != CallState::Idle {
                    // Glare or a duplicate: our own negotiation wins
                    debug!(state = ?self.state, ts = signal.timestamp, "ignoring offer");
                    return vec![];
                }
                self.last_processed_ts = signal.timestamp;
                self.has_video = signal.has_video();
                self.connected_fired = false;
                self.pending_offer = Some(signal);
                self.state = CallState::Incoming;
                vec![
                    CallAction::RecordEvent(self.event(CallEventKind::Received)),
                    CallAction::SetFastPoll(true),
                ]
            }

            SignalKind::Answer => {
                // Answers to anything but our outstanding offer are
                // stale echoes
                if signal.timestamp <= self.my_offer_ts {
                    return vec![];
                }
                match self.state {
                    CallState::Offering => {
                        self.last_processed_ts = signal.timestamp;
                        self.state = CallState::Connecting;
                        vec![CallAction::ApplyRemoteAnswer(signal)]
                    }
                    CallState::Connecting => {
                        // Duplicate answer while connecting
                        self.last_processed_ts = signal.timestamp;
                        vec![]
                    }
                    _ => vec![],
                }
            }

            SignalKind::Hangup => {
                self.last_processed_ts = signal.timestamp;
                if self.state == CallState::Idle {
                    return vec![];
                }
                let event = if self.connected_fired {
                    Some(CallEvent {
                        kind: CallEventKind::Ended,
                        has_video: self.has_video,
                        duration_ms: self.connected_at.map(|at| now - at),
                    })
                } else if self.state == CallState::Incoming {
                    Some(self.event(CallEventKind::Missed))
                } else {
                    None
                };
                self.reset();
                let mut actions = vec![CallAction::Teardown, CallAction::ClearSignal];
                if let Some(event) = event {
                    actions.push(CallAction::RecordEvent(event));
                }
                actions.push(CallAction::SetFastPoll(false));
                actions
            }
        }
    }
}

/// Media/connectivity boundary for a call.
///
/// Implementations acquire local media, run the underlying connection,
/// and hand back full session descriptions; compression to wire form
/// is the [`CallSession`]'s job.
pub trait CallTransport: Send + Sync + 'static {
    /// Acquire local media and return the complete local offer
    /// description, candidates included
    fn create_offer(&self, video: bool) -> impl Future<Output = ChatResult<String>> + Send;

    /// Acquire local media, apply the remote offer, and return the
    /// complete local answer description
    fn accept_offer(
        &self,
        video: bool,
        remote_sdp: String,
    ) -> impl Future<Output = ChatResult<String>> + Send;

    /// Apply the remote answer to the in-flight connection
    fn apply_answer(&self, remote_sdp: String) -> impl Future<Output = ChatResult<()>> + Send;

    /// Stop local media tracks and close the connection
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Connectivity notifications from the transport owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Media is flowing
    Connected,
    /// Terminal failure
    Failed,
    /// The connection closed
    Closed,
}

struct CallSessionInner<D, S, T> {
    sync: SessionSync<D, S>,
    transport: Arc<T>,
    machine: Mutex<CallMachine>,
    /// Cancels the pending delayed signal clear, if any
    clear_timer: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

/// Drives a [`CallMachine`] against a sync engine and a transport.
///
/// Inbound signals arrive via the sync engine's event stream; user
/// intents and transport callbacks arrive through the public methods.
/// Every path funnels into the machine, so ordering and dedup rules
/// live in one place.
pub struct CallSession<D, S, T> {
    inner: Arc<CallSessionInner<D, S, T>>,
}

impl<D, S, T> Clone for CallSession<D, S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Directory, S: SessionStore, T: CallTransport> CallSession<D, S, T> {
    /// Attach call signaling to a running sync engine
    pub fn start(sync: SessionSync<D, S>, transport: Arc<T>) -> Self {
        let session = Self {
            inner: Arc::new(CallSessionInner {
                sync,
                transport,
                machine: Mutex::new(CallMachine::new()),
                clear_timer: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        };

        let listener = session.clone();
        let mut events = listener.inner.sync.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener.inner.cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(SyncEvent::CallSignalReceived(raw)) => {
                            match CallSignal::decode(&raw) {
                                Ok(signal) => listener.apply(CallInput::Signal(signal)).await,
                                Err(err) => warn!(%err, "dropping undecodable call signal"),
                            }
                        }
                        Ok(SyncEvent::Burned) => {
                            listener.apply(CallInput::HangUp).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "call signal listener lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        session
    }

    /// Current negotiation state
    pub fn state(&self) -> CallState {
        self.inner.machine.lock().state()
    }

    /// Start an outgoing call
    pub async fn start_call(&self, video: bool) {
        self.apply(CallInput::Start { video }).await;
    }

    /// Accept the incoming call
    pub async fn accept_call(&self, video: bool) {
        self.apply(CallInput::Accept { video }).await;
    }

    /// Reject the incoming call
    pub async fn reject_call(&self) {
        self.apply(CallInput::Reject).await;
    }

    /// Hang up the current call
    pub async fn hang_up(&self) {
        self.apply(CallInput::HangUp).await;
    }

    /// Feed a connectivity notification from the transport owner
    pub async fn transport_event(&self, event: TransportEvent) {
        let input = match event {
            TransportEvent::Connected => CallInput::TransportConnected,
            TransportEvent::Failed => CallInput::TransportFailed,
            TransportEvent::Closed => CallInput::TransportClosed,
        };
        self.apply(input).await;
    }

    /// Stop the signal listener and any pending delayed clear
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(timer) = self.inner.clear_timer.lock().take() {
            timer.cancel();
        }
    }

    // Boxed so the spawned transport tasks in `run_action` can feed
    // their results back through `apply` without a recursive opaque
    // future type.
    fn apply(&self, input: CallInput) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let actions = {
                let mut machine = self.inner.machine.lock();
                machine.handle(input, now_millis())
            };
            for action in actions {
                self.run_action(action).await;
            }
        })
    }

    /// Cancel a scheduled signal clear; a newer signal must not be
    /// wiped by the previous call's timer
    fn cancel_pending_clear(&self) {
        if let Some(timer) = self.inner.clear_timer.lock().take() {
            timer.cancel();
        }
    }

    async fn run_action(&self, action: CallAction) {
        match action {
            CallAction::BeginOffer { video } => {
                let this = self.clone();
                tokio::spawn(async move {
                    match this.inner.transport.create_offer(video).await {
                        Ok(sdp) => {
                            let params = compress_sdp(&sdp);
                            this.apply(CallInput::OfferBuilt { params }).await;
                        }
                        Err(err) => {
                            warn!(%err, "failed to build offer");
                            this.apply(CallInput::MediaFailed).await;
                        }
                    }
                });
            }

            CallAction::BeginAnswer { video, offer } => {
                let this = self.clone();
                tokio::spawn(async move {
                    let result = async {
                        let remote_sdp = build_sdp(&offer)?;
                        this.inner.transport.accept_offer(video, remote_sdp).await
                    }
                    .await;
                    match result {
                        Ok(sdp) => {
                            let params = compress_sdp(&sdp);
                            this.apply(CallInput::AnswerBuilt { params }).await;
                        }
                        Err(err) => {
                            warn!(%err, "failed to build answer");
                            this.apply(CallInput::MediaFailed).await;
                        }
                    }
                });
            }

            CallAction::ApplyRemoteAnswer(signal) => {
                let this = self.clone();
                tokio::spawn(async move {
                    let result = async {
                        let remote_sdp = build_sdp(&signal)?;
                        this.inner.transport.apply_answer(remote_sdp).await
                    }
                    .await;
                    if let Err(err) = result {
                        warn!(%err, "failed to apply remote answer");
                        this.apply(CallInput::TransportFailed).await;
                    }
                });
            }

            CallAction::PublishSignal(signal) => {
                self.cancel_pending_clear();
                match signal.encode() {
                    Ok(encoded) => {
                        info!(kind = ?signal.kind, ts = signal.timestamp, "publishing call signal");
                        self.inner.sync.set_call_signal(Some(encoded)).await;
                    }
                    Err(err) => warn!(%err, "failed to encode call signal"),
                }
            }

            CallAction::ClearSignal => {
                self.cancel_pending_clear();
                self.inner.sync.set_call_signal(None).await;
            }

            CallAction::ScheduleSignalClear { after_ms } => {
                self.cancel_pending_clear();
                let token = self.inner.cancel.child_token();
                *self.inner.clear_timer.lock() = Some(token.clone());
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(std::time::Duration::from_millis(after_ms)) => {
                            this.inner.sync.set_call_signal(None).await;
                        }
                    }
                });
            }

            CallAction::SetFastPoll(fast) => {
                self.inner.sync.set_fast_poll(fast);
            }

            CallAction::Teardown => {
                self.inner.transport.close().await;
            }

            CallAction::RecordEvent(event) => {
                self.inner.sync.add_call_event(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MediaKind;

    fn offer(ts: i64) -> CallSignal {
        CallSignal::offer(ts, params(vec![MediaKind::Audio]))
    }

    fn video_offer(ts: i64) -> CallSignal {
        CallSignal::offer(ts, params(vec![MediaKind::Audio, MediaKind::Video]))
    }

    fn answer(ts: i64) -> CallSignal {
        CallSignal::answer(ts, params(vec![MediaKind::Audio]))
    }

    fn params(media: Vec<MediaKind>) -> TransportParams {
        TransportParams {
            ufrag: "uf".into(),
            pwd: "pw".into(),
            fingerprint: "AA12BC34".into(),
            setup: "actpass".into(),
            media,
            ..Default::default()
        }
    }

    fn has_action(actions: &[CallAction], pred: impl Fn(&CallAction) -> bool) -> bool {
        actions.iter().any(pred)
    }

    #[test]
    fn test_start_call_offers_and_enables_fast_poll() {
        let mut m = CallMachine::new();
        let actions = m.handle(CallInput::Start { video: false }, 1_000);

        assert_eq!(m.state(), CallState::Offering);
        assert!(has_action(&actions, |a| matches!(a, CallAction::SetFastPoll(true))));
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::BeginOffer { video: false }
        )));
    }

    #[test]
    fn test_start_while_busy_is_ignored() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Start { video: false }, 1_000);
        let actions = m.handle(CallInput::Start { video: true }, 1_001);
        assert!(actions.is_empty());
        assert_eq!(m.state(), CallState::Offering);
    }

    #[test]
    fn test_offer_built_publishes_signal() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Start { video: false }, 1_000);
        let actions = m.handle(
            CallInput::OfferBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            1_050,
        );
        assert!(matches!(
            actions.as_slice(),
            [CallAction::PublishSignal(s)] if s.kind == SignalKind::Offer && s.timestamp == 1_050
        ));
    }

    #[test]
    fn test_incoming_offer_then_accept() {
        let mut m = CallMachine::new();
        let actions = m.handle(CallInput::Signal(offer(500)), 600);
        assert_eq!(m.state(), CallState::Incoming);
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::RecordEvent(e) if e.kind == CallEventKind::Received
        )));
        assert!(has_action(&actions, |a| matches!(a, CallAction::SetFastPoll(true))));

        let actions = m.handle(CallInput::Accept { video: false }, 700);
        assert_eq!(m.state(), CallState::Answering);
        assert!(matches!(actions.as_slice(), [CallAction::BeginAnswer { .. }]));

        let actions = m.handle(
            CallInput::AnswerBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            750,
        );
        assert_eq!(m.state(), CallState::Connecting);
        assert!(matches!(
            actions.as_slice(),
            [CallAction::PublishSignal(s)] if s.kind == SignalKind::Answer
        ));
    }

    #[test]
    fn test_video_offer_sets_video_flag() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(video_offer(500)), 600);
        m.handle(CallInput::Accept { video: false }, 700);
        // Callee answering audio-only still renders the call as video
        assert!(m.has_video());
    }

    #[test]
    fn test_answer_completes_offerer_side() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Start { video: false }, 1_000);
        m.handle(
            CallInput::OfferBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            1_050,
        );
        let actions = m.handle(CallInput::Signal(answer(1_200)), 1_250);
        assert_eq!(m.state(), CallState::Connecting);
        assert!(matches!(actions.as_slice(), [CallAction::ApplyRemoteAnswer(_)]));
    }

    #[test]
    fn test_stale_answer_is_dropped() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Start { video: false }, 2_000);
        m.handle(
            CallInput::OfferBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            2_000,
        );
        // Answer timestamped at or before our offer belongs to an
        // earlier negotiation
        let actions = m.handle(CallInput::Signal(answer(1_500)), 2_100);
        assert!(actions.is_empty());
        assert_eq!(m.state(), CallState::Offering);
    }

    #[test]
    fn test_duplicate_signal_is_dropped() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 600);
        let actions = m.handle(CallInput::Signal(offer(500)), 700);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_glare_ignores_remote_offer_while_offering() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Start { video: false }, 1_000);
        let actions = m.handle(CallInput::Signal(offer(1_010)), 1_020);
        assert!(actions.is_empty());
        assert_eq!(m.state(), CallState::Offering);
    }

    #[test]
    fn test_connected_ignores_everything_but_hangup() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 600);
        m.handle(CallInput::Accept { video: false }, 700);
        m.handle(
            CallInput::AnswerBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            750,
        );
        m.handle(CallInput::TransportConnected, 800);
        assert_eq!(m.state(), CallState::Connected);

        assert!(m.handle(CallInput::Signal(offer(900)), 950).is_empty());
        assert_eq!(m.state(), CallState::Connected);

        let actions = m.handle(CallInput::Signal(CallSignal::hangup(1_000)), 1_050);
        assert_eq!(m.state(), CallState::Idle);
        assert!(has_action(&actions, |a| matches!(a, CallAction::Teardown)));
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::RecordEvent(e) if e.kind == CallEventKind::Ended
        )));
    }

    #[test]
    fn test_connected_event_fires_once() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 600);
        m.handle(CallInput::Accept { video: false }, 700);
        m.handle(
            CallInput::AnswerBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            750,
        );
        let first = m.handle(CallInput::TransportConnected, 800);
        assert!(has_action(&first, |a| matches!(
            a,
            CallAction::RecordEvent(e) if e.kind == CallEventKind::Connected
        )));
        let second = m.handle(CallInput::TransportConnected, 900);
        assert!(second.is_empty());
    }

    #[test]
    fn test_remote_hangup_while_incoming_is_missed() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 600);
        let actions = m.handle(CallInput::Signal(CallSignal::hangup(700)), 750);
        assert_eq!(m.state(), CallState::Idle);
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::RecordEvent(e) if e.kind == CallEventKind::Missed
        )));
        assert!(has_action(&actions, |a| matches!(a, CallAction::SetFastPoll(false))));
    }

    #[test]
    fn test_reject_publishes_hangup_with_delayed_clear() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 600);
        let actions = m.handle(CallInput::Reject, 700);
        assert_eq!(m.state(), CallState::Idle);
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::PublishSignal(s) if s.kind == SignalKind::Hangup
        )));
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::ScheduleSignalClear { after_ms: HANGUP_LINGER_MS }
        )));
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::RecordEvent(e) if e.kind == CallEventKind::Rejected
        )));
    }

    #[test]
    fn test_hangup_closes_transport_before_publishing() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 600);
        m.handle(CallInput::Accept { video: false }, 650);
        m.handle(
            CallInput::AnswerBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            700,
        );
        m.handle(CallInput::TransportConnected, 800);

        let actions = m.handle(CallInput::HangUp, 5_800);
        let teardown = actions
            .iter()
            .position(|a| matches!(a, CallAction::Teardown))
            .unwrap();
        let publish = actions
            .iter()
            .position(|a| matches!(a, CallAction::PublishSignal(_)))
            .unwrap();
        assert!(teardown < publish);

        let ended = actions.iter().find_map(|a| match a {
            CallAction::RecordEvent(e) if e.kind == CallEventKind::Ended => Some(e),
            _ => None,
        });
        assert_eq!(ended.unwrap().duration_ms, Some(5_000));
    }

    #[test]
    fn test_stale_signal_after_call_end_stays_dead() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 600);
        m.handle(CallInput::Signal(CallSignal::hangup(700)), 750);
        // The finished call's offer re-resolved from a slow record
        let actions = m.handle(CallInput::Signal(offer(500)), 900);
        assert!(actions.is_empty());
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_media_failure_tears_down() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Start { video: true }, 1_000);
        let actions = m.handle(CallInput::MediaFailed, 1_100);
        assert_eq!(m.state(), CallState::Idle);
        assert!(has_action(&actions, |a| matches!(a, CallAction::Teardown)));
        assert!(has_action(&actions, |a| matches!(a, CallAction::SetFastPoll(false))));
    }

    #[test]
    fn test_transport_failure_publishes_hangup() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Start { video: false }, 1_000);
        m.handle(
            CallInput::OfferBuilt {
                params: params(vec![MediaKind::Audio]),
            },
            1_050,
        );
        let actions = m.handle(CallInput::TransportFailed, 2_000);
        assert_eq!(m.state(), CallState::Idle);
        assert!(has_action(&actions, |a| matches!(a, CallAction::Teardown)));
        assert!(has_action(&actions, |a| matches!(
            a,
            CallAction::PublishSignal(s) if s.kind == SignalKind::Hangup
        )));
    }

    #[test]
    fn test_offer_stale_offer_hangup_sequence() {
        let mut m = CallMachine::new();
        m.handle(CallInput::Signal(offer(500)), 510);
        assert_eq!(m.state(), CallState::Incoming);

        // Older offer re-resolved from a slow record is stale
        assert!(m.handle(CallInput::Signal(offer(400)), 520).is_empty());
        assert_eq!(m.state(), CallState::Incoming);

        m.handle(CallInput::Signal(CallSignal::hangup(600)), 610);
        assert_eq!(m.state(), CallState::Idle);
    }
}
