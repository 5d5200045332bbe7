//! Property-based tests for the pure pieces: log ordering, id
//! derivation, signal wire format and codec bounds.

use ghostline_core::{
    compress_sdp, CallInput, CallMachine, CallSignal, CallState, ChatMessage, MediaKind, Session,
    SessionId, TransportParams,
};
use proptest::prelude::*;

fn text_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{1,40}"
}

proptest! {
    /// The session id only depends on the first eight characters of
    /// each input
    #[test]
    fn session_id_ignores_input_beyond_prefix(
        seed in "[a-z0-9]{8}",
        peer in "[a-z0-9]{8}",
        seed_tail in "[a-z0-9]{0,32}",
        peer_tail in "[a-z0-9]{0,32}",
    ) {
        let short = SessionId::derive(&seed, &peer);
        let long = SessionId::derive(&format!("{seed}{seed_tail}"), &format!("{peer}{peer_tail}"));
        prop_assert_eq!(short, long);
    }

    /// After any insertion sequence the log stays sorted by timestamp
    /// with unique ids, and replaying the same sequence adds nothing
    #[test]
    fn log_stays_sorted_and_deduped(
        entries in prop::collection::vec((1i64..1_000_000, text_strategy(), any::<bool>()), 0..50),
    ) {
        let id = SessionId::derive("alice", "bobkey");
        let mut session = Session::new(id, "alice", "bobkey", "enc", true);

        for (ts, text, local) in &entries {
            let msg = if *local {
                ChatMessage::local(*ts, text.clone(), None)
            } else {
                ChatMessage::remote(*ts, text.clone(), None, "bobkey", None)
            };
            session.insert_message(msg);
        }

        prop_assert!(session.messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        let mut ids: Vec<_> = session.messages.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), session.messages.len());

        // Replay: every message is already there by id
        let len_before = session.messages.len();
        for (ts, text, local) in &entries {
            let msg = if *local {
                ChatMessage::local(*ts, text.clone(), None)
            } else {
                ChatMessage::remote(*ts, text.clone(), None, "bobkey", None)
            };
            prop_assert!(!session.insert_message(msg));
        }
        prop_assert_eq!(session.messages.len(), len_before);
    }

    /// A signal round-trips through the wire format unchanged
    #[test]
    fn signal_wire_roundtrip(
        ts in 1i64..i64::MAX / 2,
        ufrag in "[a-zA-Z0-9+/]{4,8}",
        pwd in "[a-zA-Z0-9+/]{22,24}",
        fingerprint in "[0-9A-F]{64}",
        video in any::<bool>(),
        ssrcs in prop::collection::vec(any::<u32>(), 0..2),
    ) {
        let mut media = vec![MediaKind::Audio];
        if video {
            media.push(MediaKind::Video);
        }
        let signal = CallSignal::offer(ts, TransportParams {
            ufrag,
            pwd,
            fingerprint,
            setup: "actpass".into(),
            media,
            candidates: vec![],
            ssrcs,
        });
        let decoded = CallSignal::decode(&signal.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded, signal);
    }

    /// However many candidates the descriptor carries, the compact
    /// form keeps at most one host and one server-reflexive
    #[test]
    fn codec_bounds_candidates(
        hosts in 0usize..6,
        srflx in 0usize..6,
    ) {
        let mut lines = vec![
            "v=0".to_string(),
            "m=audio 9 UDP/TLS/RTP/SAVPF 111".to_string(),
            "a=ice-ufrag:abcd".to_string(),
            "a=ice-pwd:abcdefghijklmnopqrstuv".to_string(),
            "a=fingerprint:sha-256 AA:BB:CC:DD".to_string(),
            "a=setup:actpass".to_string(),
        ];
        for i in 0..hosts {
            lines.push(format!(
                "a=candidate:{i} 1 udp 2122260223 192.168.1.{} 5000{i} typ host generation 0",
                i + 1
            ));
        }
        for i in 0..srflx {
            lines.push(format!(
                "a=candidate:{} 1 udp 1686052607 203.0.113.{} 6000{i} typ srflx raddr 0.0.0.0 rport 0",
                i + 10,
                i + 1
            ));
        }
        let sdp = lines.join("\r\n");

        let params = compress_sdp(&sdp);
        let kept_hosts = params.candidates.iter().filter(|c| c.contains(" host")).count();
        let kept_srflx = params.candidates.iter().filter(|c| c.contains(" srflx")).count();
        prop_assert!(kept_hosts <= 1);
        prop_assert!(kept_srflx <= 1);
        prop_assert_eq!(kept_hosts, hosts.min(1));
        prop_assert_eq!(kept_srflx, srflx.min(1));
    }

    /// Signals at or below the processed watermark never produce
    /// actions, in any order
    #[test]
    fn machine_watermark_is_strict(
        timestamps in prop::collection::vec(1i64..10_000, 1..20),
    ) {
        let mut machine = CallMachine::new();
        let mut watermark = 0i64;

        for ts in timestamps {
            let before_state = machine.state();
            let actions = machine.handle(CallInput::Signal(CallSignal::hangup(ts)), ts + 1);
            if ts <= watermark {
                prop_assert!(actions.is_empty());
                prop_assert_eq!(machine.state(), before_state);
            } else {
                watermark = ts;
            }
        }
        // Hangups while idle never move the machine
        prop_assert_eq!(machine.state(), CallState::Idle);
    }
}
