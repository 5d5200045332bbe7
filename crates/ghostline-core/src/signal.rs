//! Call signal wire format
//!
//! A signal is a small JSON object riding inside the session's directory
//! record next to the chat fields. Field names are single characters to
//! keep the record inside its size budget.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Signal tag: offer, answer or hangup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// An offer to start a call
    #[serde(rename = "o")]
    Offer,
    /// The answer to an offer
    #[serde(rename = "a")]
    Answer,
    /// End (or decline) the call
    #[serde(rename = "h")]
    Hangup,
}

/// A media kind present in the connection descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio track
    #[serde(rename = "a")]
    Audio,
    /// Video track
    #[serde(rename = "v")]
    Video,
}

/// Compact connection parameters extracted from a full descriptor.
///
/// This is the lossy Signal Codec output: just enough to rebuild a
/// minimal valid descriptor on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportParams {
    /// ICE username fragment
    pub ufrag: String,
    /// ICE password
    pub pwd: String,
    /// DTLS fingerprint, hex with colons stripped
    pub fingerprint: String,
    /// DTLS role ("actpass", "active" or "passive")
    pub setup: String,
    /// Ordered media kinds present in the descriptor
    pub media: Vec<MediaKind>,
    /// Retained ICE candidates (at most one host + one server-reflexive)
    pub candidates: Vec<String>,
    /// Synchronization sources: audio first, then video if present
    pub ssrcs: Vec<u32>,
}

/// One call signal as published to the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    /// Signal tag
    #[serde(rename = "t")]
    pub kind: SignalKind,
    /// Signaling timestamp; the ordering key for glare resolution
    #[serde(rename = "ts")]
    pub timestamp: i64,
    /// ICE username fragment
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub ufrag: Option<String>,
    /// ICE password
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub pwd: Option<String>,
    /// DTLS fingerprint, colon-stripped hex
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// DTLS role
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    /// Ordered media kinds
    #[serde(rename = "m", default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaKind>,
    /// Retained ICE candidates
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
    /// Synchronization source identifiers
    #[serde(rename = "ss", default, skip_serializing_if = "Vec::is_empty")]
    pub ssrcs: Vec<u32>,
}

impl CallSignal {
    /// Build an offer signal from compact transport parameters
    pub fn offer(timestamp: i64, params: TransportParams) -> Self {
        Self::with_params(SignalKind::Offer, timestamp, params)
    }

    /// Build an answer signal from compact transport parameters
    pub fn answer(timestamp: i64, params: TransportParams) -> Self {
        Self::with_params(SignalKind::Answer, timestamp, params)
    }

    /// Build a hangup signal (no transport parameters)
    pub fn hangup(timestamp: i64) -> Self {
        Self {
            kind: SignalKind::Hangup,
            timestamp,
            ufrag: None,
            pwd: None,
            fingerprint: None,
            setup: None,
            media: Vec::new(),
            candidates: Vec::new(),
            ssrcs: Vec::new(),
        }
    }

    fn with_params(kind: SignalKind, timestamp: i64, params: TransportParams) -> Self {
        Self {
            kind,
            timestamp,
            ufrag: Some(params.ufrag),
            pwd: Some(params.pwd),
            fingerprint: Some(params.fingerprint),
            setup: Some(params.setup),
            media: params.media,
            candidates: params.candidates,
            ssrcs: params.ssrcs,
        }
    }

    /// Serialize to the wire string
    pub fn encode(&self) -> ChatResult<String> {
        serde_json::to_string(self).map_err(|e| ChatError::Serialization(e.to_string()))
    }

    /// Parse from the wire string
    pub fn decode(raw: &str) -> ChatResult<Self> {
        serde_json::from_str(raw).map_err(|e| ChatError::SignalDecode(e.to_string()))
    }

    /// Whether the signal advertises a video track
    pub fn has_video(&self) -> bool {
        self.media.contains(&MediaKind::Video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> TransportParams {
        TransportParams {
            ufrag: "Fr4g".to_string(),
            pwd: "s3cretpass".to_string(),
            fingerprint: "AABBCC".to_string(),
            setup: "actpass".to_string(),
            media: vec![MediaKind::Audio, MediaKind::Video],
            candidates: vec!["1 1 udp 2122260223 192.168.1.2 50000 typ host".to_string()],
            ssrcs: vec![111, 222],
        }
    }

    #[test]
    fn test_wire_field_names_are_short() {
        let sig = CallSignal::offer(500, sample_params());
        let wire = sig.encode().unwrap();
        assert!(wire.contains("\"t\":\"o\""));
        assert!(wire.contains("\"ts\":500"));
        assert!(wire.contains("\"u\":"));
        assert!(wire.contains("\"m\":[\"a\",\"v\"]"));
        assert!(wire.contains("\"ss\":[111,222]"));
    }

    #[test]
    fn test_roundtrip() {
        let sig = CallSignal::answer(1234, sample_params());
        let decoded = CallSignal::decode(&sig.encode().unwrap()).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn test_hangup_is_minimal() {
        let wire = CallSignal::hangup(600).encode().unwrap();
        assert_eq!(wire, "{\"t\":\"h\",\"ts\":600}");
    }

    #[test]
    fn test_decode_garbage_is_signal_decode_error() {
        let err = CallSignal::decode("not json").unwrap_err();
        assert!(matches!(err, ChatError::SignalDecode(_)));
    }

    #[test]
    fn test_has_video() {
        assert!(CallSignal::offer(1, sample_params()).has_video());
        let audio_only = TransportParams {
            media: vec![MediaKind::Audio],
            ..sample_params()
        };
        assert!(!CallSignal::offer(1, audio_only).has_video());
    }
}
