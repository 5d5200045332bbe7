//! Signal Codec: lossy round-trip between a full SDP connection
//! descriptor and the compact signaling payload.
//!
//! `compress_sdp` keeps only what the peer needs to reconstruct a
//! minimal descriptor: ICE credentials, the DTLS fingerprint and role,
//! the media order, a bounded candidate subset and the track SSRCs.
//! `build_sdp` rebuilds a descriptor the transport stack accepts even
//! though most optional attributes are gone. The round-trip is lossy by
//! design; validity, not equality, is the invariant.

use rand::Rng;
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::signal::{CallSignal, MediaKind, TransportParams};

/// Host candidates retained per signal. Tunable size/success tradeoff.
pub const MAX_HOST_CANDIDATES: usize = 1;
/// Server-reflexive candidates retained per signal.
pub const MAX_SRFLX_CANDIDATES: usize = 1;

/// Extract compact transport parameters from a full SDP descriptor.
///
/// Takes the first ICE ufrag/pwd, the first sha-256 fingerprint
/// (colon-stripped), the first setup attribute, the media kinds in
/// order, the first SSRC per media section, and a bounded candidate
/// subset: at most one UDP host candidate and one server-reflexive
/// candidate. Further candidates are discarded to keep the signal
/// inside the directory's record budget.
pub fn compress_sdp(sdp: &str) -> TransportParams {
    let mut ufrag = String::new();
    let mut pwd = String::new();
    let mut fingerprint = String::new();
    let mut setup = String::new();
    let mut media = Vec::new();
    let mut candidates: Vec<String> = Vec::new();
    let mut audio_ssrc: Option<u32> = None;
    let mut video_ssrc: Option<u32> = None;
    let mut current_media: Option<MediaKind> = None;

    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("a=ice-ufrag:") {
            if ufrag.is_empty() {
                ufrag = rest.to_string();
            }
        }
        if let Some(rest) = line.strip_prefix("a=ice-pwd:") {
            if pwd.is_empty() {
                pwd = rest.to_string();
            }
        }
        if let Some(rest) = line.strip_prefix("a=fingerprint:sha-256 ") {
            if fingerprint.is_empty() {
                fingerprint = rest.replace(':', "");
            }
        }
        if let Some(rest) = line.strip_prefix("a=setup:") {
            if setup.is_empty() {
                setup = rest.to_string();
            }
        }
        if line.starts_with("m=audio") {
            media.push(MediaKind::Audio);
            current_media = Some(MediaKind::Audio);
        }
        if line.starts_with("m=video") {
            media.push(MediaKind::Video);
            current_media = Some(MediaKind::Video);
        }
        if let Some(rest) = line.strip_prefix("a=candidate:") {
            candidates.push(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("a=ssrc:") {
            let ssrc = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u32>().ok());
            if let Some(ssrc) = ssrc {
                match current_media {
                    Some(MediaKind::Audio) if audio_ssrc.is_none() => audio_ssrc = Some(ssrc),
                    Some(MediaKind::Video) if video_ssrc.is_none() => video_ssrc = Some(ssrc),
                    _ => {}
                }
            }
        }
    }

    let host: Vec<&String> = candidates
        .iter()
        .filter(|c| c.contains(" host") && c.contains(" udp "))
        .take(MAX_HOST_CANDIDATES)
        .collect();
    let srflx: Vec<&String> = candidates
        .iter()
        .filter(|c| c.contains(" srflx"))
        .take(MAX_SRFLX_CANDIDATES)
        .collect();
    let selected: Vec<String> = host.into_iter().chain(srflx).cloned().collect();

    let mut ssrcs = Vec::new();
    if let Some(a) = audio_ssrc {
        ssrcs.push(a);
    }
    if let Some(v) = video_ssrc {
        ssrcs.push(v);
    }

    debug!(
        media = media.len(),
        candidates = selected.len(),
        ssrcs = ssrcs.len(),
        "compressed descriptor"
    );

    TransportParams {
        ufrag,
        pwd,
        fingerprint,
        setup,
        media,
        candidates: selected,
        ssrcs,
    }
}

/// Rebuild a minimal but valid SDP descriptor from a signal.
///
/// One media section per entry in the signal's media order (defaulting
/// to audio-only), the retained candidates attached to every section,
/// SSRCs taken from the signal or freshly generated. Fails with
/// [`ChatError::SignalDecode`] when the signal lacks transport
/// parameters (e.g. a hangup signal).
pub fn build_sdp(signal: &CallSignal) -> ChatResult<String> {
    let ufrag = required(&signal.ufrag, "ice ufrag")?;
    let pwd = required(&signal.pwd, "ice pwd")?;
    let raw_fingerprint = required(&signal.fingerprint, "fingerprint")?;
    let setup = required(&signal.setup, "setup")?;

    if raw_fingerprint.len() % 2 != 0 {
        return Err(ChatError::SignalDecode(
            "fingerprint has odd hex length".to_string(),
        ));
    }
    let pairs: Vec<&str> = raw_fingerprint
        .as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).unwrap_or(""))
        .collect();
    let fingerprint = format!("sha-256 {}", pairs.join(":"));

    let media_order: &[MediaKind] = if signal.media.is_empty() {
        &[MediaKind::Audio]
    } else {
        &signal.media
    };

    let mut rng = rand::rng();
    let session_id: u64 = rng.random_range(0..1_000_000_000_000_000);
    let audio_ssrc = signal.ssrcs.first().copied().unwrap_or_else(|| rng.random());
    let video_ssrc = signal.ssrcs.get(1).copied().unwrap_or_else(|| rng.random());

    let mut lines: Vec<String> = vec![
        "v=0".to_string(),
        format!("o=- {} 2 IN IP4 127.0.0.1", session_id),
        "s=-".to_string(),
        "t=0 0".to_string(),
    ];

    let mids: Vec<String> = (0..media_order.len()).map(|i| i.to_string()).collect();
    lines.push(format!("a=group:BUNDLE {}", mids.join(" ")));
    lines.push("a=msid-semantic: WMS stream".to_string());

    for (idx, kind) in media_order.iter().enumerate() {
        let mid = idx.to_string();
        match kind {
            MediaKind::Audio => {
                lines.push("m=audio 9 UDP/TLS/RTP/SAVPF 111".to_string());
                lines.push("c=IN IP4 0.0.0.0".to_string());
                lines.push("a=rtcp:9 IN IP4 0.0.0.0".to_string());
                for c in &signal.candidates {
                    lines.push(format!("a=candidate:{}", c));
                }
                lines.push("a=end-of-candidates".to_string());
                lines.push(format!("a=ice-ufrag:{}", ufrag));
                lines.push(format!("a=ice-pwd:{}", pwd));
                lines.push(format!("a=fingerprint:{}", fingerprint));
                lines.push(format!("a=setup:{}", setup));
                lines.push(format!("a=mid:{}", mid));
                lines.push("a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level".to_string());
                lines.push("a=sendrecv".to_string());
                lines.push("a=msid:stream audio0".to_string());
                lines.push("a=rtcp-mux".to_string());
                lines.push("a=rtpmap:111 opus/48000/2".to_string());
                lines.push("a=fmtp:111 minptime=10;useinbandfec=1".to_string());
                lines.push(format!("a=ssrc:{} cname:ghostline", audio_ssrc));
                lines.push(format!("a=ssrc:{} msid:stream audio0", audio_ssrc));
            }
            MediaKind::Video => {
                lines.push("m=video 9 UDP/TLS/RTP/SAVPF 96".to_string());
                lines.push("c=IN IP4 0.0.0.0".to_string());
                lines.push("a=rtcp:9 IN IP4 0.0.0.0".to_string());
                for c in &signal.candidates {
                    lines.push(format!("a=candidate:{}", c));
                }
                lines.push("a=end-of-candidates".to_string());
                lines.push(format!("a=ice-ufrag:{}", ufrag));
                lines.push(format!("a=ice-pwd:{}", pwd));
                lines.push(format!("a=fingerprint:{}", fingerprint));
                lines.push(format!("a=setup:{}", setup));
                lines.push(format!("a=mid:{}", mid));
                lines.push("a=extmap:2 urn:ietf:params:rtp-hdrext:toffset".to_string());
                lines.push("a=sendrecv".to_string());
                lines.push("a=msid:stream video0".to_string());
                lines.push("a=rtcp-mux".to_string());
                lines.push("a=rtcp-rsize".to_string());
                lines.push("a=rtpmap:96 VP8/90000".to_string());
                lines.push("a=rtcp-fb:96 ccm fir".to_string());
                lines.push("a=rtcp-fb:96 nack".to_string());
                lines.push("a=rtcp-fb:96 nack pli".to_string());
                lines.push("a=rtcp-fb:96 goog-remb".to_string());
                lines.push(format!("a=ssrc:{} cname:ghostline", video_ssrc));
                lines.push(format!("a=ssrc:{} msid:stream video0", video_ssrc));
            }
        }
    }

    Ok(lines.join("\r\n") + "\r\n")
}

fn required<'a>(field: &'a Option<String>, name: &str) -> ChatResult<&'a str> {
    field
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ChatError::SignalDecode(format!("signal missing {}", name)))
}
