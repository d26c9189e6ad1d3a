//! Inter-node control messages.
//!
//! Every bus message is a flat string-to-string JSON object with a `type`
//! key, the sending node under `src`, and `dst` when it targets a single
//! node's channel. Unknown keys are ignored so nodes of different
//! versions can share a bus.

use std::collections::HashMap;

/// The well-known channel every node subscribes to for discovery.
pub const BROADCAST_CHANNEL: &str = "webrtc_cdn";

/// Payload of an inter-node message, without routing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Who owns this stream?
    Resolve { sid: String },
    /// The sender owns the stream.
    Info { sid: String },
    /// Open an outbound media path for the stream toward the sender.
    Connect { sid: String },
    /// SDP offer for an inter-node media session.
    Offer {
        sid: String,
        sdp: String,
        has_video: bool,
        has_audio: bool,
    },
    /// SDP answer for an inter-node media session.
    Answer { sid: String, sdp: String },
    /// Trickled ICE candidate; empty data marks end-of-candidates.
    Candidate { sid: String, candidate: String },
}

impl BusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::Resolve { .. } => "RESOLVE",
            BusMessage::Info { .. } => "INFO",
            BusMessage::Connect { .. } => "CONNECT",
            BusMessage::Offer { .. } => "OFFER",
            BusMessage::Answer { .. } => "ANSWER",
            BusMessage::Candidate { .. } => "CANDIDATE",
        }
    }

    pub fn sid(&self) -> &str {
        match self {
            BusMessage::Resolve { sid }
            | BusMessage::Info { sid }
            | BusMessage::Connect { sid }
            | BusMessage::Offer { sid, .. }
            | BusMessage::Answer { sid, .. }
            | BusMessage::Candidate { sid, .. } => sid,
        }
    }
}

/// A bus message together with its routing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEnvelope {
    pub src: String,
    pub dst: Option<String>,
    pub message: BusMessage,
}

impl BusEnvelope {
    /// Encodes to the flat-map JSON wire form.
    pub fn encode(&self) -> String {
        let mut map: HashMap<&str, &str> = HashMap::new();
        map.insert("type", self.message.kind());
        map.insert("src", &self.src);
        if let Some(dst) = &self.dst {
            map.insert("dst", dst);
        }
        map.insert("sid", self.message.sid());

        match &self.message {
            BusMessage::Offer {
                sdp,
                has_video,
                has_audio,
                ..
            } => {
                if *has_video {
                    map.insert("video", "true");
                }
                if *has_audio {
                    map.insert("audio", "true");
                }
                map.insert("data", sdp);
            }
            BusMessage::Answer { sdp, .. } => {
                map.insert("data", sdp);
            }
            BusMessage::Candidate { candidate, .. } => {
                map.insert("data", candidate);
            }
            BusMessage::Resolve { .. } | BusMessage::Info { .. } | BusMessage::Connect { .. } => {}
        }

        serde_json::to_string(&map).unwrap_or_default()
    }

    /// Decodes a raw bus payload. Returns `None` for anything that is not
    /// a well-formed message of a known type.
    pub fn decode(raw: &str) -> Option<BusEnvelope> {
        let mut map: HashMap<String, String> = serde_json::from_str(raw).ok()?;
        let kind = map.remove("type")?.to_ascii_uppercase();
        let src = map.remove("src")?;
        let dst = map.remove("dst");
        let sid = map.remove("sid")?;

        let message = match kind.as_str() {
            "RESOLVE" => BusMessage::Resolve { sid },
            "INFO" => BusMessage::Info { sid },
            "CONNECT" => BusMessage::Connect { sid },
            "OFFER" => BusMessage::Offer {
                sid,
                sdp: map.remove("data").unwrap_or_default(),
                has_video: map.get("video").map(String::as_str) == Some("true"),
                has_audio: map.get("audio").map(String::as_str) == Some("true"),
            },
            "ANSWER" => BusMessage::Answer {
                sid,
                sdp: map.remove("data").unwrap_or_default(),
            },
            "CANDIDATE" => BusMessage::Candidate {
                sid,
                candidate: map.remove("data").unwrap_or_default(),
            },
            _ => return None,
        };

        Some(BusEnvelope { src, dst, message })
    }
}
