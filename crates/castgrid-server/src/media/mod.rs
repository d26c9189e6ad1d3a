//! Media-plane entities and their shared track plumbing.

mod engine;
mod pipe;
mod relay;
mod sender;
mod sink;
mod source;

pub use engine::WebRtcEngine;
pub use relay::Relay;
pub use sender::Sender;
pub use sink::Sink;
pub use source::Source;

use std::sync::Arc;

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::ws::SessionHandle;

/// The (video, audio) forwarding tracks produced by a source or relay.
/// Either side may be absent.
#[derive(Clone, Default)]
pub struct TrackPair {
    pub video: Option<Arc<TrackLocalStaticRTP>>,
    pub audio: Option<Arc<TrackLocalStaticRTP>>,
}

impl TrackPair {
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Identity comparison. A sink must recognise the exact tracks it was
    /// handed earlier, not equivalent ones, so replacement is detectable.
    pub fn same_tracks(&self, other: &TrackPair) -> bool {
        fn same(a: &Option<Arc<TrackLocalStaticRTP>>, b: &Option<Arc<TrackLocalStaticRTP>>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
        }
        same(&self.video, &other.video) && same(&self.audio, &other.audio)
    }
}

/// Replaces a connection's callbacks with no-ops and closes it on a
/// background task. Every entity discards connections through here so a
/// late state-change callback cannot echo into the entity that already
/// moved on, and so no close blocks inside a critical section.
pub(crate) fn discard_peer_connection(pc: Arc<RTCPeerConnection>) {
    pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
    pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
    pc.on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
    tokio::spawn(async move {
        if let Err(err) = pc.close().await {
            debug!(error = %err, "closing discarded peer connection");
        }
    });
}

/// Applies a client's or remote node's SDP answer to a connection.
pub(crate) async fn apply_remote_answer(pc: &Arc<RTCPeerConnection>, answer_json: &str, what: &str) {
    let answer = match serde_json::from_str::<RTCSessionDescription>(answer_json) {
        Ok(sd) => sd,
        Err(err) => {
            warn!(error = %err, "invalid {what} answer");
            return;
        }
    };
    if let Err(err) = pc.set_remote_description(answer).await {
        warn!(error = %err, "applying {what} answer");
    }
}

/// Applies a trickled ICE candidate. An empty payload is the
/// end-of-candidates marker and is ignored here.
pub(crate) async fn apply_remote_candidate(
    pc: &Arc<RTCPeerConnection>,
    candidate_json: &str,
    what: &str,
) {
    if candidate_json.is_empty() {
        return;
    }
    let candidate = match serde_json::from_str::<RTCIceCandidateInit>(candidate_json) {
        Ok(c) => c,
        Err(err) => {
            warn!(error = %err, "invalid {what} candidate");
            return;
        }
    };
    if let Err(err) = pc.add_ice_candidate(candidate).await {
        warn!(error = %err, "adding {what} candidate");
    }
}

/// Forwards a locally gathered candidate to the signaling client. `None`
/// becomes the empty-body end-of-candidates frame.
pub(crate) fn send_local_candidate(
    session: &SessionHandle,
    request_id: &str,
    sid: &str,
    candidate: Option<RTCIceCandidate>,
) {
    let Some(candidate) = candidate else {
        session.send_candidate(request_id, sid, String::new());
        return;
    };
    match candidate.to_json() {
        Ok(init) => match serde_json::to_string(&init) {
            Ok(json) => session.send_candidate(request_id, sid, json),
            Err(err) => warn!(error = %err, "encoding local candidate"),
        },
        Err(err) => warn!(error = %err, "reading local candidate"),
    }
}
