//! Publisher-side media endpoint. Ingests a client's RTP and owns the
//! forwarding tracks that sinks and senders fan out.

use std::sync::{Arc, Weak};

use castgrid_protocol::StreamKind;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::{
    apply_remote_answer, apply_remote_candidate, discard_peer_connection, pipe,
    send_local_candidate, TrackPair, WebRtcEngine,
};
use crate::registry::Registry;
use crate::ws::SessionHandle;

pub struct Source {
    sid: String,
    request_id: String,
    has_video: bool,
    has_audio: bool,
    session: SessionHandle,
    registry: Weak<Registry>,
    engine: Arc<WebRtcEngine>,
    state: Mutex<SourceState>,
}

#[derive(Default)]
struct SourceState {
    pc: Option<Arc<RTCPeerConnection>>,
    pair: TrackPair,
    ready: bool,
    closed: bool,
}

impl Source {
    pub fn new(
        sid: String,
        request_id: String,
        kind: StreamKind,
        session: SessionHandle,
        registry: Weak<Registry>,
        engine: Arc<WebRtcEngine>,
    ) -> Self {
        Self {
            has_video: kind.has_video(),
            has_audio: kind.has_audio(),
            sid,
            request_id,
            session,
            registry,
            engine,
            state: Mutex::new(SourceState::default()),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Snapshot of the forwarding tracks, set or not.
    pub async fn pair(&self) -> TrackPair {
        self.state.lock().await.pair.clone()
    }

    /// The forwarding tracks, only once the source has been marked ready.
    pub async fn ready_pair(&self) -> Option<TrackPair> {
        let state = self.state.lock().await;
        state.ready.then(|| state.pair.clone())
    }

    pub(crate) async fn mark_ready(&self) -> TrackPair {
        let mut state = self.state.lock().await;
        state.ready = true;
        state.pair.clone()
    }

    /// Builds the ingest peer connection and sends the client its OFFER.
    pub async fn run(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }

        let pc = match self.engine.new_peer_connection().await {
            Ok(pc) => pc,
            Err(err) => {
                warn!(stream = %self.sid, error = %err, "creating publisher peer connection");
                drop(state);
                self.close(true, true).await;
                return;
            }
        };
        state.pc = Some(pc.clone());

        let source = Arc::downgrade(&self);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let source = source.clone();
            Box::pin(async move {
                if let Some(source) = source.upgrade() {
                    source.on_track(track).await;
                }
            })
        }));

        let session = self.session.clone();
        let request_id = self.request_id.clone();
        let sid = self.sid.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let session = session.clone();
            let request_id = request_id.clone();
            let sid = sid.clone();
            Box::pin(async move {
                send_local_candidate(&session, &request_id, &sid, candidate);
            })
        }));

        let source = Arc::downgrade(&self);
        pc.on_peer_connection_state_change(Box::new(move |pc_state| {
            let source = source.clone();
            Box::pin(async move {
                match pc_state {
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                        if let Some(source) = source.upgrade() {
                            source.on_peer_disconnected().await;
                        }
                    }
                    RTCPeerConnectionState::Connected => {
                        debug!("publisher peer connected");
                    }
                    _ => {}
                }
            })
        }));

        let offer_json = match self.negotiate(&pc).await {
            Ok(json) => json,
            Err(err) => {
                warn!(stream = %self.sid, error = %err, "negotiating publisher offer");
                drop(state);
                self.close(true, true).await;
                return;
            }
        };
        drop(state);

        self.session.send_offer(&self.request_id, &self.sid, offer_json);
    }

    async fn negotiate(&self, pc: &Arc<RTCPeerConnection>) -> crate::error::Result<String> {
        let recvonly = || {
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            })
        };
        if self.has_video {
            pc.add_transceiver_from_kind(RTPCodecType::Video, recvonly()).await?;
        }
        if self.has_audio {
            pc.add_transceiver_from_kind(RTPCodecType::Audio, recvonly()).await?;
        }
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_string(&offer)?)
    }

    /// A remote track arrived: wrap it into a forwarding track, start the
    /// pipe, and report readiness once every expected track is in.
    async fn on_track(self: &Arc<Self>, track: Arc<TrackRemote>) {
        let became_ready = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            match track.kind() {
                RTPCodecType::Video => {
                    if state.pair.video.is_some() {
                        return;
                    }
                    let local = Arc::new(TrackLocalStaticRTP::new(
                        track.codec().capability.clone(),
                        "video".to_string(),
                        self.sid.clone(),
                    ));
                    state.pair.video = Some(local.clone());
                    if let Some(pc) = state.pc.clone() {
                        pipe::spawn_pli_ticker(pc, track.ssrc());
                    }
                    pipe::spawn_track_pipe(track, local);
                }
                RTPCodecType::Audio => {
                    if state.pair.audio.is_some() {
                        return;
                    }
                    let local = Arc::new(TrackLocalStaticRTP::new(
                        track.codec().capability.clone(),
                        "audio".to_string(),
                        self.sid.clone(),
                    ));
                    state.pair.audio = Some(local.clone());
                    pipe::spawn_track_pipe(track, local);
                }
                _ => return,
            }
            (!self.has_audio || state.pair.audio.is_some())
                && (!self.has_video || state.pair.video.is_some())
        };

        if became_ready {
            debug!(stream = %self.sid, request = %self.request_id, "source ready");
            if let Some(registry) = self.registry.upgrade() {
                registry.on_source_ready(self).await;
            }
        }
    }

    /// ANSWER relayed by the session from the client.
    pub async fn on_answer(&self, answer_json: &str) {
        let state = self.state.lock().await;
        let Some(pc) = state.pc.clone() else { return };
        apply_remote_answer(&pc, answer_json, "publisher").await;
    }

    /// Trickled ICE candidate from the client; empty means done.
    pub async fn on_ice_candidate(&self, candidate_json: &str) {
        let state = self.state.lock().await;
        let Some(pc) = state.pc.clone() else { return };
        apply_remote_candidate(&pc, candidate_json, "publisher").await;
    }

    /// The media library reported the connection gone.
    async fn on_peer_disconnected(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(pc) = state.pc.take() {
                discard_peer_connection(pc);
            }
        }
        debug!(stream = %self.sid, request = %self.request_id, "publisher disconnected");
        self.session.send_source_close(&self.request_id, &self.sid);
        if let Some(registry) = self.registry.upgrade() {
            registry.on_source_closed(self).await;
        }
    }

    /// Shuts the source down. `notify_connection` sends the client a
    /// CLOSE frame; `deregister` reports the closure to the registry and
    /// must never be set when the registry itself is the caller.
    pub async fn close(self: &Arc<Self>, notify_connection: bool, deregister: bool) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(pc) = state.pc.take() {
                discard_peer_connection(pc);
            }
        }
        if notify_connection {
            self.session.send_source_close(&self.request_id, &self.sid);
        }
        if deregister {
            if let Some(registry) = self.registry.upgrade() {
                registry.on_source_closed(self).await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn install_tracks_for_test(&self) {
        use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

        let mut state = self.state.lock().await;
        if self.has_video {
            state.pair.video = Some(Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    ..Default::default()
                },
                "video".to_string(),
                self.sid.clone(),
            )));
        }
        if self.has_audio {
            state.pair.audio = Some(Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    ..Default::default()
                },
                "audio".to_string(),
                self.sid.clone(),
            )));
        }
    }
}
