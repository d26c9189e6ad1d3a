//! Inbound inter-node media endpoint. Receives a remote source's tracks
//! and exposes them locally as if the source were here.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::{apply_remote_candidate, discard_peer_connection, pipe, TrackPair, WebRtcEngine};
use crate::bus::BusHandle;
use crate::registry::Registry;

pub struct Relay {
    sid: String,
    remote_id: String,
    registry: Weak<Registry>,
    bus: BusHandle,
    engine: Arc<WebRtcEngine>,
    state: Mutex<RelayState>,
}

#[derive(Default)]
struct RelayState {
    pc: Option<Arc<RTCPeerConnection>>,
    pair: TrackPair,
    has_video: bool,
    has_audio: bool,
    ready: bool,
    closed: bool,
}

impl Relay {
    pub(crate) fn new(
        sid: &str,
        remote_id: &str,
        registry: Weak<Registry>,
        bus: BusHandle,
        engine: Arc<WebRtcEngine>,
    ) -> Self {
        Self {
            sid: sid.to_string(),
            remote_id: remote_id.to_string(),
            registry,
            bus,
            engine,
            state: Mutex::new(RelayState::default()),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// The forwarding tracks, only once the relay has been marked ready.
    pub async fn ready_pair(&self) -> Option<TrackPair> {
        let state = self.state.lock().await;
        state.ready.then(|| state.pair.clone())
    }

    pub(crate) async fn mark_ready(&self) -> TrackPair {
        let mut state = self.state.lock().await;
        state.ready = true;
        state.pair.clone()
    }

    /// OFFER from the owning node: build the receiving connection and
    /// answer it over the bus.
    pub(crate) async fn on_offer(self: Arc<Self>, offer_json: String, has_video: bool, has_audio: bool) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.has_video = has_video;
        state.has_audio = has_audio;
        if let Some(pc) = state.pc.take() {
            discard_peer_connection(pc);
        }

        let pc = match self.engine.new_peer_connection().await {
            Ok(pc) => pc,
            Err(err) => {
                warn!(stream = %self.sid, remote = %self.remote_id, error = %err, "creating relay peer connection");
                drop(state);
                self.on_peer_disconnected().await;
                return;
            }
        };
        state.pc = Some(pc.clone());

        let relay = Arc::downgrade(&self);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let relay = relay.clone();
            Box::pin(async move {
                if let Some(relay) = relay.upgrade() {
                    relay.on_track(track).await;
                }
            })
        }));

        let bus = self.bus.clone();
        let remote_id = self.remote_id.clone();
        let sid = self.sid.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let bus = bus.clone();
            let remote_id = remote_id.clone();
            let sid = sid.clone();
            Box::pin(async move {
                bus.send_local_candidate(&remote_id, &sid, candidate);
            })
        }));

        let relay = Arc::downgrade(&self);
        pc.on_peer_connection_state_change(Box::new(move |pc_state| {
            let relay = relay.clone();
            Box::pin(async move {
                match pc_state {
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                        if let Some(relay) = relay.upgrade() {
                            relay.on_peer_disconnected().await;
                        }
                    }
                    RTCPeerConnectionState::Connected => {
                        debug!("relay peer connected");
                    }
                    _ => {}
                }
            })
        }));

        let result: crate::error::Result<String> = async {
            let offer = serde_json::from_str::<RTCSessionDescription>(&offer_json)?;
            pc.set_remote_description(offer).await?;
            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer.clone()).await?;
            Ok(serde_json::to_string(&answer)?)
        }
        .await;

        match result {
            Ok(answer_json) => {
                self.bus.send_answer(&self.remote_id, &self.sid, answer_json);
            }
            Err(err) => {
                warn!(stream = %self.sid, remote = %self.remote_id, error = %err, "answering relay offer");
            }
        }
    }

    /// A mirrored track arrived from the owning node.
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
            (!state.has_audio || state.pair.audio.is_some())
                && (!state.has_video || state.pair.video.is_some())
        };

        if became_ready {
            debug!(stream = %self.sid, remote = %self.remote_id, "relay ready");
            if let Some(registry) = self.registry.upgrade() {
                registry.on_relay_ready(self).await;
            }
        }
    }

    /// CANDIDATE from the owning node; empty means done.
    pub(crate) async fn on_ice_candidate(&self, candidate_json: &str) {
        let state = self.state.lock().await;
        let Some(pc) = state.pc.clone() else { return };
        apply_remote_candidate(&pc, candidate_json, "relay").await;
    }

    /// The media path died: tear down locally, then let the registry put
    /// the sinks back on standby and re-resolve the stream. The pair the
    /// sinks were given is captured before it is cleared so they can
    /// match it by identity.
    async fn on_peer_disconnected(self: &Arc<Self>) {
        let prev = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let prev = std::mem::take(&mut state.pair);
            state.has_video = false;
            state.has_audio = false;
            if let Some(pc) = state.pc.take() {
                discard_peer_connection(pc);
            }
            prev
        };
        debug!(stream = %self.sid, remote = %self.remote_id, "relay disconnected");
        if let Some(registry) = self.registry.upgrade() {
            registry.on_relay_closed(self, &prev).await;
        }
    }

    /// Registry-side teardown: replaced, no sinks left, or a local source
    /// took over the sid.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.pair = TrackPair::default();
        state.has_video = false;
        state.has_audio = false;
        if let Some(pc) = state.pc.take() {
            discard_peer_connection(pc);
        }
    }

    #[cfg(test)]
    pub(crate) async fn install_tracks_for_test(&self, has_video: bool, has_audio: bool) {
        use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

        let mut state = self.state.lock().await;
        state.has_video = has_video;
        state.has_audio = has_audio;
        if has_video {
            state.pair.video = Some(Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    ..Default::default()
                },
                "video".to_string(),
                self.sid.clone(),
            )));
        }
        if has_audio {
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
