//! Outbound inter-node media endpoint. Mirrors a local source's tracks
//! to the node that asked for them.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::{
    apply_remote_answer, apply_remote_candidate, discard_peer_connection, pipe, TrackPair,
    WebRtcEngine,
};
use crate::bus::BusHandle;
use crate::registry::Registry;

pub struct Sender {
    sid: String,
    remote_id: String,
    registry: Weak<Registry>,
    bus: BusHandle,
    engine: Arc<WebRtcEngine>,
    state: Mutex<SenderState>,
}

#[derive(Default)]
struct SenderState {
    pc: Option<Arc<RTCPeerConnection>>,
    pair: TrackPair,
    closed: bool,
}

impl Sender {
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
            state: Mutex::new(SenderState::default()),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// The local source's tracks are available (or were replaced):
    /// (re)start the outbound negotiation with them.
    pub(crate) async fn on_tracks_ready(self: &Arc<Self>, pair: TrackPair) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.pair = pair;
            if let Some(pc) = state.pc.take() {
                discard_peer_connection(pc);
            }
        }
        let sender = self.clone();
        tokio::spawn(async move { sender.run_after_tracks_ready().await });
    }

    async fn run_after_tracks_ready(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.closed || state.pair.is_empty() {
            return;
        }

        let pc = match self.engine.new_peer_connection().await {
            Ok(pc) => pc,
            Err(err) => {
                warn!(stream = %self.sid, remote = %self.remote_id, error = %err, "creating sender peer connection");
                return;
            }
        };
        state.pc = Some(pc.clone());

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

        let sender = Arc::downgrade(&self);
        pc.on_peer_connection_state_change(Box::new(move |pc_state| {
            let sender = sender.clone();
            Box::pin(async move {
                match pc_state {
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                        if let Some(sender) = sender.upgrade() {
                            sender.on_peer_disconnected().await;
                        }
                    }
                    RTCPeerConnectionState::Connected => {
                        debug!("sender peer connected");
                    }
                    _ => {}
                }
            })
        }));

        let has_video = state.pair.video.is_some();
        let has_audio = state.pair.audio.is_some();

        let result: crate::error::Result<String> = async {
            if let Some(audio) = state.pair.audio.clone() {
                let rtp_sender = pc
                    .add_track(audio as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                pipe::spawn_rtcp_drain(rtp_sender);
            }
            if let Some(video) = state.pair.video.clone() {
                let rtp_sender = pc
                    .add_track(video as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                pipe::spawn_rtcp_drain(rtp_sender);
            }
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            Ok(serde_json::to_string(&offer)?)
        }
        .await;

        match result {
            Ok(offer_json) => {
                self.bus
                    .send_offer(&self.remote_id, &self.sid, offer_json, has_video, has_audio);
            }
            Err(err) => {
                warn!(stream = %self.sid, remote = %self.remote_id, error = %err, "negotiating sender offer");
                if let Some(pc) = state.pc.take() {
                    discard_peer_connection(pc);
                }
            }
        }
    }

    /// ANSWER from the remote node.
    pub(crate) async fn on_answer(&self, answer_json: &str) {
        let state = self.state.lock().await;
        let Some(pc) = state.pc.clone() else { return };
        apply_remote_answer(&pc, answer_json, "sender").await;
    }

    /// CANDIDATE from the remote node; empty means done.
    pub(crate) async fn on_ice_candidate(&self, candidate_json: &str) {
        let state = self.state.lock().await;
        let Some(pc) = state.pc.clone() else { return };
        apply_remote_candidate(&pc, candidate_json, "sender").await;
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
        debug!(stream = %self.sid, remote = %self.remote_id, "sender disconnected");
        if let Some(registry) = self.registry.upgrade() {
            registry.on_sender_closed(self).await;
        }
    }

    /// Registry-side teardown: the source closed or was replaced.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.pair = TrackPair::default();
        if let Some(pc) = state.pc.take() {
            discard_peer_connection(pc);
        }
    }
}
