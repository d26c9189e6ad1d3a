//! Subscriber-side media endpoint. Egresses a provider's forwarding
//! tracks to one client and renegotiates whenever the tracks change.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::{
    apply_remote_answer, apply_remote_candidate, discard_peer_connection, pipe,
    send_local_candidate, TrackPair, WebRtcEngine,
};
use crate::registry::Registry;
use crate::ws::SessionHandle;

pub struct Sink {
    sink_id: u64,
    sid: String,
    request_id: String,
    session: SessionHandle,
    registry: Weak<Registry>,
    engine: Arc<WebRtcEngine>,
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    pc: Option<Arc<RTCPeerConnection>>,
    pair: TrackPair,
    closed: bool,
}

impl Sink {
    pub fn new(
        sink_id: u64,
        sid: String,
        request_id: String,
        session: SessionHandle,
        registry: Weak<Registry>,
        engine: Arc<WebRtcEngine>,
    ) -> Self {
        Self {
            sink_id,
            sid,
            request_id,
            session,
            registry,
            engine,
            state: Mutex::new(SinkState::default()),
        }
    }

    pub fn sink_id(&self) -> u64 {
        self.sink_id
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// A provider's tracks became available or were replaced. Any current
    /// connection is discarded and negotiation restarts with the new pair.
    pub async fn on_tracks_ready(self: &Arc<Self>, pair: TrackPair) {
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
        let sink = self.clone();
        tokio::spawn(async move { sink.run_after_tracks_ready().await });
    }

    /// The provider went away. Only honoured when the tracks being closed
    /// are the exact ones this sink is forwarding.
    pub async fn on_tracks_closed(&self, pair: &TrackPair) {
        {
            let mut state = self.state.lock().await;
            if state.closed || !state.pair.same_tracks(pair) {
                return;
            }
            state.pair = TrackPair::default();
            if let Some(pc) = state.pc.take() {
                discard_peer_connection(pc);
            }
        }
        self.session.send_standby(&self.request_id);
    }

    /// Builds the egress peer connection around the current pair and
    /// offers it to the client.
    fn run_after_tracks_ready(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move { self.run_after_tracks_ready_inner().await })
    }

    async fn run_after_tracks_ready_inner(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.closed || state.pair.is_empty() {
            return;
        }

        let pc = match self.engine.new_peer_connection().await {
            Ok(pc) => pc,
            Err(err) => {
                warn!(stream = %self.sid, sink = self.sink_id, error = %err, "creating subscriber peer connection");
                drop(state);
                self.session.send_standby(&self.request_id);
                return;
            }
        };
        state.pc = Some(pc.clone());

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

        let sink = Arc::downgrade(&self);
        pc.on_peer_connection_state_change(Box::new(move |pc_state| {
            let sink = sink.clone();
            Box::pin(async move {
                match pc_state {
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                        if let Some(sink) = sink.upgrade() {
                            sink.reconnect().await;
                        }
                    }
                    RTCPeerConnectionState::Connected => {
                        debug!("subscriber peer connected");
                    }
                    _ => {}
                }
            })
        }));

        let result: crate::error::Result<String> = async {
            if let Some(audio) = state.pair.audio.clone() {
                let sender = pc
                    .add_track(audio as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                pipe::spawn_rtcp_drain(sender);
            }
            if let Some(video) = state.pair.video.clone() {
                let sender = pc
                    .add_track(video as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                pipe::spawn_rtcp_drain(sender);
            }
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            Ok(serde_json::to_string(&offer)?)
        }
        .await;

        match result {
            Ok(offer_json) => {
                drop(state);
                self.session.send_offer(&self.request_id, &self.sid, offer_json);
            }
            Err(err) => {
                warn!(stream = %self.sid, sink = self.sink_id, error = %err, "negotiating subscriber offer");
                if let Some(pc) = state.pc.take() {
                    discard_peer_connection(pc);
                }
                drop(state);
                self.session.send_standby(&self.request_id);
            }
        }
    }

    /// ANSWER relayed by the session from the client.
    pub async fn on_answer(&self, answer_json: &str) {
        let state = self.state.lock().await;
        let Some(pc) = state.pc.clone() else { return };
        apply_remote_answer(&pc, answer_json, "subscriber").await;
    }

    /// Trickled ICE candidate from the client; empty means done.
    pub async fn on_ice_candidate(&self, candidate_json: &str) {
        let state = self.state.lock().await;
        let Some(pc) = state.pc.clone() else { return };
        apply_remote_candidate(&pc, candidate_json, "subscriber").await;
    }

    /// The connection died while the sink is still live: rebuild it as
    /// long as the stream still has tracks.
    async fn reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if let Some(pc) = state.pc.take() {
                discard_peer_connection(pc);
            }
            if state.closed {
                return;
            }
            debug!(stream = %self.sid, sink = self.sink_id, "subscriber disconnected, retrying");
        }
        let sink = self.clone();
        tokio::spawn(async move { sink.run_after_tracks_ready().await });
    }

    /// Client CLOSE or session teardown.
    pub async fn close(self: &Arc<Self>) {
        {
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
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_sink(self).await;
        }
    }
}
