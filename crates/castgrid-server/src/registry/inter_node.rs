//! Registry transitions driven by inter-node bus traffic, plus the relay
//! and sender callbacks they give rise to.

use std::sync::Arc;

use tracing::debug;

use super::Registry;
use crate::media::{Relay, Sender, TrackPair};

impl Registry {
    /// INFO: another node claims `sid`. The newest publisher wins, so any
    /// local source is shut down. If local sinks are waiting, a relay
    /// toward the announcing node is set up and asked to CONNECT.
    pub async fn receive_info_message(self: &Arc<Self>, from: &str, sid: &str) {
        let mut state = self.state.lock().await;

        if let Some(source) = state.sources.remove(sid) {
            debug!(stream = %sid, remote = %from, "remote publisher takes over, closing local source");
            source.close(true, false).await;
        }

        let waiting = state.sinks.get(sid).map(|s| !s.is_empty()).unwrap_or(false);
        if !waiting {
            return;
        }

        if let Some(old) = state.relays.remove(sid) {
            old.close().await;
        }
        let relay = Arc::new(Relay::new(
            sid,
            from,
            Arc::downgrade(self),
            self.bus.clone(),
            self.engine.clone(),
        ));
        state.relays.insert(sid.to_string(), relay);

        self.bus.send_connect(from, sid);
    }

    /// CONNECT: a node wants `sid` relayed to it. Only meaningful while a
    /// local source exists; replaces any previous sender for that node.
    pub async fn receive_connect_message(self: &Arc<Self>, from: &str, sid: &str) {
        let mut state = self.state.lock().await;

        let Some(source) = state.sources.get(sid).cloned() else {
            return;
        };

        if let Some(senders) = state.senders.get_mut(sid) {
            if let Some(old) = senders.remove(from) {
                old.close().await;
            }
        }

        let sender = Arc::new(Sender::new(
            sid,
            from,
            Arc::downgrade(self),
            self.bus.clone(),
            self.engine.clone(),
        ));
        state
            .senders
            .entry(sid.to_string())
            .or_default()
            .insert(from.to_string(), sender.clone());

        if let Some(pair) = source.ready_pair().await {
            sender.on_tracks_ready(pair).await;
        }
    }

    /// OFFER: belongs to the relay for `sid`. The SDP work blocks on the
    /// media plane, so it runs on its own task, off the registry lock.
    pub async fn receive_offer_message(&self, sid: &str, sdp: String, has_video: bool, has_audio: bool) {
        let relay = self.state.lock().await.relays.get(sid).cloned();
        if let Some(relay) = relay {
            tokio::spawn(async move { relay.on_offer(sdp, has_video, has_audio).await });
        }
    }

    /// ANSWER: belongs to the sender negotiating with `from`.
    pub async fn receive_answer_message(&self, from: &str, sid: &str, sdp: &str) {
        let sender = {
            let state = self.state.lock().await;
            state.senders.get(sid).and_then(|m| m.get(from)).cloned()
        };
        if let Some(sender) = sender {
            sender.on_answer(sdp).await;
        }
    }

    /// CANDIDATE: may belong to either role of the inter-node session, so
    /// both the sender for `from` and the relay get a look.
    pub async fn receive_candidate_message(&self, from: &str, sid: &str, candidate: &str) {
        let (sender, relay) = {
            let state = self.state.lock().await;
            (
                state.senders.get(sid).and_then(|m| m.get(from)).cloned(),
                state.relays.get(sid).cloned(),
            )
        };
        if let Some(sender) = sender {
            sender.on_ice_candidate(candidate).await;
        }
        if let Some(relay) = relay {
            relay.on_ice_candidate(candidate).await;
        }
    }

    /// Marks the relay ready and hands its tracks to the waiting sinks.
    pub async fn on_relay_ready(&self, relay: &Arc<Relay>) {
        let state = self.state.lock().await;
        let pair = relay.mark_ready().await;
        if let Some(sinks) = state.sinks.get(relay.sid()) {
            for sink in sinks.values() {
                sink.on_tracks_ready(pair.clone()).await;
            }
        }
    }

    /// Runs after a relay's media path died. Sinks holding its tracks go
    /// back to standby, and if any sinks remain the stream is re-resolved
    /// so a new provider can be found.
    pub async fn on_relay_closed(&self, relay: &Arc<Relay>, pair: &TrackPair) {
        let sid = relay.sid();
        let mut state = self.state.lock().await;

        if let Some(current) = state.relays.get(sid) {
            if Arc::ptr_eq(current, relay) {
                state.relays.remove(sid);
            }
        }

        let Some(sinks) = state.sinks.get(sid) else {
            return;
        };
        for sink in sinks.values() {
            sink.on_tracks_closed(pair).await;
        }
        if !sinks.is_empty() {
            self.bus.send_resolve(sid);
        }
    }

    /// Detaches a sender that lost its connection.
    pub async fn on_sender_closed(&self, sender: &Arc<Sender>) {
        let mut state = self.state.lock().await;
        let Some(senders) = state.senders.get_mut(sender.sid()) else {
            return;
        };
        match senders.get(sender.remote_id()) {
            Some(current) if Arc::ptr_eq(current, sender) => {
                senders.remove(sender.remote_id());
            }
            _ => return,
        }
        if senders.is_empty() {
            state.senders.remove(sender.sid());
        }
    }
}
