//! Sink-side registry transitions.

use std::sync::Arc;

use super::Registry;
use crate::media::Sink;

impl Registry {
    /// Indexes a sink. A sid with a ready provider wires the sink up
    /// immediately; otherwise the cluster is asked who owns the stream.
    pub async fn register_sink(&self, sink: Arc<Sink>) {
        let sid = sink.sid().to_string();
        let mut state = self.state.lock().await;

        state
            .sinks
            .entry(sid.clone())
            .or_default()
            .insert(sink.sink_id(), sink.clone());

        if let Some(source) = state.sources.get(&sid) {
            if let Some(pair) = source.ready_pair().await {
                sink.on_tracks_ready(pair).await;
                return;
            }
        }
        if let Some(relay) = state.relays.get(&sid) {
            if let Some(pair) = relay.ready_pair().await {
                sink.on_tracks_ready(pair).await;
                return;
            }
        }

        // Nothing local; maybe another node has it.
        self.bus.send_resolve(&sid);
    }

    /// Drops a sink. The last sink for a sid takes the sid's relay with
    /// it: no consumers means no reason to keep pulling the stream.
    pub async fn remove_sink(&self, sink: &Arc<Sink>) {
        let sid = sink.sid();
        let mut state = self.state.lock().await;

        let Some(sinks) = state.sinks.get_mut(sid) else {
            return;
        };
        if sinks.remove(&sink.sink_id()).is_none() {
            return;
        }
        if sinks.is_empty() {
            state.sinks.remove(sid);
            if let Some(relay) = state.relays.remove(sid) {
                relay.close().await;
            }
        }
    }
}
