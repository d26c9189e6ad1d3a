//! Source-side registry transitions.

use std::sync::Arc;

use castgrid_protocol::bus::BROADCAST_CHANNEL;
use tracing::debug;

use super::Registry;
use crate::media::Source;

impl Registry {
    /// Whether this node currently hosts a source for `sid`.
    pub async fn resolve_source(&self, sid: &str) -> bool {
        self.state.lock().await.sources.contains_key(sid)
    }

    /// Indexes a new source, tearing down whatever the sid had before:
    /// an older local source (whose session is told), any relay, and all
    /// senders. Finishes by announcing ownership to the cluster.
    pub async fn register_source(&self, source: Arc<Source>) {
        let sid = source.sid().to_string();
        let mut state = self.state.lock().await;

        if let Some(old) = state.sources.remove(&sid) {
            debug!(stream = %sid, request = old.request_id(), "replacing publisher");
            old.close(true, false).await;
        }
        if let Some(relay) = state.relays.remove(&sid) {
            relay.close().await;
        }
        if let Some(senders) = state.senders.remove(&sid) {
            for sender in senders.into_values() {
                sender.close().await;
            }
        }

        state.sources.insert(sid.clone(), source);
        self.bus.send_info(BROADCAST_CHANNEL, &sid);
    }

    /// Marks the source ready and fans its tracks out to the local sinks
    /// and to the senders mirroring it to other nodes.
    pub async fn on_source_ready(&self, source: &Arc<Source>) {
        let state = self.state.lock().await;
        let pair = source.mark_ready().await;
        let sid = source.sid();

        if let Some(sinks) = state.sinks.get(sid) {
            for sink in sinks.values() {
                sink.on_tracks_ready(pair.clone()).await;
            }
        }
        if let Some(senders) = state.senders.get(sid) {
            for sender in senders.values() {
                sender.on_tracks_ready(pair.clone()).await;
            }
        }
    }

    /// Runs after a source shut itself down (client close, session death,
    /// media failure). A source that was already replaced is no longer
    /// current; its teardown happened in `register_source`, so a late
    /// close callback must not touch the replacement's state.
    pub async fn on_source_closed(&self, source: &Arc<Source>) {
        let sid = source.sid();
        let mut state = self.state.lock().await;

        match state.sources.get(sid) {
            Some(current) if Arc::ptr_eq(current, source) => {}
            _ => return,
        }
        state.sources.remove(sid);

        if let Some(senders) = state.senders.remove(sid) {
            for sender in senders.into_values() {
                sender.close().await;
            }
        }
        if let Some(sinks) = state.sinks.get(sid) {
            let pair = source.pair().await;
            for sink in sinks.values() {
                sink.on_tracks_closed(&pair).await;
            }
        }
    }
}
