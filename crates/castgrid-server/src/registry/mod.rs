//! Per-node stream registry. Indexes sources, relays, sinks and senders
//! by stream id, enforces the uniqueness and replacement rules between
//! them, and fans track availability out to whoever consumes it.
//!
//! All cross-entity transitions run under the registry lock. Anything
//! that would block on the media plane from inside a critical section is
//! handed to a fresh task instead, and entities never call back into the
//! registry while holding their own lock.

mod inter_node;
mod sinks;
mod sources;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::BusHandle;
use crate::media::{Relay, Sender, Sink, Source, WebRtcEngine};
use crate::ws::SessionHandle;

pub struct Registry {
    bus: BusHandle,
    engine: Arc<WebRtcEngine>,
    ip_limit: u32,
    state: Mutex<State>,
    ip_count: Mutex<HashMap<IpAddr, u32>>,
    session_seq: AtomicU64,
    sink_seq: AtomicU64,
}

#[derive(Default)]
struct State {
    connections: HashMap<u64, SessionHandle>,
    sources: HashMap<String, Arc<Source>>,
    relays: HashMap<String, Arc<Relay>>,
    sinks: HashMap<String, HashMap<u64, Arc<Sink>>>,
    senders: HashMap<String, HashMap<String, Arc<Sender>>>,
}

impl Registry {
    pub fn new(bus: BusHandle, engine: Arc<WebRtcEngine>, ip_limit: u32) -> Self {
        Self {
            bus,
            engine,
            ip_limit,
            state: Mutex::new(State::default()),
            ip_count: Mutex::new(HashMap::new()),
            session_seq: AtomicU64::new(0),
            sink_seq: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        self.bus.node_id()
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<WebRtcEngine> {
        &self.engine
    }

    /// Node-unique id for a new signaling session.
    pub fn next_session_id(&self) -> u64 {
        self.session_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Node-unique id for a new sink.
    pub fn next_sink_id(&self) -> u64 {
        self.sink_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn add_session(&self, handle: SessionHandle) {
        self.state.lock().await.connections.insert(handle.id(), handle);
    }

    pub async fn remove_session(&self, session_id: u64) {
        self.state.lock().await.connections.remove(&session_id);
    }

    /// Admits one more session from `ip` unless it already holds the
    /// configured number of slots.
    pub async fn try_add_ip(&self, ip: IpAddr) -> bool {
        let mut counts = self.ip_count.lock().await;
        let count = counts.entry(ip).or_insert(0);
        if *count >= self.ip_limit {
            return false;
        }
        *count += 1;
        true
    }

    pub async fn remove_ip(&self, ip: IpAddr) {
        let mut counts = self.ip_count.lock().await;
        if let Some(count) = counts.get_mut(&ip) {
            if *count <= 1 {
                counts.remove(&ip);
            } else {
                *count -= 1;
            }
        }
    }
}

#[cfg(test)]
impl Registry {
    pub(crate) async fn has_relay(&self, sid: &str) -> bool {
        self.state.lock().await.relays.contains_key(sid)
    }

    pub(crate) async fn relay(&self, sid: &str) -> Option<Arc<Relay>> {
        self.state.lock().await.relays.get(sid).cloned()
    }

    pub(crate) async fn sink_count(&self, sid: &str) -> usize {
        self.state
            .lock()
            .await
            .sinks
            .get(sid)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub(crate) async fn sender_count(&self, sid: &str) -> usize {
        self.state
            .lock()
            .await
            .senders
            .get(sid)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub(crate) async fn ip_count_for(&self, ip: IpAddr) -> u32 {
        self.ip_count.lock().await.get(&ip).copied().unwrap_or(0)
    }
}
