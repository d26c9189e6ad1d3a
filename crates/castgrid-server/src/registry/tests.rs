use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use castgrid_protocol::bus::{BusEnvelope, BusMessage};
use castgrid_protocol::{SignalingMessage, StreamKind};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::Registry;
use crate::bus::{BusHandle, BusOutbound};
use crate::media::{Sink, Source, TrackPair, WebRtcEngine};
use crate::state::{Config, IpAllowList};
use crate::ws::SessionHandle;

const SID: &str = "demo";

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        standalone: true,
        stun_servers: Vec::new(),
        turn_server: None,
        jwt_secret: None,
        ip_limit: 4,
        request_limit: 100,
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(60),
        ip_allow_list: IpAllowList::default(),
    }
}

struct TestNode {
    registry: Arc<Registry>,
    bus_rx: mpsc::UnboundedReceiver<BusOutbound>,
}

fn test_node() -> TestNode {
    let engine = Arc::new(WebRtcEngine::new(&test_config()).expect("engine builds"));
    let (bus, bus_rx) = BusHandle::channel("local-node".to_string());
    let registry = Arc::new(Registry::new(bus, engine, 4));
    TestNode { registry, bus_rx }
}

fn new_source(
    registry: &Arc<Registry>,
    request_id: &str,
    session: &SessionHandle,
) -> Arc<Source> {
    Arc::new(Source::new(
        SID.to_string(),
        request_id.to_string(),
        StreamKind::Dual,
        session.clone(),
        Arc::downgrade(registry),
        registry.engine().clone(),
    ))
}

fn new_sink(registry: &Arc<Registry>, request_id: &str, session: &SessionHandle) -> Arc<Sink> {
    Arc::new(Sink::new(
        registry.next_sink_id(),
        SID.to_string(),
        request_id.to_string(),
        session.clone(),
        Arc::downgrade(registry),
        registry.engine().clone(),
    ))
}

async fn next_bus_message(rx: &mut mpsc::UnboundedReceiver<BusOutbound>) -> (String, BusEnvelope) {
    let outbound = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bus message within deadline")
        .expect("bus queue open");
    let envelope = BusEnvelope::decode(&outbound.payload).expect("decodable bus payload");
    (outbound.channel, envelope)
}

async fn wait_for_frame(
    rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    method: &str,
) -> SignalingMessage {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("no {method} frame within deadline"))
            .expect("session channel open");
        if frame.method == method {
            return frame;
        }
    }
}

#[tokio::test]
async fn resolve_reflects_registered_sources() {
    let mut node = test_node();
    let (session, _session_rx) = SessionHandle::channel(1);

    assert!(!node.registry.resolve_source(SID).await);
    node.registry
        .register_source(new_source(&node.registry, "r1", &session))
        .await;
    assert!(node.registry.resolve_source(SID).await);

    let (_, envelope) = next_bus_message(&mut node.bus_rx).await;
    assert_eq!(envelope.message, BusMessage::Info { sid: SID.into() });
}

#[tokio::test]
async fn waiting_sink_resolves_then_relays_then_yields_to_local_source() {
    let mut node = test_node();
    let (session, _session_rx) = SessionHandle::channel(1);

    node.registry
        .register_sink(new_sink(&node.registry, "r1", &session))
        .await;
    let (channel, envelope) = next_bus_message(&mut node.bus_rx).await;
    assert_eq!(channel, "webrtc_cdn");
    assert_eq!(envelope.message, BusMessage::Resolve { sid: SID.into() });

    // A RESOLVE reply from a remote owner creates the relay and CONNECTs.
    node.registry.receive_info_message("node-b", SID).await;
    assert!(node.registry.has_relay(SID).await);
    let (channel, envelope) = next_bus_message(&mut node.bus_rx).await;
    assert_eq!(channel, "node-b");
    assert_eq!(envelope.dst.as_deref(), Some("node-b"));
    assert_eq!(envelope.message, BusMessage::Connect { sid: SID.into() });

    // A local publisher for the same sid evicts the relay: the two never
    // coexist.
    node.registry
        .register_source(new_source(&node.registry, "r2", &session))
        .await;
    assert!(node.registry.resolve_source(SID).await);
    assert!(!node.registry.has_relay(SID).await);
}

#[tokio::test]
async fn duplicate_publish_closes_the_previous_session_request() {
    let mut node = test_node();
    let (session_a, mut rx_a) = SessionHandle::channel(1);
    let (session_b, _rx_b) = SessionHandle::channel(2);

    node.registry
        .register_source(new_source(&node.registry, "r1", &session_a))
        .await;
    next_bus_message(&mut node.bus_rx).await; // INFO for the first source

    node.registry
        .register_source(new_source(&node.registry, "r1b", &session_b))
        .await;

    let close = wait_for_frame(&mut rx_a, "CLOSE").await;
    assert_eq!(close.param("request-id"), Some("r1"));
    assert_eq!(close.param("stream-id"), Some(SID));

    let (_, envelope) = next_bus_message(&mut node.bus_rx).await;
    assert_eq!(envelope.message, BusMessage::Info { sid: SID.into() });
    assert!(node.registry.resolve_source(SID).await);
}

#[tokio::test]
async fn remote_info_closes_local_source() {
    let mut node = test_node();
    let (session, mut session_rx) = SessionHandle::channel(1);

    node.registry
        .register_source(new_source(&node.registry, "r1", &session))
        .await;
    next_bus_message(&mut node.bus_rx).await; // INFO

    node.registry.receive_info_message("node-b", SID).await;
    assert!(!node.registry.resolve_source(SID).await);

    let close = wait_for_frame(&mut session_rx, "CLOSE").await;
    assert_eq!(close.param("request-id"), Some("r1"));

    // No sinks were waiting, so no relay was set up.
    assert!(!node.registry.has_relay(SID).await);
}

#[tokio::test]
async fn connect_without_a_source_is_ignored() {
    let node = test_node();
    node.registry.receive_connect_message("node-b", SID).await;
    assert_eq!(node.registry.sender_count(SID).await, 0);
}

#[tokio::test]
async fn ready_source_feeds_sinks_and_senders() {
    let mut node = test_node();
    let (publish_session, _publish_rx) = SessionHandle::channel(1);
    let (play_session, mut play_rx) = SessionHandle::channel(2);

    let source = new_source(&node.registry, "r1", &publish_session);
    node.registry.register_source(source.clone()).await;
    next_bus_message(&mut node.bus_rx).await; // INFO

    let sink = new_sink(&node.registry, "r2", &play_session);
    node.registry.register_sink(sink).await;
    next_bus_message(&mut node.bus_rx).await; // RESOLVE, source not ready yet

    node.registry.receive_connect_message("node-b", SID).await;
    assert_eq!(node.registry.sender_count(SID).await, 1);

    source.install_tracks_for_test().await;
    node.registry.on_source_ready(&source).await;

    // The sink renegotiates with the client.
    let offer = wait_for_frame(&mut play_rx, "OFFER").await;
    assert_eq!(offer.param("request-id"), Some("r2"));
    assert_eq!(offer.param("stream-id"), Some(SID));
    assert!(offer.body.contains("\"type\":\"offer\""));

    // The sender offers the mirrored tracks to the asking node.
    loop {
        let (channel, envelope) = next_bus_message(&mut node.bus_rx).await;
        match envelope.message {
            BusMessage::Offer {
                sid,
                has_video,
                has_audio,
                ..
            } => {
                assert_eq!(channel, "node-b");
                assert_eq!(sid, SID);
                assert!(has_video);
                assert!(has_audio);
                break;
            }
            // ICE candidates may trickle out before the offer is observed.
            BusMessage::Candidate { .. } => continue,
            other => panic!("unexpected bus message {other:?}"),
        }
    }
}

#[tokio::test]
async fn closed_source_drops_senders_and_parks_sinks() {
    let node = test_node();
    let (publish_session, _publish_rx) = SessionHandle::channel(1);
    let (play_session, mut play_rx) = SessionHandle::channel(2);

    let source = new_source(&node.registry, "r1", &publish_session);
    node.registry.register_source(source.clone()).await;
    source.install_tracks_for_test().await;
    node.registry.on_source_ready(&source).await;

    // A sink arriving after readiness is wired up immediately.
    let sink = new_sink(&node.registry, "r2", &play_session);
    node.registry.register_sink(sink).await;
    wait_for_frame(&mut play_rx, "OFFER").await;

    node.registry.receive_connect_message("node-b", SID).await;
    assert_eq!(node.registry.sender_count(SID).await, 1);

    node.registry.on_source_closed(&source).await;

    assert!(!node.registry.resolve_source(SID).await);
    assert_eq!(node.registry.sender_count(SID).await, 0);

    let standby = wait_for_frame(&mut play_rx, "STANDBY").await;
    assert_eq!(standby.param("request-id"), Some("r2"));
}

#[tokio::test]
async fn stale_source_close_does_not_disturb_the_replacement() {
    let mut node = test_node();
    let (session_a, _rx_a) = SessionHandle::channel(1);
    let (session_b, _rx_b) = SessionHandle::channel(2);

    let old = new_source(&node.registry, "r1", &session_a);
    node.registry.register_source(old.clone()).await;
    node.registry
        .register_source(new_source(&node.registry, "r2", &session_b))
        .await;

    // The old source's late close callback finds itself replaced.
    node.registry.on_source_closed(&old).await;
    assert!(node.registry.resolve_source(SID).await);
    next_bus_message(&mut node.bus_rx).await;
    next_bus_message(&mut node.bus_rx).await;
}

#[tokio::test]
async fn last_sink_removed_takes_the_relay_down() {
    let mut node = test_node();
    let (session, _session_rx) = SessionHandle::channel(1);

    let sink = new_sink(&node.registry, "r1", &session);
    node.registry.register_sink(sink.clone()).await;
    node.registry.receive_info_message("node-b", SID).await;
    assert!(node.registry.has_relay(SID).await);
    next_bus_message(&mut node.bus_rx).await; // RESOLVE
    next_bus_message(&mut node.bus_rx).await; // CONNECT

    sink.close().await;

    assert_eq!(node.registry.sink_count(SID).await, 0);
    assert!(!node.registry.has_relay(SID).await);
}

#[tokio::test]
async fn relay_loss_rebroadcasts_resolve_while_sinks_remain() {
    let mut node = test_node();
    let (session, mut session_rx) = SessionHandle::channel(1);

    node.registry
        .register_sink(new_sink(&node.registry, "r1", &session))
        .await;
    node.registry.receive_info_message("node-b", SID).await;
    next_bus_message(&mut node.bus_rx).await; // RESOLVE
    next_bus_message(&mut node.bus_rx).await; // CONNECT

    let relay = node.registry.relay(SID).await.expect("relay exists");
    node.registry.on_relay_closed(&relay, &TrackPair::default()).await;

    assert!(!node.registry.has_relay(SID).await);
    let (channel, envelope) = next_bus_message(&mut node.bus_rx).await;
    assert_eq!(channel, "webrtc_cdn");
    assert_eq!(envelope.message, BusMessage::Resolve { sid: SID.into() });
    wait_for_frame(&mut session_rx, "STANDBY").await;
}

#[tokio::test]
async fn relay_tracks_feed_waiting_sinks() {
    let mut node = test_node();
    let (session, mut session_rx) = SessionHandle::channel(1);

    node.registry
        .register_sink(new_sink(&node.registry, "r1", &session))
        .await;
    node.registry.receive_info_message("node-b", SID).await;

    let relay = node.registry.relay(SID).await.expect("relay exists");
    relay.install_tracks_for_test(true, true).await;
    node.registry.on_relay_ready(&relay).await;

    let offer = wait_for_frame(&mut session_rx, "OFFER").await;
    assert_eq!(offer.param("request-id"), Some("r1"));
}

#[tokio::test]
async fn answer_and_candidate_for_unknown_peers_are_ignored() {
    let node = test_node();
    node.registry
        .receive_answer_message("node-b", SID, "{\"type\":\"answer\",\"sdp\":\"\"}")
        .await;
    node.registry.receive_candidate_message("node-b", SID, "").await;
}

#[tokio::test]
async fn ip_limit_is_enforced_across_concurrent_sessions() {
    let node = test_node();
    let ip: IpAddr = "203.0.113.9".parse().unwrap();

    let mut admitted = 0;
    for _ in 0..8 {
        if node.registry.try_add_ip(ip).await {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 4);
    assert_eq!(node.registry.ip_count_for(ip).await, 4);

    for _ in 0..4 {
        node.registry.remove_ip(ip).await;
    }
    assert_eq!(node.registry.ip_count_for(ip).await, 0);
}

#[tokio::test]
async fn ip_count_matches_live_sessions_under_interleaving() {
    let node = test_node();
    let ip: IpAddr = "198.51.100.7".parse().unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let registry = node.registry.clone();
        handles.push(tokio::spawn(async move {
            if registry.try_add_ip(ip).await {
                tokio::task::yield_now().await;
                registry.remove_ip(ip).await;
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task completes");
    }

    assert_eq!(node.registry.ip_count_for(ip).await, 0);
}
