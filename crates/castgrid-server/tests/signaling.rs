//! Integration tests for the signaling surface.
//!
//! Each test boots a node in stand-alone mode on an ephemeral port and
//! talks to it over real WebSockets.
//!
//! Run with: cargo test -p castgrid-server --test signaling

use std::net::SocketAddr;
use std::time::Duration;

use castgrid_protocol::SignalingMessage;
use castgrid_server::state::IpAllowList;
use castgrid_server::{api, generate_node_id, AppState, Config};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

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

async fn start_node(config: Config) -> SocketAddr {
    let (state, bus_rx) = AppState::new(config, generate_node_id()).expect("state builds");
    drop(bus_rx); // stand-alone: nothing drains the bus

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener binds");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });
    addr
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connects");
    ws
}

async fn send_frame(ws: &mut WsClient, frame: SignalingMessage) {
    ws.send(Message::Text(frame.serialize().into()))
        .await
        .expect("frame sent");
}

/// Next frame with the wanted method, skipping CANDIDATE/HEARTBEAT noise.
async fn wait_for_method(ws: &mut WsClient, method: &str) -> SignalingMessage {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .unwrap_or_else(|_| panic!("no {method} frame within deadline"))
            .expect("stream open")
            .expect("read ok");
        if let Message::Text(text) = msg {
            let frame = SignalingMessage::parse(text.as_str());
            if frame.method == method {
                return frame;
            }
        }
    }
}

fn publish_frame(request_id: &str, sid: &str) -> SignalingMessage {
    SignalingMessage::new("PUBLISH")
        .with_param("request-id", request_id)
        .with_param("stream-id", sid)
        .with_param("stream-type", "DUAL")
        .with_param("auth", "")
}

fn play_frame(request_id: &str, sid: &str) -> SignalingMessage {
    SignalingMessage::new("PLAY")
        .with_param("request-id", request_id)
        .with_param("stream-id", sid)
        .with_param("auth", "")
}

#[tokio::test]
async fn non_ws_paths_get_the_banner() {
    let addr = start_node(test_config()).await;

    let body = reqwest::get(format!("http://{addr}/"))
        .await
        .expect("request ok")
        .text()
        .await
        .expect("body reads");
    assert!(body.contains("signaling"));

    let status = reqwest::get(format!("http://{addr}/anything/else"))
        .await
        .expect("request ok")
        .status();
    assert_eq!(status.as_u16(), 200);
}

#[tokio::test]
async fn publish_yields_ok_then_offer() {
    let addr = start_node(test_config()).await;
    let mut ws = connect(addr).await;

    send_frame(&mut ws, publish_frame("r1", "demo")).await;

    let ok = wait_for_method(&mut ws, "OK").await;
    assert_eq!(ok.param("request-id"), Some("r1"));

    let offer = wait_for_method(&mut ws, "OFFER").await;
    assert_eq!(offer.param("request-id"), Some("r1"));
    assert_eq!(offer.param("stream-id"), Some("demo"));

    let sdp: serde_json::Value = serde_json::from_str(&offer.body).expect("offer body is JSON");
    assert_eq!(sdp["type"], "offer");
    assert!(sdp["sdp"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn play_without_a_publisher_parks_on_standby() {
    let addr = start_node(test_config()).await;
    let mut ws = connect(addr).await;

    send_frame(&mut ws, play_frame("r2", "demo")).await;

    let ok = wait_for_method(&mut ws, "OK").await;
    assert_eq!(ok.param("request-id"), Some("r2"));
    let standby = wait_for_method(&mut ws, "STANDBY").await;
    assert_eq!(standby.param("request-id"), Some("r2"));
}

#[tokio::test]
async fn duplicate_publish_closes_the_first_request() {
    let addr = start_node(test_config()).await;

    let mut first = connect(addr).await;
    send_frame(&mut first, publish_frame("r1", "demo")).await;
    wait_for_method(&mut first, "OFFER").await;

    let mut second = connect(addr).await;
    send_frame(&mut second, publish_frame("r1b", "demo")).await;
    wait_for_method(&mut second, "OFFER").await;

    let close = wait_for_method(&mut first, "CLOSE").await;
    assert_eq!(close.param("request-id"), Some("r1"));
    assert_eq!(close.param("stream-id"), Some("demo"));
}

#[tokio::test]
async fn oversized_and_reused_identifiers_are_rejected() {
    let addr = start_node(test_config()).await;
    let mut ws = connect(addr).await;

    let long_sid = "x".repeat(256);
    send_frame(&mut ws, publish_frame("r1", &long_sid)).await;
    let err = wait_for_method(&mut ws, "ERROR").await;
    assert_eq!(err.param("error-code"), Some("INVALID_STREAM_ID"));

    send_frame(&mut ws, publish_frame("", "demo")).await;
    let err = wait_for_method(&mut ws, "ERROR").await;
    assert_eq!(err.param("error-code"), Some("INVALID_REQUEST_ID"));

    send_frame(&mut ws, publish_frame("r1", "demo")).await;
    wait_for_method(&mut ws, "OK").await;
    send_frame(&mut ws, play_frame("r1", "demo")).await;
    let err = wait_for_method(&mut ws, "ERROR").await;
    assert_eq!(err.param("error-code"), Some("PROTOCOL_ERROR"));
    assert_eq!(err.param("request-id"), Some("r1"));
}

#[tokio::test]
async fn unknown_methods_get_a_protocol_error() {
    let addr = start_node(test_config()).await;
    let mut ws = connect(addr).await;

    send_frame(&mut ws, SignalingMessage::new("SUBSCRIBE").with_param("request-id", "r9")).await;
    let err = wait_for_method(&mut ws, "ERROR").await;
    assert_eq!(err.param("error-code"), Some("PROTOCOL_ERROR"));
    assert_eq!(err.param("request-id"), Some("r9"));
}

#[tokio::test]
async fn stream_tokens_are_checked_when_a_secret_is_set() {
    let mut config = test_config();
    config.jwt_secret = Some("it-is-a-secret".to_string());
    let addr = start_node(config).await;
    let mut ws = connect(addr).await;

    send_frame(&mut ws, publish_frame("r1", "demo")).await;
    let err = wait_for_method(&mut ws, "ERROR").await;
    assert_eq!(err.param("error-code"), Some("INVALID_AUTH"));

    #[derive(serde::Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        sid: &'a str,
    }
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims {
            sub: "stream_publish",
            sid: "demo",
        },
        &jsonwebtoken::EncodingKey::from_secret(b"it-is-a-secret"),
    )
    .expect("token encodes");

    send_frame(
        &mut ws,
        SignalingMessage::new("PUBLISH")
            .with_param("request-id", "r2")
            .with_param("stream-id", "demo")
            .with_param("stream-type", "DUAL")
            .with_param("auth", &token),
    )
    .await;
    let ok = wait_for_method(&mut ws, "OK").await;
    assert_eq!(ok.param("request-id"), Some("r2"));
}

#[tokio::test]
async fn the_ip_limit_rejects_the_extra_session_with_429() {
    let mut config = test_config();
    config.ip_limit = 1;
    let addr = start_node(config).await;

    let _first = connect(addr).await;

    match connect_async(format!("ws://{addr}/ws")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 429);
        }
        other => panic!("expected an HTTP 429 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn allow_listed_addresses_bypass_the_ip_limit() {
    let mut config = test_config();
    config.ip_limit = 1;
    config.ip_allow_list = IpAllowList::parse("127.0.0.0/8");
    let addr = start_node(config).await;

    let _first = connect(addr).await;
    let _second = connect(addr).await;
}

#[tokio::test]
async fn the_server_heartbeats_on_its_interval() {
    let mut config = test_config();
    config.heartbeat_interval = Duration::from_millis(100);
    let addr = start_node(config).await;
    let mut ws = connect(addr).await;

    wait_for_method(&mut ws, "HEARTBEAT").await;
}

#[tokio::test]
async fn a_silent_client_is_disconnected_after_the_timeout() {
    let mut config = test_config();
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_timeout = Duration::from_millis(300);
    let addr = start_node(config).await;
    let mut ws = connect(addr).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("server closes the channel before the deadline")
        {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }
}

#[tokio::test]
async fn close_tears_the_publisher_down() {
    let addr = start_node(test_config()).await;

    let mut publisher = connect(addr).await;
    send_frame(&mut publisher, publish_frame("r1", "demo")).await;
    wait_for_method(&mut publisher, "OFFER").await;

    send_frame(
        &mut publisher,
        SignalingMessage::new("CLOSE").with_param("request-id", "r1"),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A subscriber arriving now finds no provider and stays parked.
    let mut subscriber = connect(addr).await;
    send_frame(&mut subscriber, play_frame("r2", "demo")).await;
    wait_for_method(&mut subscriber, "STANDBY").await;

    let quiet = timeout(Duration::from_millis(700), async {
        loop {
            match subscriber.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame = SignalingMessage::parse(text.as_str());
                    if frame.method == "OFFER" {
                        break;
                    }
                }
                Some(Ok(_)) => continue,
                _ => break,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "no OFFER should arrive for a closed stream");
}
