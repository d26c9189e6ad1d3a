//! One client-facing signaling session: parses inbound frames, owns the
//! sources and sinks the client created, keeps the heartbeat, and tears
//! everything down when the channel dies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use castgrid_protocol::{ErrorCode, SignalingMessage, StreamKind};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::auth;
use crate::media::{Sink, Source};
use crate::state::AppState;

/// Cloneable write half of a session. Frames pushed here are delivered
/// to the client, in push order, by the session's writer task.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SessionHandle {
    pub(crate) fn channel(id: u64) -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, frame: SignalingMessage) {
        // A closed channel just means the client is gone; teardown is
        // already on its way.
        let _ = self.tx.send(frame);
    }

    pub fn send_ok(&self, request_id: &str) {
        self.send(SignalingMessage::new("OK").with_param("request-id", request_id));
    }

    pub fn send_error(&self, code: ErrorCode, message: &str, request_id: &str) {
        self.send(
            SignalingMessage::new("ERROR")
                .with_param("request-id", request_id)
                .with_param("error-code", code.as_str())
                .with_param("error-message", message),
        );
    }

    pub fn send_standby(&self, request_id: &str) {
        self.send(SignalingMessage::new("STANDBY").with_param("request-id", request_id));
    }

    pub fn send_offer(&self, request_id: &str, sid: &str, sdp_json: String) {
        self.send(
            SignalingMessage::new("OFFER")
                .with_param("request-id", request_id)
                .with_param("stream-id", sid)
                .with_body(sdp_json),
        );
    }

    pub fn send_candidate(&self, request_id: &str, sid: &str, candidate_json: String) {
        self.send(
            SignalingMessage::new("CANDIDATE")
                .with_param("request-id", request_id)
                .with_param("stream-id", sid)
                .with_body(candidate_json),
        );
    }

    pub fn send_source_close(&self, request_id: &str, sid: &str) {
        self.send(
            SignalingMessage::new("CLOSE")
                .with_param("request-id", request_id)
                .with_param("stream-id", sid),
        );
    }

    pub fn send_heartbeat(&self) {
        self.send(SignalingMessage::new("HEARTBEAT"));
    }
}

#[derive(Clone)]
enum RequestEntry {
    Publish(Arc<Source>),
    Play(Arc<Sink>),
}

struct SessionState {
    requests: HashMap<String, RequestEntry>,
    last_heartbeat: Instant,
}

pub struct Session {
    handle: SessionHandle,
    ip: IpAddr,
    app: AppState,
    state: Mutex<SessionState>,
}

/// Entry point from the HTTP layer once the socket is upgraded. The IP
/// slot was already taken by admission control and is released here on
/// the way out.
pub async fn run(app: AppState, socket: WebSocket, session_id: u64, ip: IpAddr) {
    let (handle, outbound) = SessionHandle::channel(session_id);
    app.registry.add_session(handle.clone()).await;
    info!(session = session_id, %ip, "connection established");

    let session = Session {
        handle,
        ip,
        app,
        state: Mutex::new(SessionState {
            requests: HashMap::new(),
            last_heartbeat: Instant::now(),
        }),
    };
    session.run(socket, outbound).await;
}

impl Session {
    async fn run(&self, socket: WebSocket, mut outbound: mpsc::UnboundedReceiver<SignalingMessage>) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if ws_tx.send(Message::Text(frame.serialize().into())).await.is_err() {
                    break;
                }
            }
        });

        let mut ticker = tokio::time::interval(self.app.config.heartbeat_interval);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // binary and ping/pong frames are not signaling
                        Some(Err(err)) => {
                            debug!(session = self.handle.id(), error = %err, "read error");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.heartbeat_expired().await {
                        info!(session = self.handle.id(), "heartbeat timeout");
                        break;
                    }
                    self.handle.send_heartbeat();
                }
            }
        }

        self.teardown().await;
        writer.abort();
    }

    async fn handle_frame(&self, raw: &str) {
        let frame = SignalingMessage::parse(raw);
        debug!(session = self.handle.id(), method = %frame.method, "frame received");
        match frame.method.as_str() {
            "HEARTBEAT" => {
                self.state.lock().await.last_heartbeat = Instant::now();
            }
            "PUBLISH" => self.on_publish(&frame).await,
            "PLAY" => self.on_play(&frame).await,
            "ANSWER" => self.on_answer(&frame).await,
            "CANDIDATE" => self.on_candidate(&frame).await,
            "CLOSE" => self.on_close_request(&frame).await,
            "" => {}
            other => {
                let request_id = frame.param("request-id").unwrap_or("");
                self.handle.send_error(
                    ErrorCode::ProtocolError,
                    &format!("unrecognized method {other}"),
                    request_id,
                );
            }
        }
    }

    async fn on_publish(&self, frame: &SignalingMessage) {
        let request_id = frame.param("request-id").unwrap_or("").to_string();
        let sid = frame.param("stream-id").unwrap_or("").to_string();

        if !valid_opaque_id(&request_id) {
            self.handle
                .send_error(ErrorCode::InvalidRequestId, "invalid request id", &request_id);
            return;
        }
        if !valid_opaque_id(&sid) {
            self.handle
                .send_error(ErrorCode::InvalidStreamId, "invalid stream id", &request_id);
            return;
        }
        let kind = match frame.param("stream-type") {
            None => StreamKind::Dual,
            Some(raw) => match raw.parse::<StreamKind>() {
                Ok(kind) => kind,
                Err(()) => {
                    self.handle
                        .send_error(ErrorCode::ProtocolError, "invalid stream type", &request_id);
                    return;
                }
            },
        };
        if !self.check_auth(frame, auth::SUBJECT_PUBLISH, &sid, &request_id) {
            return;
        }

        let source = {
            let mut state = self.state.lock().await;
            if state.requests.contains_key(&request_id) {
                drop(state);
                self.handle
                    .send_error(ErrorCode::ProtocolError, "request id already in use", &request_id);
                return;
            }
            if state.requests.len() as u32 >= self.app.config.request_limit {
                drop(state);
                self.handle
                    .send_error(ErrorCode::LimitRequests, "too many requests", &request_id);
                return;
            }
            let source = Arc::new(Source::new(
                sid.clone(),
                request_id.clone(),
                kind,
                self.handle.clone(),
                Arc::downgrade(&self.app.registry),
                self.app.registry.engine().clone(),
            ));
            state
                .requests
                .insert(request_id.clone(), RequestEntry::Publish(source.clone()));
            source
        };

        info!(session = self.handle.id(), stream = %sid, request = %request_id, "publish");
        self.app.registry.register_source(source.clone()).await;
        self.handle.send_ok(&request_id);
        tokio::spawn(async move { source.run().await });
    }

    async fn on_play(&self, frame: &SignalingMessage) {
        let request_id = frame.param("request-id").unwrap_or("").to_string();
        let sid = frame.param("stream-id").unwrap_or("").to_string();

        if !valid_opaque_id(&request_id) {
            self.handle
                .send_error(ErrorCode::InvalidRequestId, "invalid request id", &request_id);
            return;
        }
        if !valid_opaque_id(&sid) {
            self.handle
                .send_error(ErrorCode::InvalidStreamId, "invalid stream id", &request_id);
            return;
        }
        if !self.check_auth(frame, auth::SUBJECT_PLAY, &sid, &request_id) {
            return;
        }

        let sink = {
            let mut state = self.state.lock().await;
            if state.requests.contains_key(&request_id) {
                drop(state);
                self.handle
                    .send_error(ErrorCode::ProtocolError, "request id already in use", &request_id);
                return;
            }
            if state.requests.len() as u32 >= self.app.config.request_limit {
                drop(state);
                self.handle
                    .send_error(ErrorCode::LimitRequests, "too many requests", &request_id);
                return;
            }
            let sink = Arc::new(Sink::new(
                self.app.registry.next_sink_id(),
                sid.clone(),
                request_id.clone(),
                self.handle.clone(),
                Arc::downgrade(&self.app.registry),
                self.app.registry.engine().clone(),
            ));
            state
                .requests
                .insert(request_id.clone(), RequestEntry::Play(sink.clone()));
            sink
        };

        info!(session = self.handle.id(), stream = %sid, request = %request_id, "play");
        self.handle.send_ok(&request_id);
        self.handle.send_standby(&request_id);
        self.app.registry.register_sink(sink).await;
    }

    async fn on_answer(&self, frame: &SignalingMessage) {
        let Some(entry) = self.lookup(frame).await else {
            return;
        };
        match entry {
            RequestEntry::Publish(source) => source.on_answer(&frame.body).await,
            RequestEntry::Play(sink) => sink.on_answer(&frame.body).await,
        }
    }

    async fn on_candidate(&self, frame: &SignalingMessage) {
        let Some(entry) = self.lookup(frame).await else {
            return;
        };
        match entry {
            RequestEntry::Publish(source) => source.on_ice_candidate(&frame.body).await,
            RequestEntry::Play(sink) => sink.on_ice_candidate(&frame.body).await,
        }
    }

    async fn on_close_request(&self, frame: &SignalingMessage) {
        let request_id = frame.param("request-id").unwrap_or("");
        let entry = self.state.lock().await.requests.remove(request_id);
        match entry {
            Some(RequestEntry::Publish(source)) => source.close(false, true).await,
            Some(RequestEntry::Play(sink)) => sink.close().await,
            None => {}
        }
    }

    async fn lookup(&self, frame: &SignalingMessage) -> Option<RequestEntry> {
        let request_id = frame.param("request-id").unwrap_or("");
        let entry = self.state.lock().await.requests.get(request_id).cloned();
        if entry.is_none() {
            debug!(session = self.handle.id(), request = request_id, "frame for unknown request");
        }
        entry
    }

    fn check_auth(
        &self,
        frame: &SignalingMessage,
        expected_subject: &str,
        sid: &str,
        request_id: &str,
    ) -> bool {
        let token = frame.param("auth").unwrap_or("");
        if auth::check_stream_token(self.app.config.jwt_secret.as_deref(), token, expected_subject, sid)
        {
            return true;
        }
        self.handle
            .send_error(ErrorCode::InvalidAuth, "invalid stream token", request_id);
        false
    }

    async fn heartbeat_expired(&self) -> bool {
        self.state.lock().await.last_heartbeat.elapsed() > self.app.config.heartbeat_timeout
    }

    /// Closes every owned source and sink, releases the IP slot, and
    /// deregisters from the node.
    async fn teardown(&self) {
        let entries: Vec<RequestEntry> = {
            let mut state = self.state.lock().await;
            state.requests.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            match entry {
                RequestEntry::Publish(source) => source.close(false, true).await,
                RequestEntry::Play(sink) => sink.close().await,
            }
        }
        self.app.registry.remove_session(self.handle.id()).await;
        self.app.registry.remove_ip(self.ip).await;
        info!(session = self.handle.id(), ip = %self.ip, "connection closed");
    }
}

fn valid_opaque_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 255
}
