//! Inter-node bus adapter. Encodes control messages, serialises outbound
//! publishes through one queue, and routes inbound bus traffic to the
//! registry. Both halves reconnect forever on bus loss.

use std::sync::Arc;
use std::time::Duration;

use castgrid_protocol::bus::{BusEnvelope, BusMessage, BROADCAST_CHANNEL};
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;

use crate::registry::Registry;

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// An encoded message bound for one bus channel.
#[derive(Debug, Clone)]
pub struct BusOutbound {
    pub channel: String,
    pub payload: String,
}

/// Cloneable producer half of the node's bus. Every send funnels through
/// a single queue drained by one publisher task, so any subscriber
/// observes this node's messages in the order they were produced.
#[derive(Clone)]
pub struct BusHandle {
    node_id: Arc<str>,
    tx: mpsc::UnboundedSender<BusOutbound>,
}

impl BusHandle {
    pub fn channel(node_id: String) -> (Self, mpsc::UnboundedReceiver<BusOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                node_id: node_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn send(&self, channel: &str, dst: Option<String>, message: BusMessage) {
        let envelope = BusEnvelope {
            src: self.node_id.to_string(),
            dst,
            message,
        };
        let outbound = BusOutbound {
            channel: channel.to_string(),
            payload: envelope.encode(),
        };
        if self.tx.send(outbound).is_err() {
            // Stand-alone mode or shutdown: nobody is draining the queue.
            debug!("bus disabled, dropping outbound message");
        }
    }

    /// Asks the cluster who owns `sid`.
    pub fn send_resolve(&self, sid: &str) {
        self.send(
            BROADCAST_CHANNEL,
            None,
            BusMessage::Resolve {
                sid: sid.to_string(),
            },
        );
    }

    /// Announces ownership of `sid` — broadcast, or a targeted RESOLVE
    /// reply when `channel` is a node channel.
    pub fn send_info(&self, channel: &str, sid: &str) {
        let dst = (channel != BROADCAST_CHANNEL).then(|| channel.to_string());
        self.send(
            channel,
            dst,
            BusMessage::Info {
                sid: sid.to_string(),
            },
        );
    }

    /// Asks the owner of `sid` to open a media path toward this node.
    pub fn send_connect(&self, dst: &str, sid: &str) {
        self.send(
            dst,
            Some(dst.to_string()),
            BusMessage::Connect {
                sid: sid.to_string(),
            },
        );
    }

    pub fn send_offer(&self, dst: &str, sid: &str, sdp: String, has_video: bool, has_audio: bool) {
        self.send(
            dst,
            Some(dst.to_string()),
            BusMessage::Offer {
                sid: sid.to_string(),
                sdp,
                has_video,
                has_audio,
            },
        );
    }

    pub fn send_answer(&self, dst: &str, sid: &str, sdp: String) {
        self.send(
            dst,
            Some(dst.to_string()),
            BusMessage::Answer {
                sid: sid.to_string(),
                sdp,
            },
        );
    }

    pub fn send_candidate(&self, dst: &str, sid: &str, candidate: String) {
        self.send(
            dst,
            Some(dst.to_string()),
            BusMessage::Candidate {
                sid: sid.to_string(),
                candidate,
            },
        );
    }

    /// Ships a locally gathered candidate to a remote node; `None`
    /// becomes the empty end-of-candidates marker.
    pub(crate) fn send_local_candidate(&self, dst: &str, sid: &str, candidate: Option<RTCIceCandidate>) {
        let Some(candidate) = candidate else {
            self.send_candidate(dst, sid, String::new());
            return;
        };
        match candidate.to_json() {
            Ok(init) => match serde_json::to_string(&init) {
                Ok(json) => self.send_candidate(dst, sid, json),
                Err(err) => warn!(error = %err, "encoding local candidate for the bus"),
            },
            Err(err) => warn!(error = %err, "reading local candidate for the bus"),
        }
    }
}

/// Starts the publisher and subscriber halves against the configured bus.
pub fn spawn(
    registry: Arc<Registry>,
    outbound: mpsc::UnboundedReceiver<BusOutbound>,
    redis_url: &str,
) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    tokio::spawn(run_publisher(client.clone(), outbound));
    tokio::spawn(run_subscriber(client, registry));
    Ok(())
}

async fn run_publisher(client: redis::Client, mut outbound: mpsc::UnboundedReceiver<BusOutbound>) {
    let mut pending: Option<BusOutbound> = None;
    loop {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "bus publisher cannot reach the bus, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!("bus publisher connected");

        loop {
            let msg = match pending.take() {
                Some(msg) => msg,
                None => match outbound.recv().await {
                    Some(msg) => msg,
                    None => return,
                },
            };
            match conn.publish::<_, _, i64>(&msg.channel, &msg.payload).await {
                Ok(_) => {
                    debug!(channel = %msg.channel, payload = %msg.payload, "bus message sent");
                }
                Err(err) => {
                    warn!(error = %err, "bus publish failed, reconnecting");
                    pending = Some(msg);
                    break;
                }
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_subscriber(client: redis::Client, registry: Arc<Registry>) {
    let node_id = registry.node_id().to_string();
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(error = %err, "bus subscriber cannot reach the bus, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let subscribed = async {
            pubsub.subscribe(BROADCAST_CHANNEL).await?;
            pubsub.subscribe(node_id.as_str()).await
        }
        .await;
        if let Err(err) = subscribed {
            warn!(error = %err, "bus subscribe failed, retrying");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        info!(broadcast = BROADCAST_CHANNEL, node = %node_id, "bus subscriber listening");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "undecodable bus payload");
                    continue;
                }
            };
            dispatch(&registry, &payload).await;
        }
        drop(stream);

        warn!("bus connection lost, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Routes one raw bus payload into the registry.
pub async fn dispatch(registry: &Arc<Registry>, raw: &str) {
    let Some(envelope) = BusEnvelope::decode(raw) else {
        debug!(payload = raw, "ignoring malformed bus message");
        return;
    };
    if envelope.src == registry.node_id() {
        return; // our own broadcast echoed back
    }
    debug!(from = %envelope.src, kind = envelope.message.kind(), sid = envelope.message.sid(), "bus message received");

    let from = envelope.src;
    match envelope.message {
        BusMessage::Resolve { sid } => {
            if registry.resolve_source(&sid).await {
                registry.bus().send_info(&from, &sid);
            }
        }
        BusMessage::Info { sid } => registry.receive_info_message(&from, &sid).await,
        BusMessage::Connect { sid } => registry.receive_connect_message(&from, &sid).await,
        BusMessage::Offer {
            sid,
            sdp,
            has_video,
            has_audio,
        } => {
            registry
                .receive_offer_message(&sid, sdp, has_video, has_audio)
                .await;
        }
        BusMessage::Answer { sid, sdp } => {
            registry.receive_answer_message(&from, &sid, &sdp).await;
        }
        BusMessage::Candidate { sid, candidate } => {
            registry
                .receive_candidate_message(&from, &sid, &candidate)
                .await;
        }
    }
}
