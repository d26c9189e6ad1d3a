//! RTP and RTCP plumbing around forwarding tracks.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::Error;

/// Enough for RTP over a standard-MTU path.
const RTP_BUFFER_LEN: usize = 1400;
const RTCP_BUFFER_LEN: usize = 1500;

const PLI_INTERVAL: Duration = Duration::from_secs(2);

/// Copies RTP packets from a remote track into a forwarding track until
/// either side goes away. A closed pipe only means no subscriber is
/// attached yet, so it is not fatal.
pub fn spawn_track_pipe(remote: Arc<TrackRemote>, local: Arc<TrackLocalStaticRTP>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTP_BUFFER_LEN];
        loop {
            let n = match remote.read(&mut buf).await {
                Ok((n, _)) => n,
                Err(_) => return,
            };
            if let Err(err) = local.write(&buf[..n]).await {
                if Error::ErrClosedPipe != err {
                    return;
                }
            }
        }
    });
}

/// Drains RTCP from an outbound sender and discards it. The read is what
/// makes the interceptor chain process feedback (NACK, PLI), so it has to
/// keep running for as long as the sender lives.
pub fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTCP_BUFFER_LEN];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

/// Asks the publisher for a keyframe on an interval so freshly attached
/// subscribers are not stuck waiting for the next natural one. Stops when
/// the peer connection closes.
pub fn spawn_pli_ticker(pc: Arc<RTCPeerConnection>, media_ssrc: u32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PLI_INTERVAL);
        loop {
            ticker.tick().await;
            if pc.connection_state() == RTCPeerConnectionState::Closed {
                return;
            }
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(err) = pc.write_rtcp(&[Box::new(pli)]).await {
                if Error::ErrClosedPipe == err {
                    return;
                }
                debug!(error = %err, "sending PLI");
            }
        }
    });
}
