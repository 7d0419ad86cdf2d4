use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, trace, warn};
use webrtc::interceptor::Attributes;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::broadcaster::TrackBroadcaster;
use crate::id_types::StreamId;
use crate::negotiation;
use crate::peer_session::PeerSession;
use crate::room::Room;

/// Abstracts over the RTP source of an ingress track so the forwarding loop
/// below can be exercised against a mock in tests without a live
/// `TrackRemote`.
#[async_trait]
pub trait RemoteTrackSource: Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn kind(&self) -> String;
    fn ssrc(&self) -> u32;
    fn codec_capability(&self) -> RTCRtpCodecCapability;
    fn payload_type(&self) -> u8;
    async fn read_rtp(&self) -> Result<(Packet, Attributes)>;
}

#[async_trait]
impl RemoteTrackSource for TrackRemote {
    fn id(&self) -> String {
        self.id()
    }
    fn stream_id(&self) -> String {
        self.stream_id()
    }
    fn kind(&self) -> String {
        self.kind().to_string()
    }
    fn ssrc(&self) -> u32 {
        self.ssrc()
    }
    fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.codec().capability.clone()
    }
    fn payload_type(&self) -> u8 {
        self.payload_type()
    }
    async fn read_rtp(&self) -> Result<(Packet, Attributes)> {
        self.read_rtp().await.map_err(|e| e.into())
    }
}

/// Attaches the `on_track` event handler to a publishing session's peer
/// connection: every remote track it produces becomes a Local Forwarded
/// Track broadcast to the rest of `room`.
pub fn attach_track_handler(session: Arc<PeerSession>, room: Arc<Room>, tracks: crate::types::TrackMap) {
    let pc_for_ontrack = session.pc.clone();
    pc_for_ontrack.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let session = session.clone();
        let room = room.clone();
        let tracks = tracks.clone();
        Box::pin(async move {
            handle_new_track(track, session, room, tracks).await;
        })
    }));
}

/// Creates the broadcaster for a freshly published track and registers it in
/// the process-wide track map. `StreamId` is minted equal to the publishing
/// connection's id per the identity convention used throughout the relay, so
/// every track a single connection publishes shares one stream key.
fn setup_broadcaster(
    track: &Arc<dyn RemoteTrackSource>,
    session: &Arc<PeerSession>,
) -> Arc<TrackBroadcaster> {
    let broadcaster = Arc::new(TrackBroadcaster::new(
        track.kind(),
        track.codec_capability(),
        session.pc.clone(),
        track.ssrc(),
    ));
    broadcaster.clone().spawn_periodic_keyframe_requests();

    let stream_id = StreamId::from(session.connection_id.as_ref());
    info!(room = %session.room_id, stream = %stream_id, kind = %track.kind(), "[SFU] created broadcaster for published track");
    broadcaster
}

/// Subscribes one existing peer to a newly published track: adds the track
/// to that peer's connection, wires up PLI monitoring, registers the writer
/// on the broadcaster, records the stream-to-publisher mapping the peer
/// needs to resolve a future `client-left`, and triggers renegotiation so
/// the peer actually receives it.
fn setup_subscriber(
    track: Arc<dyn RemoteTrackSource>,
    publisher: &Arc<PeerSession>,
    subscriber: Arc<PeerSession>,
    broadcaster: Arc<TrackBroadcaster>,
) {
    info!(subscriber = %subscriber.connection_id, "[SFU] forwarding published track to peer");

    let capability = track.codec_capability();
    let track_for_pt = track.clone();
    let stream_id = StreamId::from(publisher.connection_id.as_ref());
    let stream_id_str = stream_id.as_ref().to_string();

    tokio::spawn(async move {
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            stream_id_str.clone(),
            stream_id_str.clone(),
        ));

        let rtp_sender = match subscriber
            .pc
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                error!(subscriber = %subscriber.connection_id, error = %e, "[SFU] failed to add track to subscriber");
                return;
            }
        };

        spawn_pli_monitor(rtp_sender.clone(), broadcaster.clone());

        let params = rtp_sender.get_parameters().await;
        let ssrc = params.encodings.first().map(|e| e.ssrc).unwrap_or(0);
        let pt = params
            .rtp_parameters
            .codecs
            .first()
            .map(|c| c.payload_type)
            .unwrap_or_else(|| {
                let incoming_pt = track_for_pt.payload_type();
                warn!(incoming_pt, "[SFU] outgoing codecs empty, falling back to incoming PT");
                incoming_pt
            });

        broadcaster.add_writer(local_track, stream_id_str.clone(), ssrc, pt).await;
        broadcaster.schedule_pli_retry();

        subscriber.egress_senders.insert(stream_id, rtp_sender);
        crate::metrics::SFU_TRACKS_ADDED_TOTAL.inc();

        if let Err(e) = negotiation::maybe_renegotiate(&subscriber).await {
            warn!(subscriber = %subscriber.connection_id, error = %e, "[SFU] renegotiation after track add failed");
        }
    });
}

/// Reports whether an RTP payload starts a video keyframe, used to decide
/// when a fresh subscriber's PLI burst can stop early. Supports VP8 and
/// H.264 only, matching the codecs registered in `media_setup`.
fn detect_keyframe(payload: &[u8], mime_type: &str) -> bool {
    if payload.is_empty() {
        return false;
    }

    if mime_type.contains("vp8") {
        (payload[0] & 0x01) == 0
    } else if mime_type.contains("h264") {
        let nal_type = payload[0] & 0x1F;
        if nal_type == 5 {
            true
        } else if nal_type == 28 && payload.len() > 1 {
            let s_bit = (payload[1] & 0x80) != 0;
            let inner_type = payload[1] & 0x1F;
            s_bit && inner_type == 5
        } else {
            false
        }
    } else {
        false
    }
}

fn spawn_pli_monitor(
    rtp_sender: Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>,
    broadcaster: Arc<TrackBroadcaster>,
) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((packets, _)) = rtp_sender.read(&mut rtcp_buf).await {
            for packet in packets {
                if packet.as_any().is::<PictureLossIndication>() {
                    broadcaster.request_keyframe().await;
                }
            }
        }
    });
}

/// Fans a newly published track out to every other peer currently in
/// `room`. The publisher itself is excluded, since it is the source.
async fn broadcast_track_to_peers(
    track: Arc<dyn RemoteTrackSource>,
    broadcaster: Arc<TrackBroadcaster>,
    publisher: &Arc<PeerSession>,
    room: &Arc<Room>,
) {
    let peers = room.peers().await;
    info!(count = peers.len(), "[SFU] notifying room peers of new track");

    for peer in peers {
        if peer.connection_id == publisher.connection_id {
            continue;
        }
        setup_subscriber(track.clone(), publisher, peer, broadcaster.clone());
    }
}

struct RtpLoopContext {
    track_id: String,
    mime_type: String,
    broadcaster: Arc<TrackBroadcaster>,
}

fn spawn_rtp_loop(track: Arc<dyn RemoteTrackSource>, broadcaster: Arc<TrackBroadcaster>) {
    let track_id_log = track.id();
    let mime_type = track.codec_capability().mime_type.to_lowercase();

    tokio::spawn(async move {
        let mut packet_count: u64 = 0;
        info!(track = %track_id_log, "[SFU] starting ingress read loop");

        let ctx = RtpLoopContext {
            track_id: track_id_log.clone(),
            mime_type,
            broadcaster,
        };

        let outcome = AssertUnwindSafe(async {
            loop {
                match track.read_rtp().await {
                    Ok((mut packet, _)) => {
                        packet_count += 1;
                        process_rtp_packet(&mut packet, packet_count, &ctx).await;
                    }
                    Err(e) => {
                        warn!(track = %track_id_log, error = %e, "[SFU] ingress read loop ended");
                        break;
                    }
                }
            }
        })
        .catch_unwind()
        .await;

        if let Err(panic) = outcome {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let err = crate::error::SfuError::PanicRecovered(reason);
            error!(track = %track_id_log, error = %err, "[SFU] ingress read loop panicked, track relay stopped");
        }
    });
}

async fn process_rtp_packet(packet: &mut Packet, packet_count: u64, ctx: &RtpLoopContext) {
    if packet_count == 1 {
        info!(track = %ctx.track_id, "[SFU] first packet received on published track");
    }

    if detect_keyframe(&packet.payload, &ctx.mime_type) {
        ctx.broadcaster.mark_keyframe_received();
        if packet_count.is_multiple_of(100) || packet_count < 50 {
            debug!(track = %ctx.track_id, "[SFU] keyframe received");
        }
    }

    if packet_count.is_multiple_of(100) {
        trace!(count = packet_count, track = %ctx.track_id, "[SFU] forwarded packets");
    }

    ctx.broadcaster.broadcast(packet).await;
}

/// Orchestrates a freshly published track: registers its broadcaster, fans
/// it out to the rest of the room, and starts relaying RTP.
pub async fn handle_new_track(
    track: Arc<dyn RemoteTrackSource>,
    session: Arc<PeerSession>,
    room: Arc<Room>,
    tracks: crate::types::TrackMap,
) {
    info!(connection = %session.connection_id, kind = %track.kind(), "[SFU] received published track");

    let broadcaster = setup_broadcaster(&track, &session);
    let stream_id = StreamId::from(session.connection_id.as_ref());
    tracks.insert((session.room_id.clone(), stream_id), broadcaster.clone());

    broadcast_track_to_peers(track.clone(), broadcaster.clone(), &session, &room).await;
    spawn_rtp_loop(track, broadcaster);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_types::{ConnectionId, RoomId, UserId};
    use crate::media_setup::MediaSetup;
    use crate::signaling_transport::SignalingSender;
    use std::sync::atomic::Ordering;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    struct MockTrack {
        id: String,
        kind: String,
        ssrc: u32,
        capability: RTCRtpCodecCapability,
        packet_rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Result<Packet>>>>,
    }

    #[async_trait]
    impl RemoteTrackSource for MockTrack {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn stream_id(&self) -> String {
            self.id.clone()
        }
        fn kind(&self) -> String {
            self.kind.clone()
        }
        fn ssrc(&self) -> u32 {
            self.ssrc
        }
        fn codec_capability(&self) -> RTCRtpCodecCapability {
            self.capability.clone()
        }
        fn payload_type(&self) -> u8 {
            96
        }
        async fn read_rtp(&self) -> Result<(Packet, Attributes)> {
            let mut rx = self.packet_rx.lock().await;
            match rx.recv().await {
                Some(Ok(p)) => Ok((p, Attributes::new())),
                Some(Err(e)) => Err(e),
                None => Err(anyhow::anyhow!("mock channel closed")),
            }
        }
    }

    async fn make_session(conn: &str, room_id: &RoomId) -> Arc<PeerSession> {
        let api = MediaSetup::create_webrtc_api();
        let pc = Arc::new(api.new_peer_connection(MediaSetup::get_rtc_config()).await.unwrap());
        let (sender, _rx) = SignalingSender::new(16);
        Arc::new(PeerSession::new(
            pc,
            ConnectionId::from(conn),
            UserId::from(conn),
            room_id.clone(),
            Arc::new(sender),
        ))
    }

    #[test]
    fn test_detect_keyframe_vp8() {
        assert!(detect_keyframe(&[0x00], "video/vp8"));
        assert!(!detect_keyframe(&[0x01], "video/vp8"));
    }

    #[test]
    fn test_detect_keyframe_h264_idr() {
        assert!(detect_keyframe(&[5], "video/h264"));
        assert!(!detect_keyframe(&[1], "video/h264"));
    }

    #[tokio::test]
    async fn test_handle_new_track_registers_broadcaster_and_forwards() {
        let room_id = RoomId::from("room-1");
        let room = Arc::new(Room::new(room_id.clone()));
        let publisher = make_session("publisher", &room_id).await;
        let subscriber = make_session("subscriber", &room_id).await;
        room.join(subscriber.clone()).await;
        room.join(publisher.clone()).await;

        let tracks: crate::types::TrackMap = Arc::new(dashmap::DashMap::new());

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Packet>>(10);
        let mock_track: Arc<dyn RemoteTrackSource> = Arc::new(MockTrack {
            id: "t1".into(),
            kind: "video".into(),
            ssrc: 4242,
            capability: RTCRtpCodecCapability {
                mime_type: "video/vp8".into(),
                ..Default::default()
            },
            packet_rx: Arc::new(tokio::sync::Mutex::new(rx)),
        });

        handle_new_track(mock_track, publisher.clone(), room.clone(), tracks.clone()).await;

        let key = (room_id.clone(), StreamId::from(publisher.connection_id.as_ref()));
        assert!(tracks.contains_key(&key));

        let broadcaster = tracks.get(&key).unwrap().value().clone();
        let packet = Packet {
            header: webrtc::rtp::header::Header {
                ssrc: 4242,
                ..Default::default()
            },
            payload: vec![0x00, 0x01, 0x02].into(),
        };
        tx.send(Ok(packet)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(broadcaster.last_keyframe_ts.load(Ordering::Relaxed) > 0);
        drop(tx);
    }
}
