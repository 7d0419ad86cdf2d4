use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::metrics::{SFU_KEYFRAMES_REQUESTED_TOTAL, SFU_PACKETS_DROPPED_TOTAL, SFU_PACKETS_FORWARDED_TOTAL};

/// Interval between unconditional keyframe solicitations on a video track,
/// independent of any particular subscriber joining. Keeps long-lived
/// streams recoverable if a PLI gets lost somewhere in the path.
const PERIODIC_KEYFRAME_INTERVAL_SECS: u64 = 3;

/// One subscriber of a `TrackBroadcaster`: an egress channel feeding a
/// dedicated forwarder task, plus the negotiated identifiers that task
/// stamps onto every relayed packet.
pub struct BroadcasterWriter {
    pub tx: mpsc::Sender<Packet>,
    pub ssrc: u32,
    pub payload_type: u8,
}

/// Fans a single ingress (Local Forwarded) track out to every Egress Sender
/// subscribed to it. Each writer gets its own bounded channel and forwarder
/// task so one slow or dead subscriber never blocks delivery to the others.
pub struct TrackBroadcaster {
    pub writers: RwLock<Vec<BroadcasterWriter>>,
    pub kind: String,
    pub capability: RTCRtpCodecCapability,
    pub source_pc: Arc<RTCPeerConnection>,
    pub source_ssrc: u32,
    pub last_keyframe_ts: AtomicI64,
}

impl TrackBroadcaster {
    pub fn new(
        kind: String,
        capability: RTCRtpCodecCapability,
        source_pc: Arc<RTCPeerConnection>,
        source_ssrc: u32,
    ) -> Self {
        Self {
            writers: RwLock::new(Vec::new()),
            kind,
            capability,
            source_pc,
            source_ssrc,
            last_keyframe_ts: AtomicI64::new(0),
        }
    }

    /// Subscribes `track` (already added to the subscriber's peer
    /// connection) to this broadcaster. Spawns the per-writer forwarder task
    /// that owns the receiving half of the channel and performs the actual
    /// `write_rtp` call, decoupled from the broadcast hot path.
    pub async fn add_writer(
        &self,
        track: Arc<TrackLocalStaticRTP>,
        id: String,
        ssrc: u32,
        payload_type: u8,
    ) {
        let (tx, mut rx) = mpsc::channel::<Packet>(DEFAULT_WRITER_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = track.write_rtp(&packet).await {
                    warn!(track = %id, error = %e, "[SFU] Writer forward failed, dropping subscriber");
                    break;
                }
            }
            debug!(track = %id, "[SFU] Writer forwarder task exiting");
        });

        self.writers.write().await.push(BroadcasterWriter {
            tx,
            ssrc,
            payload_type,
        });

        info!(kind = %self.kind, ssrc = %ssrc, payload_type = %payload_type, "[SFU] Added writer for track");
        self.request_keyframe().await;
    }

    /// Clones `packet` once per writer, stamping each clone with that
    /// writer's negotiated SSRC/payload type, and best-effort delivers it.
    /// A writer whose channel has closed (its forwarder task exited) is
    /// dropped from the subscriber list; a writer whose channel is merely
    /// full is skipped for this packet without being removed, since a
    /// momentary backlog is not the same as a dead subscriber.
    pub async fn broadcast(&self, packet: &mut Packet) {
        // Relayed header extensions reference the publisher's negotiated
        // extension map, which subscribers never agreed to; clear them
        // once before fan-out rather than per writer.
        packet.header.extension = false;
        packet.header.extension_profile = 0;
        packet.header.extensions.clear();

        let mut dead = Vec::new();
        {
            let writers = self.writers.read().await;
            for (idx, writer) in writers.iter().enumerate() {
                let mut out = packet.clone();
                out.header.ssrc = writer.ssrc;
                out.header.payload_type = writer.payload_type;

                match writer.tx.try_send(out) {
                    Ok(()) => {
                        SFU_PACKETS_FORWARDED_TOTAL.with_label_values(&[&self.kind]).inc();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        SFU_PACKETS_DROPPED_TOTAL.with_label_values(&[&self.kind]).inc();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(idx);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut writers = self.writers.write().await;
            for idx in dead.into_iter().rev() {
                if idx < writers.len() {
                    writers.remove(idx);
                }
            }
        }
    }

    /// Marks that a keyframe was just observed on the ingress side, purely
    /// for diagnostics (e.g. verifying the periodic solicitation loop is
    /// unneeded because fresh keyframes keep arriving on their own).
    pub fn mark_keyframe_received(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.last_keyframe_ts.store(now_ms, Ordering::Relaxed);
    }

    /// Sends a Picture Loss Indication to the publisher over the source
    /// peer connection. A no-op for audio tracks.
    pub async fn request_keyframe(&self) {
        if self.kind != "video" {
            return;
        }

        SFU_KEYFRAMES_REQUESTED_TOTAL.inc();
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.source_ssrc,
        };
        if let Err(e) = self.source_pc.write_rtcp(&[Box::new(pli)]).await {
            error!(source_ssrc = %self.source_ssrc, error = %e, "[SFU] Failed to send keyframe request (PLI)");
        } else {
            debug!(source_ssrc = %self.source_ssrc, "[SFU] Sent keyframe request (PLI)");
        }
    }

    /// Bursts a handful of delayed PLIs after a new subscriber joins, since
    /// the subscriber's decoder has nothing to show until the next keyframe
    /// and a single immediate PLI is easily lost while DTLS is still
    /// settling.
    pub fn schedule_pli_retry(self: Arc<Self>) {
        tokio::spawn(async move {
            for delay_secs in [1u64, 2, 3, 5] {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                debug!(delay_secs, "[SFU] Sending delayed keyframe request");
                self.request_keyframe().await;
            }
        });
    }

    /// Keeps soliciting keyframes on an unconditional ~3s cadence for the
    /// lifetime of this broadcaster. Started once, right after construction,
    /// by the caller holding the `Arc`.
    pub fn spawn_periodic_keyframe_requests(self: Arc<Self>) {
        if self.kind != "video" {
            return;
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(PERIODIC_KEYFRAME_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if Arc::strong_count(&self) <= 1 {
                    break;
                }
                self.request_keyframe().await;
            }
        });
    }
}

const DEFAULT_WRITER_QUEUE_CAPACITY: usize = 100;
