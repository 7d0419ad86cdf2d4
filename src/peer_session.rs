use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::id_types::{ConnectionId, RoomId, UserId};
use crate::signaling_transport::SignalingMessage;
use crate::types::{EgressSenderMap, SharedSignalingSender};

/// One signaling connection's worth of state: the underlying peer
/// connection, the identity it joined under, and the bookkeeping the
/// negotiation controller and media relay need to stay out of each other's
/// way. `connection_id` (not `user_id`) is the map key everywhere a
/// `PeerSession` is looked up, since a user may reconnect under the same
/// identity while the prior session is still draining.
pub struct PeerSession {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub pc: Arc<RTCPeerConnection>,
    pub sender: SharedSignalingSender,

    /// Serializes offer/answer/rollback application for this peer. Acquired
    /// only after the owning room's lock, per the process-wide lock
    /// ordering (Registry -> Room -> Peer Session).
    pub signaling_lock: Arc<Mutex<()>>,

    /// True while this session has an offer outstanding that the remote
    /// hasn't answered yet; read by the negotiation controller to decide
    /// whether a fresh track addition needs to wait or can renegotiate now.
    pub is_making_offer: Arc<AtomicBool>,

    /// Set when a track change arrived while `is_making_offer` was true;
    /// cleared and re-examined once the outstanding negotiation returns to
    /// `stable`, so no track addition is silently lost to a race.
    pub renegotiation_pending: Arc<AtomicBool>,

    /// Maps a `StreamId` this peer currently receives to the `RTCRtpSender`
    /// carrying it, so a departed publisher's egress track can be removed
    /// from this peer's connection before it is renegotiated away.
    pub egress_senders: EgressSenderMap,

    /// Signaled once, from either the keepalive watchdog or the media
    /// engine's connection-state callback, to tell the signaling loop this
    /// session is dead and should be torn down.
    pub terminate: Arc<Notify>,

    pub joined_at: Instant,
}

impl PeerSession {
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        connection_id: ConnectionId,
        user_id: UserId,
        room_id: RoomId,
        sender: SharedSignalingSender,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            room_id,
            pc,
            sender,
            signaling_lock: Arc::new(Mutex::new(())),
            is_making_offer: Arc::new(AtomicBool::new(false)),
            renegotiation_pending: Arc::new(AtomicBool::new(false)),
            egress_senders: Arc::new(DashMap::new()),
            terminate: Arc::new(Notify::new()),
            joined_at: Instant::now(),
        }
    }

    /// Forwards locally-gathered ICE candidates to the remote peer as they
    /// trickle in.
    pub fn register_ice_candidate_handler(&self) {
        let sender = self.sender.clone();
        let connection_id = self.connection_id.clone();

        self.pc.on_ice_candidate(Box::new(
            move |c: Option<webrtc::ice_transport::ice_candidate::RTCIceCandidate>| {
                let sender = sender.clone();
                let connection_id = connection_id.clone();
                Box::pin(async move {
                    let Some(candidate) = c else { return };
                    let Ok(json) = candidate.to_json() else { return };
                    info!(connection = %connection_id, "[SFU] Generated ICE candidate");
                    let _ = sender.send(SignalingMessage::Candidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    });
                })
            },
        ));
    }

    /// Logs connection-state transitions for diagnostics and, on `Failed` or
    /// `Closed`, wakes the signaling loop's termination watch so the session
    /// is torn down even if the WebSocket itself never closes. A peer
    /// connection dropping to `Disconnected` is left alone, giving it a
    /// chance to recover within the ICE disconnect timeout.
    pub fn register_connection_state_handler(&self) {
        let connection_id = self.connection_id.clone();
        let terminate = self.terminate.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let connection_id = connection_id.clone();
                let terminate = terminate.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            warn!(connection = %connection_id, ?state, "[SFU] Peer connection unhealthy, terminating session");
                            terminate.notify_one();
                        }
                        _ => {
                            info!(connection = %connection_id, ?state, "[SFU] Peer connection state changed");
                        }
                    }
                })
            }));
    }
}
