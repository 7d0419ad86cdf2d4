use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::error::SfuError;
use crate::peer_session::PeerSession;
use crate::signaling_transport::SignalingMessage;

/// Deferred-renegotiation delay applied after a remote answer lands while a
/// track change is pending, so a burst of near-simultaneous track additions
/// coalesces into a single offer instead of one per track.
const DEFERRED_RENEGOTIATION_DELAY_MS: u64 = 100;

/// Upper bound the server waits for ICE gathering before sending an offer
/// with whatever candidates have trickled in so far.
const GATHERING_TIMEOUT_MS: u64 = 1500;

/// Mirrors `RTCSignalingState`'s three states relevant to the glare
/// resolution rule: whether this side currently has an offer outstanding
/// that hasn't been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            _ => SignalingState::Stable,
        }
    }
}

/// Operation 1: creates and sends the peer's very first offer, used right
/// after a session joins a room and has every existing track subscribed.
pub async fn send_initial_offer(session: &Arc<PeerSession>) -> Result<(), SfuError> {
    let _guard = session.signaling_lock.lock().await;
    create_and_send_offer(session).await
}

/// Operation 2: applies a remote answer to a server-initiated offer. If a
/// track change arrived while this offer was outstanding, schedules a
/// follow-up renegotiation after a short coalescing delay rather than firing
/// it immediately, since the remote side needs a moment to finish applying
/// the answer it just sent.
pub async fn handle_remote_answer(session: &Arc<PeerSession>, sdp: String) -> Result<(), SfuError> {
    let _guard = session.signaling_lock.lock().await;
    let answer = RTCSessionDescription::answer(sdp).map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;
    session
        .pc
        .set_remote_description(answer)
        .await
        .map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;
    session.is_making_offer.store(false, Ordering::SeqCst);
    drop(_guard);

    if session.renegotiation_pending.swap(false, Ordering::SeqCst) {
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(DEFERRED_RENEGOTIATION_DELAY_MS)).await;
            if let Err(e) = maybe_renegotiate(&session).await {
                warn!(connection = %session.connection_id, error = %e, "[SFU] deferred renegotiation failed");
            }
        });
    }
    Ok(())
}

/// Operation 3: applies a client-initiated offer and answers it. Glare is
/// resolved before this is called (see `resolve_glare`), so by the time this
/// runs the session is guaranteed to be in `stable` or already rolled back.
pub async fn handle_remote_offer(session: &Arc<PeerSession>, sdp: String) -> Result<SignalingMessage, SfuError> {
    let _guard = session.signaling_lock.lock().await;
    let offer = RTCSessionDescription::offer(sdp).map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;
    session
        .pc
        .set_remote_description(offer)
        .await
        .map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;

    let answer = session
        .pc
        .create_answer(None)
        .await
        .map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;
    session
        .pc
        .set_local_description(answer)
        .await
        .map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;

    wait_for_gathering(session).await;
    let local_desc = session.pc.local_description().await.ok_or_else(|| {
        SfuError::NegotiationFailed("local description missing after set_local_description".to_string())
    })?;
    Ok(SignalingMessage::Answer { sdp: local_desc.sdp })
}

/// Operation 4: applies a remote ICE candidate, or queues it transparently
/// if the remote description hasn't landed yet. `webrtc-rs` already buffers
/// candidates added before `set_remote_description`, so this is a thin
/// wrapper that turns the crate's own error into the taxonomy used here.
pub async fn handle_remote_candidate(
    session: &Arc<PeerSession>,
    candidate: String,
    sdp_mid: Option<String>,
    sdp_mline_index: Option<u16>,
) -> Result<(), SfuError> {
    session
        .pc
        .add_ice_candidate(RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            ..Default::default()
        })
        .await
        .map_err(|e| SfuError::NegotiationFailed(e.to_string()))
}

/// Operation 5: server-side renegotiation triggered by a track being added
/// or removed from the room this session belongs to. Gated on `stable` so it
/// never races a negotiation already in flight; if one is in flight, the
/// request is latched in `renegotiation_pending` and picked up by
/// operation 2 once the outstanding offer resolves.
pub async fn maybe_renegotiate(session: &Arc<PeerSession>) -> Result<(), SfuError> {
    let state: SignalingState = session.pc.signaling_state().into();
    if state != SignalingState::Stable {
        session.renegotiation_pending.store(true, Ordering::SeqCst);
        debug!(connection = %session.connection_id, "[SFU] renegotiation deferred, offer in flight");
        return Ok(());
    }

    let _guard = session.signaling_lock.lock().await;
    // Re-check after acquiring the lock: another task may have started an
    // offer between the check above and now.
    let state: SignalingState = session.pc.signaling_state().into();
    if state != SignalingState::Stable {
        session.renegotiation_pending.store(true, Ordering::SeqCst);
        return Ok(());
    }
    create_and_send_offer(session).await
}

/// Operation 6: resolves simultaneous offers. The server's offer always
/// wins, so when the server is about to answer a remote offer while it is
/// itself mid-offer, the caller is expected to have already discarded the
/// server's outstanding offer via rollback before calling
/// `handle_remote_offer`. The server itself never rolls back its own offer;
/// a polite client is expected to detect the glare on its side and yield.
pub async fn resolve_glare(session: &Arc<PeerSession>) -> Result<(), SfuError> {
    let rollback: RTCSessionDescription =
        serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""}))
            .map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;
    session
        .pc
        .set_local_description(rollback)
        .await
        .map_err(|e| SfuError::NegotiationFailed(e.to_string()))?;
    session.is_making_offer.store(false, Ordering::SeqCst);
    info!(connection = %session.connection_id, "[SFU] rolled back local offer to resolve glare");
    Ok(())
}

/// True when the server is mid-offer and an incoming remote offer would
/// collide with it — the condition `resolve_glare` exists to handle.
pub fn is_glare(session: &Arc<PeerSession>) -> bool {
    session.is_making_offer.load(Ordering::SeqCst)
        && matches!(session.pc.signaling_state(), RTCSignalingState::HaveLocalOffer)
}

async fn create_and_send_offer(session: &Arc<PeerSession>) -> Result<(), SfuError> {
    session.is_making_offer.store(true, Ordering::SeqCst);
    let offer = session.pc.create_offer(None).await.map_err(|e| {
        session.is_making_offer.store(false, Ordering::SeqCst);
        SfuError::NegotiationFailed(e.to_string())
    })?;

    if let Err(e) = session.pc.set_local_description(offer).await {
        session.is_making_offer.store(false, Ordering::SeqCst);
        return Err(SfuError::NegotiationFailed(e.to_string()));
    }

    wait_for_gathering(session).await;

    let local_desc = session.pc.local_description().await.ok_or_else(|| {
        SfuError::NegotiationFailed("local description missing after set_local_description".to_string())
    })?;

    info!(connection = %session.connection_id, sdp_length = local_desc.sdp.len(), "[SFU] sending offer");
    session
        .sender
        .send(SignalingMessage::Offer { sdp: local_desc.sdp })
        .map_err(|e| {
            error!(connection = %session.connection_id, error = %e, "[SFU] failed to deliver offer");
            e
        })
}

async fn wait_for_gathering(session: &Arc<PeerSession>) {
    if session.pc.ice_gathering_state() == RTCIceGatheringState::Complete {
        return;
    }
    let mut gather_complete = session.pc.gathering_complete_promise().await;
    let _ = tokio::time::timeout(Duration::from_millis(GATHERING_TIMEOUT_MS), gather_complete.recv()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_types::{ConnectionId, RoomId, UserId};
    use crate::media_setup::MediaSetup;
    use crate::signaling_transport::SignalingSender;

    async fn make_session(conn: &str) -> Arc<PeerSession> {
        let api = MediaSetup::create_webrtc_api();
        let pc = Arc::new(api.new_peer_connection(MediaSetup::get_rtc_config()).await.unwrap());
        MediaSetup::configure_media_engine(&pc).await.unwrap();
        let (sender, rx) = SignalingSender::new(16);
        std::mem::forget(rx);
        Arc::new(PeerSession::new(
            pc,
            ConnectionId::from(conn),
            UserId::from("alice"),
            RoomId::from("room-1"),
            Arc::new(sender),
        ))
    }

    #[tokio::test]
    async fn test_send_initial_offer_sets_making_offer() {
        let session = make_session("c1").await;
        send_initial_offer(&session).await.unwrap();
        assert!(session.is_making_offer.load(Ordering::SeqCst));
        assert_eq!(
            SignalingState::from(session.pc.signaling_state()),
            SignalingState::HaveLocalOffer
        );
    }

    #[tokio::test]
    async fn test_maybe_renegotiate_defers_when_not_stable() {
        let session = make_session("c1").await;
        send_initial_offer(&session).await.unwrap();
        maybe_renegotiate(&session).await.unwrap();
        assert!(session.renegotiation_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_maybe_renegotiate_sends_offer_when_stable() {
        let session = make_session("c1").await;
        maybe_renegotiate(&session).await.unwrap();
        assert!(session.is_making_offer.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_is_glare_false_when_stable() {
        let session = make_session("c1").await;
        assert!(!is_glare(&session));
    }

    #[tokio::test]
    async fn test_resolve_glare_clears_making_offer() {
        let session = make_session("c1").await;
        send_initial_offer(&session).await.unwrap();
        assert!(is_glare(&session));
        resolve_glare(&session).await.unwrap();
        assert!(!session.is_making_offer.load(Ordering::SeqCst));
    }
}
