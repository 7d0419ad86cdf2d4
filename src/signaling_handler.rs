use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::auth;
use crate::error::SfuError;
use crate::id_types::{ConnectionId, RoomId, StreamId, UserId};
use crate::media_relay;
use crate::media_setup::MediaSetup;
use crate::metrics::{
    SFU_SIGNALING_CONNECTIONS_ACTIVE, SFU_SIGNALING_CONNECTIONS_TOTAL,
    SFU_SIGNALING_MESSAGES_PROCESSED_TOTAL, SFU_TRACKS_REMOVED_TOTAL, SFU_WEBRTC_CONNECTIONS_TOTAL,
};
use crate::negotiation;
use crate::peer_session::PeerSession;
use crate::registry::Registry;
use crate::signaling_transport::{
    encode_outbound, parse_inbound, SignalingMessage, SignalingSender, KEEPALIVE_MISSED_LIMIT,
};
use crate::types::TrackMap;

/// Minimum framed message size the transport must accept per the wire
/// contract (large SDP offers/answers can approach this).
const MAX_MESSAGE_SIZE_BYTES: usize = 65536;

/// Shared state handed to every `/ws` upgrade.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: Arc<Registry>,
    pub tracks: TrackMap,
    pub token_secret: Option<Arc<String>>,
    pub send_queue_capacity: usize,
    pub keepalive_interval_secs: u64,
}

/// Builds the `/ws` route: a query-param-driven WebSocket upgrade that joins
/// a room, runs the full signaling lifecycle for that connection, and tears
/// down cleanly on disconnect.
pub fn ws_route(
    state: SignalingState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("ws")
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::any().map(move || state.clone()))
        .map(|ws: warp::ws::Ws, query: HashMap<String, String>, state: SignalingState| {
            ws.max_message_size(MAX_MESSAGE_SIZE_BYTES)
                .on_upgrade(move |socket| handle_connection(socket, query, state))
        })
}

async fn handle_connection(socket: WebSocket, query: HashMap<String, String>, state: SignalingState) {
    let room_id = RoomId::from(query.get("room").map(String::as_str).unwrap_or("default"));
    if let Err(e) = RoomId::validate(room_id.as_ref()) {
        warn!(room = %room_id, error = e, "[SFU] rejected connection with invalid room id");
        return;
    }

    let user_id = match query.get("userId") {
        Some(id) if !id.is_empty() => UserId::from(id.as_str()),
        _ => {
            warn!("[SFU] connection arrived without userId, synthesizing one");
            UserId::from(Uuid::new_v4().to_string())
        }
    };

    if let Some(secret) = &state.token_secret {
        match query.get("token") {
            Some(token) => {
                if let Err(e) = auth::validate_token(token, secret.as_bytes(), room_id.as_ref()) {
                    warn!(room = %room_id, user = %user_id, error = %e, "[SFU] rejected connection with invalid token");
                    return;
                }
            }
            None => {
                warn!(room = %room_id, user = %user_id, "[SFU] rejected connection missing required token");
                return;
            }
        }
    }

    let connection_id = ConnectionId::from(Uuid::new_v4().to_string());
    SFU_SIGNALING_CONNECTIONS_TOTAL.inc();
    SFU_SIGNALING_CONNECTIONS_ACTIVE.inc();

    run_session(socket, state, room_id, user_id, connection_id).await;

    SFU_SIGNALING_CONNECTIONS_ACTIVE.dec();
}

async fn run_session(
    socket: WebSocket,
    state: SignalingState,
    room_id: RoomId,
    user_id: UserId,
    connection_id: ConnectionId,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sender, mut outbound_rx) = SignalingSender::new(state.send_queue_capacity);
    let sender = Arc::new(sender);

    let api = MediaSetup::create_webrtc_api();
    let pc = match api.new_peer_connection(MediaSetup::get_rtc_config()).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            error!(error = %e, "[SFU] failed to create peer connection");
            return;
        }
    };
    if let Err(e) = MediaSetup::configure_media_engine(&pc).await {
        error!(error = %e, "[SFU] failed to configure media engine");
        return;
    }
    SFU_WEBRTC_CONNECTIONS_TOTAL.inc();

    let room = state.registry.get_or_create_room(&room_id);
    if let Some(prior) = state.registry.evict_duplicate(&room, &user_id).await {
        let collision = SfuError::IdentityCollision(user_id.to_string(), room_id.to_string());
        let _ = prior.sender.send(SignalingMessage::Error {
            message: collision.to_string(),
        });
        let _ = prior.pc.close().await;
    }

    let session = Arc::new(PeerSession::new(pc.clone(), connection_id.clone(), user_id.clone(), room_id.clone(), sender));
    session.register_ice_candidate_handler();
    session.register_connection_state_handler();
    media_relay::attach_track_handler(session.clone(), room.clone(), state.tracks.clone());

    MediaSetup::subscribe_to_existing_tracks(&session, &state.tracks).await;
    room.join(session.clone()).await;

    if let Err(e) = negotiation::send_initial_offer(&session).await {
        error!(connection = %connection_id, error = %e, "[SFU] failed to send initial offer");
    }

    // Drains outbound signaling messages onto the socket and, on the same
    // task (so nothing ever writes `ws_tx` concurrently), probes the
    // connection with WebSocket ping frames. A client that misses
    // `KEEPALIVE_MISSED_LIMIT` consecutive pongs is presumed dead and wakes
    // `session.terminate` rather than leaving the session parked forever.
    let missed_pongs = Arc::new(AtomicU32::new(0));
    let send_pump = {
        let connection_id = connection_id.clone();
        let missed_pongs = missed_pongs.clone();
        let terminate = session.terminate.clone();
        let keepalive_interval_secs = state.keepalive_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(keepalive_interval_secs));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    maybe_msg = outbound_rx.recv() => {
                        let Some(msg) = maybe_msg else { break };
                        match encode_outbound(&msg) {
                            Ok(text) => {
                                if ws_tx.send(Message::text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(connection = %connection_id, error = %e, "[SFU] failed to encode outbound message"),
                        }
                    }
                    _ = ticker.tick() => {
                        let missed = missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
                        if missed > KEEPALIVE_MISSED_LIMIT {
                            warn!(connection = %connection_id, missed, "[SFU] keepalive missed too many pongs, terminating session");
                            terminate.notify_one();
                            break;
                        }
                        if ws_tx.send(Message::ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(frame) = frame else { break };
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        info!(connection = %connection_id, error = %e, "[SFU] signaling socket read error");
                        break;
                    }
                };
                if frame.is_close() {
                    break;
                }
                if frame.is_pong() {
                    missed_pongs.store(0, Ordering::SeqCst);
                    continue;
                }
                if !frame.is_text() {
                    continue;
                }
                let Ok(text) = frame.to_str() else { continue };

                match parse_inbound(text) {
                    Ok(msg) => {
                        if let Err(e) = dispatch_inbound(&session, &room, msg).await {
                            match e {
                                SfuError::TransportClosed => {
                                    info!(connection = %connection_id, "[SFU] peer transport closed during dispatch");
                                }
                                _ => warn!(connection = %connection_id, error = %e, "[SFU] error handling inbound message"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "[SFU] malformed inbound signaling message");
                        let _ = session.sender.send(SignalingMessage::Error {
                            message: "malformed message".to_string(),
                        });
                    }
                }
            }
            _ = session.terminate.notified() => {
                info!(connection = %connection_id, "[SFU] session terminated by keepalive watchdog or media failure");
                break;
            }
        }
    }

    send_pump.abort();
    teardown(&session, &room, &state).await;
}

async fn dispatch_inbound(
    session: &Arc<PeerSession>,
    room: &Arc<crate::room::Room>,
    msg: SignalingMessage,
) -> Result<(), SfuError> {
    match msg {
        SignalingMessage::Offer { sdp } => {
            SFU_SIGNALING_MESSAGES_PROCESSED_TOTAL.with_label_values(&["offer"]).inc();
            if negotiation::is_glare(session) {
                negotiation::resolve_glare(session).await?;
            }
            let answer = negotiation::handle_remote_offer(session, sdp).await?;
            session.sender.send(answer)
        }
        SignalingMessage::Answer { sdp } => {
            SFU_SIGNALING_MESSAGES_PROCESSED_TOTAL.with_label_values(&["answer"]).inc();
            negotiation::handle_remote_answer(session, sdp).await
        }
        SignalingMessage::Candidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => {
            SFU_SIGNALING_MESSAGES_PROCESSED_TOTAL.with_label_values(&["candidate"]).inc();
            negotiation::handle_remote_candidate(session, candidate, sdp_mid, sdp_mline_index).await
        }
        SignalingMessage::Chat { from, text } => {
            SFU_SIGNALING_MESSAGES_PROCESSED_TOTAL.with_label_values(&["chat"]).inc();
            room.broadcast(SignalingMessage::Chat { from, text }, Some(&session.connection_id)).await;
            Ok(())
        }
        SignalingMessage::ClientLeft { .. } | SignalingMessage::Error { .. } => Ok(()),
    }
}

/// Leaves the room, notifies the remaining peers, removes the departed
/// publisher's egress tracks from each subscriber, and starts grace-period
/// reclamation if the room is now empty. Ordering matters here: `client-left`
/// must reach every remaining peer before the room's own subsequent
/// renegotiation carrying the track removal, so the broadcast happens before
/// the track map mutation and the per-subscriber `remove_track` calls.
async fn teardown(session: &Arc<PeerSession>, room: &Arc<crate::room::Room>, state: &SignalingState) {
    let now_empty = room.leave(&session.connection_id).await;

    room.broadcast(
        SignalingMessage::ClientLeft {
            connection_id: session.connection_id.to_string(),
        },
        Some(&session.connection_id),
    )
    .await;

    let stream_id = StreamId::from(session.connection_id.as_ref());
    if state.tracks.remove(&(session.room_id.clone(), stream_id.clone())).is_some() {
        SFU_TRACKS_REMOVED_TOTAL.inc();
    }

    for peer in room.peers().await {
        if let Some((_, sender)) = peer.egress_senders.remove(&stream_id) {
            if let Err(e) = peer.pc.remove_track(&sender).await {
                warn!(connection = %peer.connection_id, error = %e, "[SFU] failed to remove departed publisher's egress track");
            }
        }
        if let Err(e) = negotiation::maybe_renegotiate(&peer).await {
            warn!(connection = %peer.connection_id, error = %e, "[SFU] renegotiation after departure failed");
        }
    }

    let _ = session.pc.close().await;

    if now_empty {
        state.registry.clone().schedule_reclaim(session.room_id.clone());
    }

    info!(connection = %session.connection_id, room = %session.room_id, "[SFU] session closed");
}
