use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::id_types::{ConnectionId, RoomId};
use crate::metrics::{SFU_ACTIVE_PEERS, SFU_CHAT_MESSAGES_TOTAL};
use crate::peer_session::PeerSession;
use crate::signaling_transport::SignalingMessage;

/// A room's live peer set. Every session in a room can see every other
/// session in that same room and nothing from any other room — the
/// isolation invariant — because a `Room` only ever iterates its own
/// `peers` map.
pub struct Room {
    pub room_id: RoomId,
    peers: RwLock<HashMap<ConnectionId, Arc<PeerSession>>>,
}

impl Room {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `session` in this room. Returns the sessions already
    /// present at the moment of the call, to build the "existing tracks"
    /// snapshot a joining peer is subscribed to before its initial offer is
    /// created.
    pub async fn join(&self, session: Arc<PeerSession>) -> Vec<Arc<PeerSession>> {
        let mut peers = self.peers.write().await;
        let existing: Vec<Arc<PeerSession>> = peers.values().cloned().collect();
        peers.insert(session.connection_id.clone(), session);
        SFU_ACTIVE_PEERS.set(peers.len() as i64);
        existing
    }

    /// Removes a session. Returns `true` if the room is now empty, which
    /// the registry uses to start the grace-period reclamation timer.
    pub async fn leave(&self, connection_id: &ConnectionId) -> bool {
        let mut peers = self.peers.write().await;
        peers.remove(connection_id);
        SFU_ACTIVE_PEERS.set(peers.len() as i64);
        peers.is_empty()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Finds the session already holding `user_id` in this room, if any —
    /// used by the registry's duplicate-identity eviction before a new
    /// session under the same identity is registered.
    pub async fn find_by_user(&self, user_id: &crate::id_types::UserId) -> Option<Arc<PeerSession>> {
        self.peers
            .read()
            .await
            .values()
            .find(|p| &p.user_id == user_id)
            .cloned()
    }

    /// Sends `msg` to every peer in the room except `exclude` (typically the
    /// sender, for chat and `client-left` fan-out).
    pub async fn broadcast(&self, msg: SignalingMessage, exclude: Option<&ConnectionId>) {
        let is_chat = matches!(msg, SignalingMessage::Chat { .. });
        let peers = self.peers.read().await;
        let mut sent = 0u32;
        for (connection_id, session) in peers.iter() {
            if Some(connection_id) == exclude {
                continue;
            }
            if session.sender.send(msg.clone()).is_ok() {
                sent += 1;
            }
        }
        if is_chat {
            SFU_CHAT_MESSAGES_TOTAL.inc_by(sent as u64);
        }
        info!(room = %self.room_id, recipients = sent, "[SFU] Broadcast message to room");
    }
}
