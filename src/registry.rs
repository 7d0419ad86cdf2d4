use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::id_types::{RoomId, UserId};
use crate::metrics::SFU_ACTIVE_ROOMS;
use crate::peer_session::PeerSession;
use crate::room::Room;

/// Default grace period an empty room survives before reclamation, used
/// when `SFU_ROOM_GRACE_SECS` isn't set.
pub const DEFAULT_ROOM_GRACE_SECS: u64 = 10;

/// Process-wide room directory: lazily creates rooms on first join, evicts
/// a peer's prior session under the same identity, and reclaims rooms that
/// have sat empty past the grace period.
pub struct Registry {
    rooms: DashMap<RoomId, Arc<Room>>,
    grace_period: Duration,
}

impl Registry {
    pub fn new(grace_period_secs: u64) -> Self {
        Self {
            rooms: DashMap::new(),
            grace_period: Duration::from_secs(grace_period_secs),
        }
    }

    /// Returns the room for `room_id`, creating it if this is the first
    /// peer to ask for it.
    pub fn get_or_create_room(&self, room_id: &RoomId) -> Arc<Room> {
        if let Some(room) = self.rooms.get(room_id) {
            return room.clone();
        }
        let room = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!(room = %room_id, "[SFU] Room created");
                SFU_ACTIVE_ROOMS.inc();
                Arc::new(Room::new(room_id.clone()))
            })
            .clone();
        room
    }

    /// If a session under `user_id` already exists in `room`, removes it
    /// from the room and returns it so the caller can close its transport.
    /// Non-blocking on the join path: the actual peer-connection teardown
    /// is left to the caller to run concurrently with admitting the new
    /// session.
    pub async fn evict_duplicate(&self, room: &Room, user_id: &UserId) -> Option<Arc<PeerSession>> {
        let prior = room.find_by_user(user_id).await?;
        room.leave(&prior.connection_id).await;
        warn!(user = %user_id, room = %room.room_id, "[SFU] Evicting duplicate identity session");
        Some(prior)
    }

    /// Starts the grace-period reclamation timer for `room_id`. Race-safe
    /// against a concurrent join: the room is only actually removed if it
    /// is *still* empty once the timer fires, so a peer that joins during
    /// the grace window keeps the room alive without needing to cancel
    /// anything.
    pub fn schedule_reclaim(self: Arc<Self>, room_id: RoomId) {
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            let Some(room) = self.rooms.get(&room_id).map(|r| r.clone()) else {
                return;
            };
            if room.is_empty().await {
                self.rooms.remove(&room_id);
                SFU_ACTIVE_ROOMS.dec();
                info!(room = %room_id, "[SFU] Room reclaimed after grace period");
            }
        });
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
