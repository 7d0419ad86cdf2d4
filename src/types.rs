use std::sync::Arc;

use dashmap::DashMap;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::broadcaster::TrackBroadcaster;
use crate::id_types::{ConnectionId, RoomId, StreamId};
use crate::signaling_transport::SignalingSender;

/// Peer Sessions are keyed by connection, not by user: the same `UserId` may
/// hold at most one live session per room (enforced by the registry's
/// duplicate-identity eviction), but the map key is the fresher
/// `ConnectionId` so a session being torn down never collides with the one
/// replacing it mid-eviction.
pub type SessionKey = (RoomId, ConnectionId);

/// Local Forwarded Tracks are identified by the stream that publishes them;
/// `StreamId` is minted equal to the publishing connection's id (see
/// `room.rs`), so lookups never need the publisher's `UserId`.
pub type TrackKey = (RoomId, StreamId);

/// Outbound handle shared by every collaborator that needs to push a
/// signaling message to one peer: negotiation offers, ICE candidates, chat
/// fan-out, `client-left` notices.
pub type SharedSignalingSender = Arc<SignalingSender>;

/// Process-wide map of publishing tracks available for subscription, keyed
/// by the room-scoped stream that carries them.
pub type TrackMap = Arc<DashMap<TrackKey, Arc<TrackBroadcaster>>>;

/// Maps a `StreamId` this peer is subscribed to back to the `RTCRtpSender`
/// carrying it on that peer's connection, kept per-peer so a publisher's
/// `client-left` can remove exactly that egress track and renegotiate it
/// away rather than leaving a dead sender advertised in the next offer.
pub type EgressSenderMap = Arc<DashMap<StreamId, Arc<RTCRtpSender>>>;
