use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SfuError;

/// Default capacity of a peer's outbound signaling queue. A publisher with a
/// stuck socket accumulates at most this many pending messages before the
/// transport reports `TransportOverflow` and the caller tears the session
/// down, per the backpressure-isolation requirement on the media side.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Interval between keepalive pings sent to an idle connection.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// A connection that misses this many consecutive keepalive windows is
/// considered dead and torn down.
pub const KEEPALIVE_MISSED_LIMIT: u32 = 3;

/// The JSON wire envelope exchanged over the signaling WebSocket. Tagged by
/// `event`, payload carried in `data`, matching the flat `{event, data}`
/// shape rather than an internally-tagged enum so the wire format stays
/// stable if variants gain or lose fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate {
        candidate: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    Chat { from: String, text: String },
    /// Carries the departing peer's `ConnectionId`, not its `UserId`: since a
    /// published stream's id equals its publisher's connection id, this is
    /// what lets a subscriber correlate the notice back to the egress track
    /// it should drop.
    ClientLeft { connection_id: String },
    Error { message: String },
}

/// Outbound half of a peer's signaling transport: a bounded channel paired
/// with the task pumping it onto the real WebSocket sink. Cloning this
/// handle is cheap (it is just an `mpsc::Sender`), so it can be stashed on
/// `PeerSession`, handed to the room's broadcast fan-out, and captured by
/// negotiation callbacks alike.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<SignalingMessage>,
}

impl SignalingSender {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SignalingMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueues a message for delivery. Non-blocking: a full queue means the
    /// peer isn't draining fast enough, and the caller should treat this
    /// session as unhealthy rather than stall the broadcaster or negotiation
    /// controller that called us.
    pub fn send(&self, msg: SignalingMessage) -> Result<(), SfuError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("signaling send queue overflowed");
                Err(SfuError::TransportOverflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SfuError::TransportClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Parses an inbound WebSocket text frame as a `SignalingMessage`. The wire
/// format nests one more level of string-encoding than the in-process enum
/// does: `data` is itself a JSON document serialized to a string, not a
/// bare object, so a frame round-trips through an intermediate `Value`
/// before it matches `SignalingMessage`'s own `{event, data}` tagging.
pub fn parse_inbound(raw: &str) -> Result<SignalingMessage, SfuError> {
    let envelope: serde_json::Value = serde_json::from_str(raw)?;
    let event = envelope
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SfuError::MalformedMessage("missing event field".to_string()))?;
    let data_str = envelope.get("data").and_then(|v| v.as_str()).unwrap_or("{}");
    let data_value: serde_json::Value = serde_json::from_str(data_str)?;
    let reconstructed = serde_json::json!({ "event": event, "data": data_value });
    serde_json::from_value(reconstructed).map_err(SfuError::from)
}

/// Serializes an outbound message for the WebSocket text frame, re-wrapping
/// the payload as a string per the wire format (see `parse_inbound`).
pub fn encode_outbound(msg: &SignalingMessage) -> Result<String, SfuError> {
    let value = serde_json::to_value(msg)?;
    let event = value.get("event").and_then(|v| v.as_str()).unwrap_or_default();
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
    let data_str = serde_json::to_string(&data)?;
    Ok(serde_json::json!({ "event": event, "data": data_str }).to_string())
}
