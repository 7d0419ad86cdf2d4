use std::fmt;
use std::sync::Arc;

/// A strongly typed identifier for a Room.
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(pub Arc<String>);

/// A strongly typed identifier for a User. Stable across reconnects, unlike
/// `ConnectionId`.
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub Arc<String>);

/// A strongly typed identifier for one signaling connection. Fresh per
/// connection; used for log correlation and stamped as the stream id on
/// every track a peer publishes, so subscribers can map a `client-left`
/// event back to the streams they should drop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Arc<String>);

/// A strongly typed identifier for a Stream.
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(pub Arc<String>);

/// A strongly typed identifier for a Track.
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(pub Arc<String>);

macro_rules! strong_id {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                $ty(Arc::new(s))
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                $ty(Arc::new(s.to_string()))
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

strong_id!(RoomId);
strong_id!(UserId);
strong_id!(ConnectionId);
strong_id!(StreamId);
strong_id!(TrackId);

impl RoomId {
    /// Enforces the data-model invariant: non-empty, at most 255 bytes.
    /// Comparisons on `RoomId` are already case-sensitive (derived `Eq`).
    pub fn validate(raw: &str) -> Result<(), &'static str> {
        if raw.is_empty() {
            return Err("room id must not be empty");
        }
        if raw.len() > 255 {
            return Err("room id must not exceed 255 bytes");
        }
        Ok(())
    }
}
