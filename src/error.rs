use thiserror::Error;

/// Error taxonomy for the SFU core. Every fallible operation across
/// transport, negotiation, and media relay resolves to one of these kinds so
/// callers can decide whether a failure is session-scoped (tear down this
/// peer only) or needs to surface further up.
#[derive(Debug, Error)]
pub enum SfuError {
    /// The signaling transport's underlying socket is gone; further sends
    /// are no-ops.
    #[error("signaling transport closed")]
    TransportClosed,

    /// The outbound send queue is full; the peer is not draining messages
    /// fast enough.
    #[error("signaling transport send queue overflowed")]
    TransportOverflow,

    /// Inbound message failed to parse as the expected JSON envelope.
    #[error("malformed signaling message: {0}")]
    MalformedMessage(String),

    /// An SDP offer/answer or ICE candidate application failed.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A webrtc-rs media operation (add_track, write_rtcp, read_rtp, ...)
    /// returned an error.
    #[error("media track error: {0}")]
    MediaTrackError(String),

    /// A user re-joined a room under an identity already present; the prior
    /// session is evicted.
    #[error("identity collision for user {0} in room {1}")]
    IdentityCollision(String, String),

    /// The presented access token failed signature, expiry, or claim
    /// cross-check validation.
    #[error("token invalid: {0}")]
    TokenInvalid(String),

    /// A per-session task panicked; the panic was caught and the session
    /// torn down rather than taking the process down with it.
    #[error("session task panicked: {0}")]
    PanicRecovered(String),
}

impl From<webrtc::Error> for SfuError {
    fn from(err: webrtc::Error) -> Self {
        SfuError::MediaTrackError(err.to_string())
    }
}

impl From<serde_json::Error> for SfuError {
    fn from(err: serde_json::Error) -> Self {
        SfuError::MalformedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = SfuError::IdentityCollision("alice".into(), "room-1".into());
        assert_eq!(e.to_string(), "identity collision for user alice in room room-1");

        let e = SfuError::TokenInvalid("expired".into());
        assert_eq!(e.to_string(), "token invalid: expired");
    }

    #[test]
    fn test_from_serde_json_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SfuError = parse_err.into();
        assert!(matches!(err, SfuError::MalformedMessage(_)));
    }
}
