pub mod auth;
pub mod broadcaster;
pub mod error;
pub mod health;
pub mod id_types;
pub mod media_relay;
pub mod media_setup;
pub mod metrics;
pub mod negotiation;
pub mod peer_session;
pub mod registry;
pub mod room;
pub mod signaling_handler;
pub mod signaling_transport;
pub mod types;

pub use media_setup::MediaSetup;
pub use peer_session::PeerSession;
pub use registry::Registry;
pub use room::Room;
