pub mod connection;
pub mod ice;
pub mod machine;
pub mod media;
pub mod types;

pub use types::{IceCandidate, PeerInfo, SessionDescription, Signal, SignalKind, SignalMessage};
