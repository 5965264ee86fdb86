pub mod commands;
pub mod config;
pub mod errors;
pub mod events;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(test)]
mod testing;

pub use commands::CallFacade;
pub use config::{CallConfig, IceServerKind, ServerConfig};
pub use errors::{BusError, CallError, MediaError};
pub use events::{AbortReason, CallEvent};
pub use peer::connection::{PeerConnection, PeerConnectionFactory, RtcPeerFactory};
pub use peer::machine::Collaborators;
pub use peer::media::{MediaDevices, MediaStream, MediaTrack, RemoteStream, TrackKind};
pub use peer::types::{IceCandidate, PeerInfo, SignalMessage};
pub use session::{CallSnapshot, CallState};
pub use signaling::{IdentityProvider, InboundHandler, SignalBus};
