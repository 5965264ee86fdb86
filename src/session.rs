use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::peer::media::{MediaStream, RemoteStream};
use crate::peer::types::PeerInfo;
use crate::utils::random_id;

/// Lifecycle state of the (single) call.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    Outgoing,
    Incoming,
    Connected,
    Reconnecting,
    Ending,
}

impl CallState {
    pub fn is_idle(self) -> bool {
        self == CallState::Idle
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "outgoing",
            CallState::Incoming => "incoming",
            CallState::Connected => "connected",
            CallState::Reconnecting => "reconnecting",
            CallState::Ending => "ending",
        };
        f.write_str(s)
    }
}

/// The in-memory record of the active call. At most one exists per process.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub state: CallState,
    pub is_video: bool,
    pub peer: PeerInfo,
    pub started_at: DateTime<Utc>,
    /// Peer-connection generation; transport events carrying another value are stale.
    pub generation: u64,
    /// Whether the peer has seen anything from us (or we from them) for this call.
    pub peer_contacted: bool,
}

impl CallSession {
    pub fn outgoing(peer: PeerInfo, is_video: bool, generation: u64) -> Self {
        Self {
            call_id: random_id(),
            state: CallState::Outgoing,
            is_video,
            peer,
            started_at: Utc::now(),
            generation,
            peer_contacted: false,
        }
    }

    pub fn incoming(peer: PeerInfo, is_video: bool, generation: u64) -> Self {
        Self {
            call_id: random_id(),
            state: CallState::Incoming,
            is_video,
            peer,
            started_at: Utc::now(),
            generation,
            peer_contacted: true,
        }
    }
}

/// Read-only view of the call published after every handled command.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<String>,
    pub is_video: bool,
    pub peer: Option<PeerInfo>,
    pub started_at: Option<DateTime<Utc>>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<RemoteStream>,
    pub muted: bool,
    pub video_enabled: bool,
    /// Remote candidates waiting for a remote description.
    pub queued_candidates: usize,
}
