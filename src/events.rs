use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::CallError;
use crate::session::CallState;

/// Why a call was torn down without either side hanging up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    DeviceAccessDenied,
    DeviceUnavailable(String),
    Negotiation(String),
}

impl AbortReason {
    pub fn from_error(err: &CallError) -> Option<Self> {
        match err {
            CallError::DeviceAccessDenied => Some(AbortReason::DeviceAccessDenied),
            CallError::DeviceUnavailable(r) => Some(AbortReason::DeviceUnavailable(r.clone())),
            CallError::Negotiation(r) => Some(AbortReason::Negotiation(r.clone())),
            _ => None,
        }
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged { from: CallState, to: CallState },
    Aborted(AbortReason),
    /// Transport reported a failed path; the call is now `reconnecting`.
    ConnectionProblem,
    /// Transport recovered from `reconnecting`.
    ConnectionRecovered,
    RemoteStreamChanged,
}

#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<CallEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        debug!(?event, "emit");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn emit_state(&self, from: CallState, to: CallState) {
        if from != to {
            self.emit(CallEvent::StateChanged { from, to });
        }
    }
}
