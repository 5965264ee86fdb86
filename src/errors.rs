//! Call error types.
//!
//! `CallError` is what the facade hands back to the presentation layer. Only
//! device and negotiation failures are meant to be shown to the user; the rest
//! are logged where they happen.

use thiserror::Error;

/// Failure reported by a [`crate::signaling::SignalBus`] adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// The bus rejected the subscription outright.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// Publishing a payload failed.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The underlying connection to the bus is gone.
    #[error("bus disconnected")]
    Disconnected,
}

/// Failure reported by [`crate::peer::media::MediaDevices`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// The user refused camera/microphone access.
    #[error("permission denied")]
    PermissionDenied,

    /// No usable capture device (missing, busy, or otherwise failing).
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Call subsystem error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// User refused camera/microphone.
    #[error("camera/microphone access denied")]
    DeviceAccessDenied,

    /// Capture device could not be opened for a reason other than denial.
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Description generation or application failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Outbound channel failed to confirm its subscription in time.
    #[error("subscription to {channel} timed out")]
    ChannelSubscriptionTimeout { channel: String },

    /// Signal bus adapter error.
    #[error("signal bus error: {0}")]
    Bus(#[from] BusError),

    /// A call is already in progress.
    #[error("a call is already in progress ({0})")]
    Busy(String),

    /// Command does not apply to the current call state.
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    /// No authenticated user to signal as.
    #[error("no authenticated user")]
    NotAuthenticated,

    /// Wire payload could not be encoded or decoded.
    #[error("malformed signal: {0}")]
    Malformed(String),

    /// The call ended while the command was still waiting on it.
    #[error("call ended before the command completed")]
    Cancelled,

    /// The controller task has shut down.
    #[error("call controller is not running")]
    ControllerClosed,
}

impl CallError {
    /// Whether the presentation layer should show this failure to the user.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            CallError::DeviceAccessDenied
                | CallError::DeviceUnavailable(_)
                | CallError::Negotiation(_)
        )
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied => CallError::DeviceAccessDenied,
            MediaError::Unavailable(reason) => CallError::DeviceUnavailable(reason),
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Malformed(err.to_string())
    }
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        CallError::Negotiation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_error_maps_to_distinct_denial() {
        assert_eq!(
            CallError::from(MediaError::PermissionDenied),
            CallError::DeviceAccessDenied
        );
        assert_eq!(
            CallError::from(MediaError::Unavailable("busy".to_string())),
            CallError::DeviceUnavailable("busy".to_string())
        );
    }

    #[test]
    fn test_user_visibility() {
        assert!(CallError::DeviceAccessDenied.is_user_visible());
        assert!(CallError::Negotiation("bad sdp".to_string()).is_user_visible());
        assert!(!CallError::ChannelSubscriptionTimeout {
            channel: "signaling:b".to_string()
        }
        .is_user_visible());
        assert!(!CallError::Bus(BusError::Disconnected).is_user_visible());
    }

    #[test]
    fn test_display_messages() {
        let err = CallError::InvalidState {
            action: "answer",
            state: "idle".to_string(),
        };
        assert_eq!(err.to_string(), "cannot answer while idle");
    }
}
