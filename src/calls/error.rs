//! Call-related error types.

use callcore::{
    CallErrorInfo, CallPhase, FailureCause, InvalidTransition, SignalError, SignalType,
};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode signal: {0}")]
    Encode(#[from] SignalError),

    #[error("failed to send {kind} to {to}: {reason}")]
    Send {
        kind: SignalType,
        to: String,
        reason: String,
    },
}

/// Why the media collaborator refused a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFailure {
    /// The user or the platform denied access.
    NotAllowed,
    /// No matching device.
    NotFound,
    /// The device exists but could not be opened, usually because another
    /// application holds it.
    NotReadable,
    Other,
}

impl fmt::Display for MediaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotAllowed => "NotAllowedError",
            Self::NotFound => "NotFoundError",
            Self::NotReadable => "NotReadableError",
            Self::Other => "MediaError",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct MediaError {
    pub kind: MediaFailure,
    pub message: String,
}

impl MediaError {
    pub fn new(kind: MediaFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::new(MediaFailure::NotAllowed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(MediaFailure::NotFound, message)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("peer session is closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn negotiation(context: &str, err: anyhow::Error) -> Self {
        Self::Negotiation(format!("{context}: {err}"))
    }

    /// The failure as seen by error classification.
    pub fn failure_cause(&self) -> FailureCause {
        let detail = self.to_string();
        match self {
            Self::Media(media) => match media.kind {
                MediaFailure::NotAllowed => FailureCause::Permission { detail },
                MediaFailure::NotFound => FailureCause::Device {
                    detail,
                    in_use: false,
                },
                MediaFailure::NotReadable => FailureCause::Device {
                    detail,
                    in_use: true,
                },
                MediaFailure::Other => FailureCause::Other { detail },
            },
            Self::Transport(_) => FailureCause::Network { detail },
            Self::Negotiation(_) => FailureCause::Connection { detail },
            Self::Closed => FailureCause::Other { detail },
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already active ({0})")]
    Busy(CallPhase),

    #[error("no pending call to confirm")]
    NoPendingCall,

    #[error("no incoming call to answer")]
    NoIncomingCall,

    #[error("no active call")]
    NotActive,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    /// The call was torn down; the classified error was also broadcast.
    #[error("call failed: {0}")]
    Failed(CallErrorInfo),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("call manager stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::{CallErrorKind, classify};

    #[test]
    fn test_media_failures_classify() {
        let cases = [
            (MediaFailure::NotAllowed, CallErrorKind::PermissionDenied),
            (MediaFailure::NotFound, CallErrorKind::DeviceNotFound),
            (MediaFailure::NotReadable, CallErrorKind::DeviceNotFound),
            (MediaFailure::Other, CallErrorKind::Unknown),
        ];
        for (failure, kind) in cases {
            let err = SessionError::from(MediaError::new(failure, "boom"));
            assert_eq!(classify(&err.failure_cause()).kind, kind);
        }
    }

    #[test]
    fn test_transport_is_network() {
        let err = SessionError::from(TransportError::Send {
            kind: SignalType::Offer,
            to: "bob".into(),
            reason: "offline".into(),
        });
        let info = classify(&err.failure_cause());
        assert_eq!(info.kind, CallErrorKind::NetworkError);
        assert!(info.details.unwrap().contains("offline"));
    }

    #[test]
    fn test_negotiation_is_connection() {
        let err = SessionError::negotiation("setRemoteDescription", anyhow::anyhow!("bad sdp"));
        assert_eq!(
            classify(&err.failure_cause()).kind,
            CallErrorKind::ConnectionFailed
        );
        assert_eq!(
            err.to_string(),
            "negotiation failed: setRemoteDescription: bad sdp"
        );
    }
}
