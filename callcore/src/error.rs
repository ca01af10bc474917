//! Call failure taxonomy and classification.

use serde::Serialize;
use std::fmt;

/// User-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallErrorKind {
    PermissionDenied,
    DeviceNotFound,
    NetworkError,
    ConnectionFailed,
    PeerUnavailable,
    CallRejected,
    Unknown,
}

impl CallErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission-denied",
            Self::DeviceNotFound => "device-not-found",
            Self::NetworkError => "network-error",
            Self::ConnectionFailed => "connection-failed",
            Self::PeerUnavailable => "peer-unavailable",
            Self::CallRejected => "call-rejected",
            Self::Unknown => "unknown",
        }
    }

    /// Whether retrying the original action can help. A static property of
    /// the kind: a rejected call is never retried automatically.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::PermissionDenied
            | Self::DeviceNotFound
            | Self::NetworkError
            | Self::ConnectionFailed
            | Self::PeerUnavailable => true,
            Self::CallRejected | Self::Unknown => false,
        }
    }

    pub fn base_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "Camera and microphone permissions are required for calls.",
            Self::DeviceNotFound => "No camera or microphone device found.",
            Self::NetworkError => "Network connection issue detected.",
            Self::ConnectionFailed => "Failed to connect to the other participant.",
            Self::PeerUnavailable => "The other participant is currently unavailable.",
            Self::CallRejected => "Call was rejected by the other participant.",
            Self::Unknown => "An unexpected error occurred.",
        }
    }

    pub fn recovery_instructions(&self) -> [&'static str; 3] {
        match self {
            Self::PermissionDenied => [
                "Allow camera and microphone access for this application",
                "Select \"Always allow\" when prompted",
                "Try calling again",
            ],
            Self::DeviceNotFound => [
                "Make sure your camera and microphone are connected",
                "Check if other applications are using your devices",
                "Try calling again",
            ],
            Self::NetworkError => [
                "Check your internet connection",
                "Try switching to a more stable network",
                "Wait a moment and try again",
            ],
            Self::ConnectionFailed => [
                "Check your internet connection",
                "Ask the other person to check their connection",
                "Try calling again in a moment",
            ],
            Self::PeerUnavailable => [
                "The other person may not be online",
                "Try calling them later",
                "Send them a message to let them know you're trying to call",
            ],
            Self::CallRejected => [
                "The other person declined your call",
                "You can try calling again later",
                "Consider sending a message first",
            ],
            Self::Unknown => [
                "Try restarting the call",
                "Check your device permissions",
                "Contact support if the issue persists",
            ],
        }
    }
}

impl fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The underlying failure, as observed by the runtime layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Media access was refused by the user or the platform.
    Permission { detail: String },
    /// No capture device, or the device is held by another application.
    Device { detail: String, in_use: bool },
    /// The signal channel could not deliver.
    Network { detail: String },
    /// SDP/ICE negotiation or the peer connection failed.
    Connection { detail: String },
    /// Nobody picked up.
    PeerUnavailable,
    /// Remote party declined.
    Rejected,
    Other { detail: String },
}

impl FailureCause {
    fn detail(&self) -> Option<String> {
        match self {
            Self::Permission { detail }
            | Self::Device { detail, .. }
            | Self::Network { detail }
            | Self::Connection { detail }
            | Self::Other { detail } => Some(detail.clone()),
            Self::PeerUnavailable | Self::Rejected => None,
        }
    }
}

/// A classified call failure, surfaced to the UI instead of raw errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallErrorInfo {
    #[serde(rename = "type")]
    pub kind: CallErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub recoverable: bool,
    pub retry_count: u32,
}

impl CallErrorInfo {
    pub fn new(kind: CallErrorKind, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details,
            recoverable: kind.is_recoverable(),
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// The specific message, falling back to the per-kind text.
    pub fn display_message(&self) -> &str {
        if self.message.is_empty() {
            self.kind.base_message()
        } else {
            &self.message
        }
    }

    pub fn recovery_instructions(&self) -> [&'static str; 3] {
        self.kind.recovery_instructions()
    }
}

impl fmt::Display for CallErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.display_message())
    }
}

/// Maps a failure onto its user-facing category. Pure and total.
pub fn classify(cause: &FailureCause) -> CallErrorInfo {
    let details = cause.detail();
    let (kind, message) = match cause {
        FailureCause::Permission { .. } => (
            CallErrorKind::PermissionDenied,
            "Camera and microphone access denied. Please allow permissions and try again.",
        ),
        FailureCause::Device { in_use: false, .. } => (
            CallErrorKind::DeviceNotFound,
            "No camera or microphone found. Please connect a device and try again.",
        ),
        FailureCause::Device { in_use: true, .. } => (
            CallErrorKind::DeviceNotFound,
            "Camera or microphone is already in use by another application.",
        ),
        FailureCause::Network { .. } => (
            CallErrorKind::NetworkError,
            "Network connection failed. Please check your internet connection.",
        ),
        FailureCause::Connection { .. } => (
            CallErrorKind::ConnectionFailed,
            "Failed to establish connection with the remote peer.",
        ),
        FailureCause::PeerUnavailable => (
            CallErrorKind::PeerUnavailable,
            "The other participant did not answer.",
        ),
        FailureCause::Rejected => (
            CallErrorKind::CallRejected,
            "Call was rejected by the other participant.",
        ),
        FailureCause::Other { .. } => (
            CallErrorKind::Unknown,
            "An unknown error occurred during the call.",
        ),
    };
    CallErrorInfo::new(kind, message, details)
}
