//! Observable call state, published by the manager on every change.

use super::media::MediaStream;
use callcore::{CallErrorInfo, CallKey, CallPhase, CallType, format_call_duration};
use chrono::{DateTime, Utc};

/// A call the user asked for but has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub remote_user: String,
    pub conversation_id: String,
    pub call_type: CallType,
}

/// The last call that failed with a recoverable error, kept for retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedCall {
    pub key: CallKey,
    pub call_type: CallType,
    pub error: CallErrorInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Good,
    Poor,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct CallState {
    pub phase: CallPhase,
    /// Set while we are calling, connecting or connected.
    pub is_in_call: bool,
    /// Set while a remote call is ringing locally.
    pub is_incoming_call: bool,
    pub call_type: Option<CallType>,
    pub remote_user_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Display name from `call-request`, incoming calls only.
    pub caller_name: Option<String>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub is_screen_sharing: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub pending_call: Option<PendingCall>,
    pub failed_call: Option<FailedCall>,
}

impl CallState {
    /// Elapsed time since connect as `mm:ss`.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<String> {
        self.connected_at
            .map(|at| format_call_duration((now - at).num_seconds()))
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        match (&self.local_stream, &self.remote_stream) {
            (Some(_), Some(_)) => ConnectionQuality::Good,
            (Some(_), None) => ConnectionQuality::Unknown,
            _ => ConnectionQuality::Poor,
        }
    }
}
