//! Runtime-agnostic core of the call signaling stack.
//!
//! Everything in here is plain data and pure functions: the wire format of
//! call signals, the call state transition table, failure classification and
//! media constraint presets. The async runtime pieces (signal channel, peer
//! session, call manager) live in the `chatcall` crate and build on these.

pub mod error;
pub mod media;
pub mod signal;
pub mod state;
pub mod types;

pub use error::{CallErrorInfo, CallErrorKind, FailureCause, classify};
pub use media::{
    AudioConstraints, AudioQuality, CallSettings, DisplayConstraints, MediaConstraints, TrackKind,
    VideoConstraints, VideoQuality,
};
pub use signal::{
    CallSignal, CandidateType, IceCandidateInit, SdpType, SessionDescription, SignalError, SignalInsert,
    SignalPayload, SignalRow, SignalType,
};
pub use state::{CallPhase, CallTransition, EndReason, InvalidTransition};
pub use types::call::{CallKey, CallType, format_call_duration, is_offerer};
