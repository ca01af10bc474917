//! Call state machine implementation.
//!
//! Caller path: `Idle → OutgoingRinging → Connecting → InCall → Idle`.
//! Callee path: `Idle → IncomingRinging → Connecting → InCall → Idle`.
//! Any active phase may fall back to `Idle` when the call ends or fails.

use serde::Serialize;
use std::fmt;

/// Lifecycle phase of the single call a client may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CallPhase {
    #[default]
    Idle,
    /// We sent `call-request` and wait for the callee.
    OutgoingRinging,
    /// A `call-request` is ringing locally.
    IncomingRinging,
    /// Accepted; SDP offer/answer in flight.
    Connecting,
    /// Negotiation complete.
    InCall,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::OutgoingRinging => "outgoing-ringing",
            Self::IncomingRinging => "incoming-ringing",
            Self::Connecting => "connecting",
            Self::InCall => "in-call",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::OutgoingRinging | Self::IncomingRinging)
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::IncomingRinging)
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::IncomingRinging)
    }

    /// Phases in which trickled ICE candidates are meaningful.
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            Self::OutgoingRinging | Self::Connecting | Self::InCall
        )
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call returned to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Local user hung up.
    LocalEnded,
    /// Remote party sent `end-call`.
    RemoteEnded,
    /// Local user declined the incoming call.
    LocalRejected,
    /// Remote party sent `call-reject`.
    RemoteRejected,
    /// Peer connection reported `failed` or `disconnected`.
    ConnectionLost,
    /// Nobody answered before the ring timeout.
    RingTimeout,
    /// Media or negotiation failure.
    Failed,
    /// Simultaneous initiation resolved in favour of the remote call.
    Superseded,
}

/// Inputs to the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// Local user confirmed the pre-call dialog; `call-request` goes out.
    Confirmed,
    /// Inbound `call-request`.
    RequestReceived,
    /// Local user picked up.
    LocalAccepted,
    /// Inbound `call-accept`.
    RemoteAccepted,
    /// Inbound `offer`.
    OfferReceived,
    /// We answered the remote offer.
    AnswerSent,
    /// Inbound `answer` applied.
    AnswerReceived,
    /// Peer connection reported `connected`.
    MediaConnected,
    /// Inbound or outbound `ice-candidate`.
    IceCandidate,
    /// Call is over, for any reason.
    Terminated(EndReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: CallPhase,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl CallPhase {
    /// Returns the phase reached by applying `transition`, or an error when
    /// the input is not valid in this phase.
    ///
    /// `Terminated` is accepted everywhere, including `Idle`, so teardown is
    /// always safe to repeat.
    pub fn next(self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        use CallPhase::*;
        use CallTransition as T;

        let next = match (self, transition) {
            (_, T::Terminated(_)) => Idle,

            (Idle, T::Confirmed) => OutgoingRinging,
            (Idle, T::RequestReceived) => IncomingRinging,

            (IncomingRinging, T::LocalAccepted) => Connecting,
            // An early offer is held until the local user accepts.
            (IncomingRinging, T::OfferReceived) => IncomingRinging,

            (OutgoingRinging, T::RemoteAccepted) => Connecting,
            // Glare where the remote side became the offerer.
            (OutgoingRinging, T::OfferReceived) => Connecting,

            (Connecting, T::OfferReceived) => Connecting,
            (Connecting, T::AnswerSent | T::AnswerReceived | T::MediaConnected) => InCall,

            (InCall, T::MediaConnected) => InCall,

            (phase, T::IceCandidate) if phase.accepts_candidates() => phase,

            (current, attempted) => {
                return Err(InvalidTransition { current, attempted });
            }
        };
        Ok(next)
    }
}
