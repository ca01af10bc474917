//! Call signal wire format.
//!
//! Signals travel through the backend as rows of the `call_signals` table:
//!
//! ```text
//! call_signals(id, from_user, to_user, signal_type, signal_data, conversation_id, created_at)
//! ```
//!
//! `signal_data` is a JSON object whose shape depends on `signal_type`:
//!
//! | signal_type     | signal_data                                   |
//! |-----------------|-----------------------------------------------|
//! | `offer`/`answer`| `{type, sdp, callType?}`                      |
//! | `ice-candidate` | `{candidate, sdpMid?, sdpMLineIndex?, ...}`   |
//! | `call-request`  | `{type, callerName}`                          |
//! | `call-accept`   | `{type?}`                                     |
//! | others          | `{}`                                          |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::call::CallType;

const UNKNOWN_CALLER: &str = "Unknown";

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("unknown signal type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: SignalType,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: SignalType,
        #[source]
        source: serde_json::Error,
    },
}

/// Signal message types exchanged between the two call parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    /// SDP offer from the caller.
    Offer,
    /// SDP answer from the callee.
    Answer,
    /// Trickled ICE candidate, either direction.
    IceCandidate,
    /// Ring the callee. Carries call type and caller display name.
    CallRequest,
    /// Callee picked up.
    CallAccept,
    /// Callee declined.
    CallReject,
    /// Either party hung up.
    EndCall,
}

impl SignalType {
    pub const ALL: [SignalType; 7] = [
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::CallRequest,
        Self::CallAccept,
        Self::CallReject,
        Self::EndCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::CallRequest => "call-request",
            Self::CallAccept => "call-accept",
            Self::CallReject => "call-reject",
            Self::EndCall => "end-call",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SignalError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP description plus the auxiliary `callType` tag that lets the
/// receiver pick audio or video constraints before touching the SDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
    #[serde(rename = "callType", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
            call_type: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
            call_type: None,
        }
    }

    pub fn with_call_type(mut self, call_type: CallType) -> Self {
        self.call_type = Some(call_type);
        self
    }
}

/// An ICE candidate as exchanged over the signal channel.
///
/// Field names follow `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    /// The `typ` field of the candidate line, if present and known.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next().and_then(|t| t.parse().ok());
            }
        }
        None
    }
}

/// ICE candidate type (RFC 5245).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    /// Direct host candidate
    Host,
    /// Server reflexive (STUN) candidate
    ServerReflexive,
    /// Peer reflexive candidate
    PeerReflexive,
    /// Relay (TURN) candidate
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RequestData {
    #[serde(rename = "type")]
    call_type: CallType,
    #[serde(rename = "callerName", default)]
    caller_name: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct AcceptData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    call_type: Option<CallType>,
}

/// Typed `signal_data`, one variant per [`SignalType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidateInit),
    CallRequest {
        call_type: CallType,
        caller_name: String,
    },
    CallAccept {
        call_type: Option<CallType>,
    },
    CallReject,
    EndCall,
}

impl SignalPayload {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Offer(_) => SignalType::Offer,
            Self::Answer(_) => SignalType::Answer,
            Self::IceCandidate(_) => SignalType::IceCandidate,
            Self::CallRequest { .. } => SignalType::CallRequest,
            Self::CallAccept { .. } => SignalType::CallAccept,
            Self::CallReject => SignalType::CallReject,
            Self::EndCall => SignalType::EndCall,
        }
    }

    /// Encodes the payload as the JSON stored in `signal_data`.
    pub fn to_data(&self) -> Result<Value, SignalError> {
        let kind = self.signal_type();
        let encoded = match self {
            Self::Offer(desc) | Self::Answer(desc) => serde_json::to_value(desc),
            Self::IceCandidate(candidate) => serde_json::to_value(candidate),
            Self::CallRequest {
                call_type,
                caller_name,
            } => serde_json::to_value(RequestData {
                call_type: *call_type,
                caller_name: Some(caller_name.clone()),
            }),
            Self::CallAccept { call_type } => serde_json::to_value(AcceptData {
                call_type: *call_type,
            }),
            Self::CallReject | Self::EndCall => Ok(Value::Object(Default::default())),
        };
        encoded.map_err(|source| SignalError::Encode { kind, source })
    }

    /// Decodes `signal_data` for the given type. Control signals without a
    /// body accept any JSON, matching the lenient senders in the wild.
    pub fn from_data(kind: SignalType, data: &Value) -> Result<Self, SignalError> {
        let payload_err = |source| SignalError::Payload { kind, source };
        let payload = match kind {
            SignalType::Offer => {
                Self::Offer(SessionDescription::deserialize(data).map_err(payload_err)?)
            }
            SignalType::Answer => {
                Self::Answer(SessionDescription::deserialize(data).map_err(payload_err)?)
            }
            SignalType::IceCandidate => {
                Self::IceCandidate(IceCandidateInit::deserialize(data).map_err(payload_err)?)
            }
            SignalType::CallRequest => {
                let req = RequestData::deserialize(data).map_err(payload_err)?;
                Self::CallRequest {
                    call_type: req.call_type,
                    caller_name: req
                        .caller_name
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
                }
            }
            SignalType::CallAccept => {
                let accept = if data.is_null() {
                    AcceptData { call_type: None }
                } else {
                    AcceptData::deserialize(data).map_err(payload_err)?
                };
                Self::CallAccept {
                    call_type: accept.call_type,
                }
            }
            SignalType::CallReject => Self::CallReject,
            SignalType::EndCall => Self::EndCall,
        };
        Ok(payload)
    }
}

/// Row as stored in and delivered by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: String,
    pub from_user: String,
    pub to_user: String,
    pub signal_type: String,
    pub signal_data: Value,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
}

/// Row as written by a sender; the backend assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInsert {
    pub from_user: String,
    pub to_user: String,
    pub signal_type: String,
    pub signal_data: Value,
    pub conversation_id: String,
}

impl SignalInsert {
    pub fn new(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        conversation_id: impl Into<String>,
        payload: &SignalPayload,
    ) -> Result<Self, SignalError> {
        Ok(Self {
            from_user: from_user.into(),
            to_user: to_user.into(),
            signal_type: payload.signal_type().as_str().to_string(),
            signal_data: payload.to_data()?,
            conversation_id: conversation_id.into(),
        })
    }
}

/// A decoded call signal.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSignal {
    pub id: String,
    pub from_user: String,
    pub to_user: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: SignalPayload,
}

impl CallSignal {
    pub fn signal_type(&self) -> SignalType {
        self.payload.signal_type()
    }
}

impl TryFrom<SignalRow> for CallSignal {
    type Error = SignalError;

    fn try_from(row: SignalRow) -> Result<Self, Self::Error> {
        let kind: SignalType = row.signal_type.parse()?;
        let payload = SignalPayload::from_data(kind, &row.signal_data)?;
        Ok(Self {
            id: row.id,
            from_user: row.from_user,
            to_user: row.to_user,
            conversation_id: row.conversation_id,
            created_at: row.created_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(signal_type: &str, data: Value) -> SignalRow {
        SignalRow {
            id: "sig-1".into(),
            from_user: "ann".into(),
            to_user: "bob".into(),
            signal_type: signal_type.into(),
            signal_data: data,
            conversation_id: "conv-1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_signal_type_names() {
        for kind in SignalType::ALL {
            assert_eq!(kind.as_str().parse::<SignalType>().unwrap(), kind);
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.as_str().to_string()));
        }
        assert!(matches!(
            "hangup".parse::<SignalType>(),
            Err(SignalError::UnknownType(_))
        ));
    }

    #[test]
    fn test_call_request_wire_shape() {
        let payload = SignalPayload::CallRequest {
            call_type: CallType::Video,
            caller_name: "Ann".into(),
        };
        assert_eq!(
            payload.to_data().unwrap(),
            json!({"type": "video", "callerName": "Ann"})
        );
    }

    #[test]
    fn test_call_request_without_name_defaults_to_unknown() {
        let signal = CallSignal::try_from(row("call-request", json!({"type": "audio"}))).unwrap();
        assert_eq!(
            signal.payload,
            SignalPayload::CallRequest {
                call_type: CallType::Audio,
                caller_name: "Unknown".into(),
            }
        );
    }

    #[test]
    fn test_offer_carries_call_type_tag() {
        let desc = SessionDescription::offer("v=0\r\n").with_call_type(CallType::Video);
        let data = SignalPayload::Offer(desc.clone()).to_data().unwrap();
        assert_eq!(data["type"], "offer");
        assert_eq!(data["callType"], "video");

        let signal = CallSignal::try_from(row("offer", data)).unwrap();
        assert_eq!(signal.payload, SignalPayload::Offer(desc));
    }

    #[test]
    fn test_answer_without_call_type() {
        let signal =
            CallSignal::try_from(row("answer", json!({"type": "answer", "sdp": "v=0"}))).unwrap();
        match signal.payload {
            SignalPayload::Answer(desc) => {
                assert_eq!(desc.sdp_type, SdpType::Answer);
                assert_eq!(desc.call_type, None);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let candidate = IceCandidateInit::new("candidate:1 1 UDP 2130706431 10.0.0.1 9 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);
        let data = SignalPayload::IceCandidate(candidate).to_data().unwrap();
        assert_eq!(data["sdpMid"], "0");
        assert_eq!(data["sdpMLineIndex"], 0);
        assert!(data.get("usernameFragment").is_none());
    }

    #[test]
    fn test_control_signals_ignore_body() {
        let reject = CallSignal::try_from(row("call-reject", json!({"anything": 1}))).unwrap();
        assert_eq!(reject.payload, SignalPayload::CallReject);
        let end = CallSignal::try_from(row("end-call", Value::Null)).unwrap();
        assert_eq!(end.payload, SignalPayload::EndCall);
        let accept = CallSignal::try_from(row("call-accept", json!({}))).unwrap();
        assert_eq!(accept.payload, SignalPayload::CallAccept { call_type: None });
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let err = CallSignal::try_from(row("offer", json!({"sdp": 5}))).unwrap_err();
        assert!(matches!(
            err,
            SignalError::Payload {
                kind: SignalType::Offer,
                ..
            }
        ));
    }

    #[test]
    fn test_candidate_type_from_line() {
        let host = IceCandidateInit::new("candidate:1 1 UDP 2130706431 10.0.0.1 9 typ host");
        assert_eq!(host.candidate_type(), Some(CandidateType::Host));
        let relay = IceCandidateInit::new("candidate:3 1 UDP 41885439 1.2.3.4 3478 typ relay raddr 0.0.0.0");
        assert_eq!(relay.candidate_type(), Some(CandidateType::Relay));
        assert_eq!(IceCandidateInit::new("").candidate_type(), None);
        assert_eq!(CandidateType::ServerReflexive.as_str(), "srflx");
    }

    #[test]
    fn test_insert_encodes_type_and_data() {
        let insert =
            SignalInsert::new("ann", "bob", "conv-1", &SignalPayload::EndCall).unwrap();
        assert_eq!(insert.signal_type, "end-call");
        assert_eq!(insert.signal_data, json!({}));
    }
}
