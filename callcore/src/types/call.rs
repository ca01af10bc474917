use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Media kind of a call, as negotiated in `call-request`/`call-accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    /// Title-case label used in user-facing notifications.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Audio => "Audio",
            Self::Video => "Video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            _ => Err(()),
        }
    }
}

/// Identifies one call attempt: the remote party plus the conversation it
/// belongs to. Retry budgets are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub remote_user: String,
    pub conversation_id: String,
}

impl CallKey {
    pub fn new(remote_user: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            remote_user: remote_user.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.remote_user, self.conversation_id)
    }
}

/// Glare resolution: when both parties ring each other at once, the side
/// with the lower user id keeps the offerer role.
pub fn is_offerer(local_user: &str, remote_user: &str) -> bool {
    local_user < remote_user
}

/// Formats an elapsed call time as `mm:ss`. Minutes are not wrapped at 60.
pub fn format_call_duration(elapsed_secs: i64) -> String {
    let elapsed = elapsed_secs.max(0);
    format!("{:02}:{:02}", elapsed / 60, elapsed % 60)
}
