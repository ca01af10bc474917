use callcore::CallSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// A STUN/TURN server descriptor handed opaquely to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Builds a TURN entry from a comma separated url list. Returns `None`
    /// when the list has no usable entries.
    pub fn turn_from_list(
        urls: &str,
        username: Option<String>,
        credential: Option<String>,
    ) -> Option<Self> {
        let urls: Vec<String> = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();
        if urls.is_empty() {
            return None;
        }
        Some(Self {
            urls,
            username,
            credential,
        })
    }
}

/// Bounded linear back-off for retrying a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the given (1-based) attempt: `base * attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// STUN/TURN servers for peer connection construction.
    pub ice_servers: Vec<IceServer>,
    /// Display name sent in `call-request`.
    pub caller_name: String,
    /// Ring timeout before auto-rejecting (incoming) or giving up (outgoing).
    pub ring_timeout: Option<Duration>,
    /// Resubscribe delay after the realtime channel reports `CLOSED`.
    pub resubscribe_on_close: Duration,
    /// Resubscribe delay after the realtime channel reports `CHANNEL_ERROR`.
    pub resubscribe_on_error: Duration,
    pub retry: RetryPolicy,
    pub media: CallSettings,
    /// How many recently delivered signal ids are remembered for dedup.
    pub dedup_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.into_iter().map(IceServer::stun).collect(),
            caller_name: "Unknown".to_string(),
            ring_timeout: Some(Duration::from_secs(45)),
            resubscribe_on_close: Duration::from_secs(3),
            resubscribe_on_error: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            media: CallSettings::default(),
            dedup_capacity: 256,
        }
    }
}

impl CallConfig {
    /// Defaults plus a TURN server from `TURN_URLS`, `TURN_USERNAME` and
    /// `TURN_CREDENTIAL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(urls) = std::env::var("TURN_URLS")
            && let Some(turn) = IceServer::turn_from_list(
                &urls,
                std::env::var("TURN_USERNAME").ok(),
                std::env::var("TURN_CREDENTIAL").ok(),
            )
        {
            config.ice_servers.push(turn);
        }
        config
    }

    pub fn with_caller_name(mut self, name: impl Into<String>) -> Self {
        self.caller_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ice_servers_are_stun() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers.iter().all(|s| s.urls[0].starts_with("stun:")));
        assert!(config.ice_servers.iter().all(|s| s.credential.is_none()));
    }

    #[test]
    fn test_turn_from_list() {
        let turn = IceServer::turn_from_list(
            " turn:a.example:3478 , ,turns:b.example:5349",
            Some("user".into()),
            Some("secret".into()),
        )
        .unwrap();
        assert_eq!(turn.urls, vec!["turn:a.example:3478", "turns:b.example:5349"]);
        assert_eq!(turn.username.as_deref(), Some("user"));

        assert!(IceServer::turn_from_list(" , ", None, None).is_none());
    }

    #[test]
    fn test_retry_delay_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
    }

    #[test]
    fn test_resubscribe_delays() {
        let config = CallConfig::default();
        assert_eq!(config.resubscribe_on_close, Duration::from_secs(3));
        assert_eq!(config.resubscribe_on_error, Duration::from_secs(5));
        assert_eq!(config.ring_timeout, Some(Duration::from_secs(45)));
    }
}
