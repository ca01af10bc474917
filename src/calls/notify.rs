//! Ringtone, vibration and notification side effects.

use async_trait::async_trait;
use callcore::CallType;
use log::{info, warn};
use std::sync::Arc;

const INCOMING_VIBRATION: [u64; 5] = [200, 100, 200, 100, 200];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Replaces an earlier notification with the same tag.
    pub tag: &'static str,
    pub require_interaction: bool,
}

/// Platform hooks. Every method may fail; failures never reach the call.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn start_ringtone(&self) -> Result<(), anyhow::Error>;
    async fn stop_ringtone(&self) -> Result<(), anyhow::Error>;
    async fn vibrate(&self, pattern: &[u64]) -> Result<(), anyhow::Error>;
    async fn play_sound(&self) -> Result<(), anyhow::Error>;
    async fn show(&self, notification: &Notification) -> Result<(), anyhow::Error>;
}

/// Best-effort front for a [`NotificationSink`].
#[derive(Clone)]
pub struct CallNotifier {
    sink: Arc<dyn NotificationSink>,
}

impl CallNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    fn swallow(what: &str, result: Result<(), anyhow::Error>) {
        if let Err(e) = result {
            warn!(target: "Call/Notify", "Failed to {what}: {e}");
        }
    }

    pub async fn incoming_call(&self, caller_name: &str, call_type: CallType) {
        Self::swallow("start ringtone", self.sink.start_ringtone().await);
        Self::swallow("vibrate", self.sink.vibrate(&INCOMING_VIBRATION).await);
        let notification = Notification {
            title: format!("Incoming {call_type} call"),
            body: format!("{caller_name} is calling you"),
            tag: "incoming-call",
            require_interaction: true,
        };
        Self::swallow("show notification", self.sink.show(&notification).await);
    }

    pub async fn stop_incoming(&self) {
        Self::swallow("stop ringtone", self.sink.stop_ringtone().await);
    }

    pub async fn call_started(&self, peer_name: &str, call_type: CallType) {
        Self::swallow("play sound", self.sink.play_sound().await);
        let notification = Notification {
            title: format!("{} call started", call_type.label()),
            body: format!("Connected with {peer_name}"),
            tag: "call-started",
            require_interaction: false,
        };
        Self::swallow("show notification", self.sink.show(&notification).await);
    }

    pub async fn call_ended(&self, duration: &str) {
        Self::swallow("play sound", self.sink.play_sound().await);
        let notification = Notification {
            title: "Call ended".to_string(),
            body: format!("Call duration: {duration}"),
            tag: "call-ended",
            require_interaction: false,
        };
        Self::swallow("show notification", self.sink.show(&notification).await);
    }
}

/// Writes notifications to the log. Used when no platform hooks exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn start_ringtone(&self) -> Result<(), anyhow::Error> {
        info!(target: "Call/Notify", "Ringing");
        Ok(())
    }

    async fn stop_ringtone(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn vibrate(&self, _pattern: &[u64]) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn play_sound(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn show(&self, notification: &Notification) -> Result<(), anyhow::Error> {
        info!(target: "Call/Notify", "{}: {}", notification.title, notification.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        broken: bool,
    }

    impl Recorder {
        fn record(&self, what: String) -> Result<(), anyhow::Error> {
            self.calls.lock().unwrap().push(what);
            if self.broken {
                Err(anyhow::anyhow!("not permitted"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn start_ringtone(&self) -> Result<(), anyhow::Error> {
            self.record("ring".into())
        }
        async fn stop_ringtone(&self) -> Result<(), anyhow::Error> {
            self.record("stop".into())
        }
        async fn vibrate(&self, pattern: &[u64]) -> Result<(), anyhow::Error> {
            self.record(format!("vibrate {pattern:?}"))
        }
        async fn play_sound(&self) -> Result<(), anyhow::Error> {
            self.record("sound".into())
        }
        async fn show(&self, n: &Notification) -> Result<(), anyhow::Error> {
            self.record(format!("{} | {}", n.title, n.body))
        }
    }

    #[tokio::test]
    async fn test_incoming_call_rings_vibrates_and_notifies() {
        let recorder = Arc::new(Recorder::default());
        let notifier = CallNotifier::new(recorder.clone());
        notifier.incoming_call("Ann", CallType::Video).await;
        notifier.stop_incoming().await;
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![
                "ring".to_string(),
                "vibrate [200, 100, 200, 100, 200]".to_string(),
                "Incoming video call | Ann is calling you".to_string(),
                "stop".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let recorder = Arc::new(Recorder {
            broken: true,
            ..Default::default()
        });
        let notifier = CallNotifier::new(recorder.clone());
        notifier.call_started("Ann", CallType::Audio).await;
        notifier.call_ended("01:05").await;
        let calls = recorder.calls.lock().unwrap();
        assert!(calls.contains(&"Audio call started | Connected with Ann".to_string()));
        assert!(calls.contains(&"Call ended | Call duration: 01:05".to_string()));
    }
}
