//! Signal channel over the realtime `call_signals` store.

use super::error::TransportError;
use super::session::SignalSink;
use crate::config::CallConfig;
use crate::store::{SignalStore, StoreEvent, SubscriptionStatus};
use async_trait::async_trait;
use callcore::{CallSignal, SignalInsert, SignalPayload, SignalRow};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

const DELIVERY_CAPACITY: usize = 256;

/// Sends signals as rows and delivers the rows addressed to one user.
pub struct SignalChannel {
    user_id: String,
    store: Arc<dyn SignalStore>,
    resubscribe_on_close: Duration,
    resubscribe_on_error: Duration,
}

enum Pump {
    Shutdown,
    Resubscribe(Duration),
}

impl SignalChannel {
    pub fn new(user_id: impl Into<String>, store: Arc<dyn SignalStore>, config: &CallConfig) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            resubscribe_on_close: config.resubscribe_on_close,
            resubscribe_on_error: config.resubscribe_on_error,
        }
    }

    pub async fn send(
        &self,
        to_user: &str,
        conversation_id: &str,
        payload: &SignalPayload,
    ) -> Result<SignalRow, TransportError> {
        let kind = payload.signal_type();
        let row = SignalInsert::new(&self.user_id, to_user, conversation_id, payload)?;
        let stored = self
            .store
            .insert(row)
            .await
            .map_err(|e| TransportError::Send {
                kind,
                to: to_user.to_string(),
                reason: e.to_string(),
            })?;
        debug!(target: "Call/Channel", "Sent {kind} to {to_user} ({})", stored.id);
        Ok(stored)
    }

    /// Starts the listener task. Signals are delivered in backend order until
    /// the returned handle is dropped.
    pub fn subscribe(self: &Arc<Self>) -> SignalSubscription {
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(self.clone().listen_loop(tx, shutdown.clone()));
        SignalSubscription { rx, shutdown }
    }

    async fn listen_loop(self: Arc<Self>, tx: mpsc::Sender<CallSignal>, shutdown: Arc<Notify>) {
        loop {
            let delay = match self.store.subscribe(&self.user_id).await {
                Ok(mut events) => match self.pump(&mut events, &tx, &shutdown).await {
                    Pump::Shutdown => {
                        debug!(target: "Call/Channel", "Listener for {} stopped", self.user_id);
                        return;
                    }
                    Pump::Resubscribe(delay) => delay,
                },
                Err(e) => {
                    warn!(target: "Call/Channel", "Subscribe failed: {e}");
                    self.resubscribe_on_error
                }
            };

            info!(
                target: "Call/Channel",
                "Resubscribing in {:?}",
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.notified() => return,
            }
        }
    }

    async fn pump(
        &self,
        events: &mut mpsc::Receiver<StoreEvent>,
        tx: &mpsc::Sender<CallSignal>,
        shutdown: &Notify,
    ) -> Pump {
        loop {
            let event = tokio::select! {
                _ = shutdown.notified() => return Pump::Shutdown,
                event = events.recv() => event,
            };
            match event {
                Some(StoreEvent::Status(SubscriptionStatus::Subscribed)) => {
                    info!(target: "Call/Channel", "Subscribed to signals for {}", self.user_id);
                }
                Some(StoreEvent::Status(SubscriptionStatus::Closed)) | None => {
                    warn!(target: "Call/Channel", "Signal subscription closed");
                    return Pump::Resubscribe(self.resubscribe_on_close);
                }
                Some(StoreEvent::Status(SubscriptionStatus::ChannelError)) => {
                    warn!(target: "Call/Channel", "Signal subscription errored");
                    return Pump::Resubscribe(self.resubscribe_on_error);
                }
                Some(StoreEvent::Insert(row)) => {
                    if row.to_user != self.user_id {
                        continue;
                    }
                    let id = row.id.clone();
                    match CallSignal::try_from(row) {
                        Ok(signal) => {
                            if tx.send(signal).await.is_err() {
                                return Pump::Shutdown;
                            }
                        }
                        Err(e) => warn!(target: "Call/Channel", "Dropping signal {id}: {e}"),
                    }
                    self.spawn_delete(id);
                }
            }
        }
    }

    /// Consumed rows are removed in the background; a failure only means the
    /// row may be delivered again.
    fn spawn_delete(&self, id: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.delete(&id).await {
                warn!(target: "Call/Channel", "Failed to delete signal {id}: {e}");
            }
        });
    }
}

/// Live subscription handle. Dropping it stops the listener.
pub struct SignalSubscription {
    rx: mpsc::Receiver<CallSignal>,
    shutdown: Arc<Notify>,
}

impl SignalSubscription {
    pub async fn recv(&mut self) -> Option<CallSignal> {
        self.rx.recv().await
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Routes a session's signals to the other call party.
pub struct ChannelSink {
    channel: Arc<SignalChannel>,
    to_user: String,
    conversation_id: String,
}

impl ChannelSink {
    pub fn new(
        channel: Arc<SignalChannel>,
        to_user: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            to_user: to_user.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

#[async_trait]
impl SignalSink for ChannelSink {
    async fn emit(&self, payload: SignalPayload) -> Result<(), TransportError> {
        self.channel
            .send(&self.to_user, &self.conversation_id, &payload)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySignalStore;
    use callcore::{CallType, SignalType};

    fn channel(user: &str, store: &Arc<MemorySignalStore>) -> Arc<SignalChannel> {
        Arc::new(SignalChannel::new(
            user,
            store.clone(),
            &CallConfig::default(),
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_delivers_and_deletes() {
        let store = Arc::new(MemorySignalStore::new());
        let ann = channel("ann", &store);
        let bob = channel("bob", &store);
        let mut inbox = bob.subscribe();
        settle().await;

        let request = SignalPayload::CallRequest {
            call_type: CallType::Video,
            caller_name: "Ann".into(),
        };
        ann.send("bob", "conv-1", &request).await.unwrap();
        ann.send("carl", "conv-2", &SignalPayload::EndCall).await.unwrap();

        let signal = inbox.recv().await.unwrap();
        assert_eq!(signal.from_user, "ann");
        assert_eq!(signal.payload, request);

        settle().await;
        let rows = store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].to_user, "carl");
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_block_delivery() {
        let store = Arc::new(MemorySignalStore::new());
        let ann = channel("ann", &store);
        let mut inbox = channel("bob", &store).subscribe();
        settle().await;

        store.fail_next_deletes(1);
        ann.send("bob", "c", &SignalPayload::CallReject).await.unwrap();
        ann.send("bob", "c", &SignalPayload::EndCall).await.unwrap();

        assert_eq!(
            inbox.recv().await.unwrap().signal_type(),
            SignalType::CallReject
        );
        assert_eq!(inbox.recv().await.unwrap().signal_type(), SignalType::EndCall);
        settle().await;
        assert_eq!(store.rows().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_close() {
        let store = Arc::new(MemorySignalStore::new());
        let ann = channel("ann", &store);
        let mut inbox = channel("bob", &store).subscribe();
        settle().await;
        assert_eq!(store.subscribe_calls(), 1);

        store
            .drop_subscriptions("bob", SubscriptionStatus::Closed)
            .await;
        settle().await;
        assert_eq!(store.subscriber_count("bob").await, 0);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(store.subscribe_calls(), 2);

        ann.send("bob", "c", &SignalPayload::EndCall).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().signal_type(), SignalType::EndCall);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_waits_longer() {
        let store = Arc::new(MemorySignalStore::new());
        let _inbox = channel("bob", &store).subscribe();
        settle().await;

        store
            .drop_subscriptions("bob", SubscriptionStatus::ChannelError)
            .await;
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(store.subscribe_calls(), 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_row_is_skipped() {
        let store = Arc::new(MemorySignalStore::new());
        let mut inbox = channel("bob", &store).subscribe();
        settle().await;

        store
            .insert(SignalInsert {
                from_user: "ann".into(),
                to_user: "bob".into(),
                signal_type: "hangup".into(),
                signal_data: serde_json::json!({}),
                conversation_id: "c".into(),
            })
            .await
            .unwrap();
        channel("ann", &store)
            .send("bob", "c", &SignalPayload::EndCall)
            .await
            .unwrap();

        assert_eq!(inbox.recv().await.unwrap().signal_type(), SignalType::EndCall);
    }

    #[tokio::test]
    async fn test_drop_stops_listener() {
        let store = Arc::new(MemorySignalStore::new());
        let inbox = channel("bob", &store).subscribe();
        settle().await;
        assert_eq!(store.subscriber_count("bob").await, 1);
        drop(inbox);
        settle().await;
        assert_eq!(store.subscriber_count("bob").await, 0);
    }
}
