use async_trait::async_trait;
use callcore::{SignalInsert, SignalRow};
use tokio::sync::mpsc;

/// Realtime subscription lifecycle, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    Closed,
    ChannelError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Status(SubscriptionStatus),
    /// A row was inserted matching the subscription filter.
    Insert(SignalRow),
}

/// Row store with realtime insert notification over `call_signals`.
///
/// Implementations deliver inserts at least once and in the order the
/// backend commits them. A dropped receiver ends the subscription.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert(&self, row: SignalInsert) -> Result<SignalRow, anyhow::Error>;

    /// Subscribes to inserts where `to_user` equals the given user.
    async fn subscribe(&self, to_user: &str) -> Result<mpsc::Receiver<StoreEvent>, anyhow::Error>;

    async fn delete(&self, id: &str) -> Result<(), anyhow::Error>;
}
