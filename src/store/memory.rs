use crate::store::traits::*;
use async_trait::async_trait;
use callcore::{SignalInsert, SignalRow};
use chrono::Utc;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};

const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Default)]
struct Inner {
    rows: BTreeMap<u64, SignalRow>,
    history: Vec<SignalRow>,
    subscribers: HashMap<String, Vec<mpsc::Sender<StoreEvent>>>,
}

/// In-process `call_signals` table with realtime fan-out.
///
/// Used by the loopback demo and the tests. Failure knobs let tests
/// exercise the channel's resubscribe and best-effort delete paths.
#[derive(Default)]
pub struct MemorySignalStore {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    fail_inserts: AtomicBool,
    failing_deletes: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows not deleted yet.
    pub async fn rows(&self) -> Vec<SignalRow> {
        self.inner.lock().await.rows.values().cloned().collect()
    }

    /// Every row ever inserted, in insert order.
    pub async fn history(&self) -> Vec<SignalRow> {
        self.inner.lock().await.history.clone()
    }

    pub async fn subscriber_count(&self, user: &str) -> usize {
        self.inner
            .lock()
            .await
            .subscribers
            .get(user)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of `subscribe` calls seen so far.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` deletes fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Re-delivers an already inserted row, as a realtime reconnect would.
    pub async fn redeliver(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.history.iter().find(|r| r.id == id).cloned() else {
            return false;
        };
        Self::fan_out(&mut inner, row).await;
        true
    }

    /// Ends every live subscription of `user` with the given status.
    pub async fn drop_subscriptions(&self, user: &str, status: SubscriptionStatus) {
        let subs = self
            .inner
            .lock()
            .await
            .subscribers
            .remove(user)
            .unwrap_or_default();
        for sub in subs {
            let _ = sub.send(StoreEvent::Status(status)).await;
        }
    }

    async fn fan_out(inner: &mut Inner, row: SignalRow) {
        let Some(subs) = inner.subscribers.get_mut(&row.to_user) else {
            return;
        };
        subs.retain(|s| !s.is_closed());
        for sub in subs.iter() {
            if sub.send(StoreEvent::Insert(row.clone())).await.is_err() {
                debug!("Subscriber for {} went away during fan-out", row.to_user);
            }
        }
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn insert(&self, row: SignalInsert) -> Result<SignalRow, anyhow::Error> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("insert into call_signals failed"));
        }
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = SignalRow {
            id: format!("sig-{seq}"),
            from_user: row.from_user,
            to_user: row.to_user,
            signal_type: row.signal_type,
            signal_data: row.signal_data,
            conversation_id: row.conversation_id,
            created_at: Utc::now(),
        };

        let mut inner = self.inner.lock().await;
        inner.rows.insert(seq, stored.clone());
        inner.history.push(stored.clone());
        Self::fan_out(&mut inner, stored.clone()).await;
        Ok(stored)
    }

    async fn subscribe(&self, to_user: &str) -> Result<mpsc::Receiver<StoreEvent>, anyhow::Error> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        tx.send(StoreEvent::Status(SubscriptionStatus::Subscribed))
            .await
            .map_err(|_| anyhow::anyhow!("subscriber dropped before it was registered"))?;
        self.inner
            .lock()
            .await
            .subscribers
            .entry(to_user.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn delete(&self, id: &str) -> Result<(), anyhow::Error> {
        let failing = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("delete of {id} failed"));
        }
        let mut inner = self.inner.lock().await;
        inner.rows.retain(|_, row| row.id != id);
        Ok(())
    }
}
