//! Bounded retry of failed calls.

use crate::config::RetryPolicy;
use callcore::CallErrorInfo;
use dashmap::DashMap;
use log::{info, warn};
use std::fmt::Display;
use std::future::Future;

/// Per-call retry budget. Attempts are counted per call id so unrelated
/// calls never share a budget.
pub struct RecoveryManager {
    attempts: DashMap<String, u32>,
    policy: RetryPolicy,
}

impl RecoveryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts: DashMap::new(),
            policy,
        }
    }

    /// Retries `action` after the back-off for the next attempt.
    ///
    /// Returns `false` without calling `action` when the error is not
    /// recoverable or the budget for `call_id` is spent; the latter also
    /// clears the budget. A successful retry clears it too.
    pub async fn attempt_recovery<F, Fut, E>(
        &self,
        error: &CallErrorInfo,
        call_id: &str,
        action: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if !error.recoverable {
            return false;
        }

        let previous = self.retry_count(call_id);
        if previous >= self.policy.max_retries {
            info!(
                target: "Call/Recovery",
                "Giving up on {call_id} after {previous} attempts"
            );
            self.attempts.remove(call_id);
            return false;
        }

        let attempt = previous + 1;
        self.attempts.insert(call_id.to_string(), attempt);
        let delay = self.policy.delay_for(attempt);
        info!(
            target: "Call/Recovery",
            "Retrying {call_id} ({}) in {delay:?}, attempt {attempt}/{}",
            error.kind,
            self.policy.max_retries
        );
        tokio::time::sleep(delay).await;

        match action().await {
            Ok(()) => {
                self.attempts.remove(call_id);
                true
            }
            Err(e) => {
                warn!(target: "Call/Recovery", "Retry {attempt} for {call_id} failed: {e}");
                false
            }
        }
    }

    pub fn retry_count(&self, call_id: &str) -> u32 {
        self.attempts.get(call_id).map(|n| *n).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::{FailureCause, classify};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn network_error() -> CallErrorInfo {
        classify(&FailureCause::Network {
            detail: "offline".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_three_failures() {
        let recovery = RecoveryManager::new(RetryPolicy::default());
        let counter = AtomicU32::new(0);
        let runs = &counter;
        let start = Instant::now();

        for _ in 0..3 {
            let ok = recovery
                .attempt_recovery(&network_error(), "bob-conv", move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("still offline")
                })
                .await;
            assert!(!ok);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(recovery.retry_count("bob-conv"), 3);
        // 2s + 4s + 6s
        assert_eq!(start.elapsed(), Duration::from_secs(12));

        let ok = recovery
            .attempt_recovery(&network_error(), "bob-conv", move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert!(!ok);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(recovery.retry_count("bob-conv"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let recovery = RecoveryManager::new(RetryPolicy::default());
        let failed = recovery
            .attempt_recovery(&network_error(), "bob-conv", || async {
                Err::<(), _>("offline")
            })
            .await;
        assert!(!failed);
        assert_eq!(recovery.retry_count("bob-conv"), 1);

        let recovered = recovery
            .attempt_recovery(&network_error(), "bob-conv", || async { Ok::<(), &str>(()) })
            .await;
        assert!(recovered);
        assert_eq!(recovery.retry_count("bob-conv"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budgets_are_per_call() {
        let recovery = RecoveryManager::new(RetryPolicy::default());
        for _ in 0..3 {
            recovery
                .attempt_recovery(&network_error(), "bob-a", || async { Err::<(), _>("x") })
                .await;
        }
        let other = recovery
            .attempt_recovery(&network_error(), "carl-b", || async { Ok::<(), &str>(()) })
            .await;
        assert!(other);
        assert_eq!(recovery.retry_count("bob-a"), 3);
    }

    #[tokio::test]
    async fn test_unrecoverable_is_not_retried() {
        let recovery = RecoveryManager::new(RetryPolicy::default());
        let rejected = classify(&FailureCause::Rejected);
        let ran = AtomicBool::new(false);
        let flag = &ran;
        let ok = recovery
            .attempt_recovery(&rejected, "bob-conv", move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert!(!ok);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(recovery.retry_count("bob-conv"), 0);
    }
}
