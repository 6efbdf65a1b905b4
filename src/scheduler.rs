//! Drives the reconciler: fixed-delay bounded retries, per-key serialization
//! and concurrent sweeps over every pending confirmation.

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::config::{ReconcilerConfig, WorkerConfig};
use crate::core::domain::{ConfirmationKey, Outcome};
use crate::core::errors::Result;
use crate::reconciler::Reconciler;
use crate::storage::ConfirmationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-invocations after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl From<&ReconcilerConfig> for RetryPolicy {
    fn from(config: &ReconcilerConfig) -> Self {
        Self { max_retries: config.max_retries, delay: config.retry_delay() }
    }
}

/// Keys with a reconciliation in flight.
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<ConfirmationKey>>>,
}

impl InFlight {
    /// `None` if the key is already being reconciled.
    pub fn try_acquire(&self, key: ConfirmationKey) -> Option<InFlightGuard> {
        if self.keys.lock().insert(key) {
            Some(InFlightGuard { keys: self.keys.clone(), key })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

/// Releases the key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<ConfirmationKey>>>,
    key: ConfirmationKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished { outcome: Outcome, attempts: u32 },
    /// Another reconciliation of the same key was running.
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub outcomes: HashMap<Outcome, usize>,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepSummary {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.outcomes.values().sum::<usize>() + self.skipped + self.failed
    }
}

/// Runs reconciliations with a fixed-delay retry budget, never two for the same key at once.
pub struct RetryScheduler {
    reconciler: Arc<Reconciler>,
    policy: RetryPolicy,
    concurrency: usize,
    in_flight: InFlight,
}

impl RetryScheduler {
    pub fn new(reconciler: Arc<Reconciler>, policy: RetryPolicy, concurrency: usize) -> Self {
        Self { reconciler, policy, concurrency: concurrency.max(1), in_flight: InFlight::default() }
    }

    pub fn from_config(
        reconciler: Arc<Reconciler>,
        config: &ReconcilerConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self::new(reconciler, RetryPolicy::from(config), worker.concurrency)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Reconcile `key` until it reaches a decision or the retry budget runs out.
    ///
    /// The last permitted attempt runs with retries disabled. Transport and
    /// storage errors share the same budget and delay; integrity errors are
    /// returned immediately.
    pub async fn run(&self, key: ConfirmationKey, allow_retry: bool) -> Result<Completion> {
        let Some(_guard) = self.in_flight.try_acquire(key) else {
            debug!(%key, "Reconciliation already in flight, skipping");
            return Ok(Completion::Skipped);
        };

        let mut attempts = 0u32;
        loop {
            let retries_left = allow_retry && attempts < self.policy.max_retries;
            attempts += 1;

            match self.reconciler.reconcile_key(&key, retries_left).await {
                Ok(outcome) if outcome.is_retry() => {
                    debug!(%key, attempts, delay = ?self.policy.delay, "Undetermined, retrying later");
                }
                Ok(outcome) => {
                    debug!(%key, attempts, %outcome, "Reconciliation finished");
                    return Ok(Completion::Finished { outcome, attempts });
                }
                Err(e) if e.is_retryable() && retries_left => {
                    warn!(%key, attempts, "Reconciliation failed, retrying later: {}", e);
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.policy.delay).await;
        }
    }

    /// Reconcile every pending confirmation in `store`, at most `concurrency` at a time.
    pub async fn sweep(&self, store: &dyn ConfirmationStore) -> Result<SweepSummary> {
        let keys = store.pending_confirmations().await?;
        info!("Sweeping {} pending confirmations", keys.len());
        Ok(self.run_all(keys).await)
    }

    pub async fn run_all(&self, keys: Vec<ConfirmationKey>) -> SweepSummary {
        let results: Vec<_> = stream::iter(keys)
            .map(|key| async move { (key, self.run(key, true).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = SweepSummary::default();
        for (key, result) in results {
            match result {
                Ok(Completion::Finished { outcome, .. }) => {
                    *summary.outcomes.entry(outcome).or_insert(0) += 1;
                }
                Ok(Completion::Skipped) => summary.skipped += 1,
                Err(e) => {
                    error!(%key, "Reconciliation failed: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            total = summary.total(),
            failed = summary.failed,
            skipped = summary.skipped,
            "Sweep finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, H256};

    fn key(byte: u8) -> ConfirmationKey {
        ConfirmationKey {
            safe: Address::repeat_byte(byte),
            contract_transaction_hash: H256::repeat_byte(byte),
            transaction_hash: H256::repeat_byte(byte),
            owner: Address::repeat_byte(byte),
        }
    }

    #[test]
    fn in_flight_rejects_duplicate_until_released() {
        let in_flight = InFlight::default();
        let guard = in_flight.try_acquire(key(1)).expect("first acquire");
        assert!(in_flight.try_acquire(key(1)).is_none());
        assert!(in_flight.try_acquire(key(2)).is_some());
        assert_eq!(in_flight.len(), 1);

        drop(guard);
        assert!(in_flight.is_empty());
        assert!(in_flight.try_acquire(key(1)).is_some());
    }

    #[test]
    fn retry_policy_from_config() {
        let config = ReconcilerConfig { reorg_blocks: 10, retry_delay_secs: 60, max_retries: 5 };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay, Duration::from_secs(60));
    }

    #[test]
    fn summary_counts() {
        let mut summary = SweepSummary::default();
        summary.outcomes.insert(Outcome::Deleted, 2);
        summary.failed = 1;
        assert_eq!(summary.count(Outcome::Deleted), 2);
        assert_eq!(summary.count(Outcome::NoOp), 0);
        assert_eq!(summary.total(), 3);
    }
}
