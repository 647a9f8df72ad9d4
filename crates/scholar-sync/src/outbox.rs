//! # Outbox Processor
//!
//! Delivers queued learner writes to the sync API, one at a time, in order.
//!
//! ## Drain Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Outbox Drain                                    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      outbox table                               │   │
//! │  │                                                                 │   │
//! │  │  seq | key | target     | status  | attempts | next_attempt_at │   │
//! │  │  ────┼─────┼────────────┼─────────┼──────────┼─────────────────│   │
//! │  │  1   │ p1  │ lesson:L1  │ pending │ 0        │ now             │   │
//! │  │  2   │ p2  │ lesson:L1  │ pending │ 0        │ now             │   │
//! │  │  3   │ q1  │ quiz:Q4    │ pending │ 2        │ now + 8s        │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │ pending_in_order (seq ASC)             │
//! │                               ▼                                         │
//! │  for each entry:                                                       │
//! │    target already blocked this drain?  → skip (blocked)               │
//! │    not due yet?                        → skip, block target           │
//! │    mark in_flight → push([entry])                                      │
//! │                                                                         │
//! │    accepted        → delete                                            │
//! │    rejected / 400, 409, 413, 422 → failed_permanent, continue          │
//! │    retry / 408, 429, 5xx  → defer(now + backoff), block target        │
//! │    offline / timeout      → defer(now + backoff), STOP the drain      │
//! │    other 4xx (401, 403)   → defer(now + backoff), STOP the drain      │
//! │                                                                         │
//! │  BACKOFF:                                                              │
//! │  • delay = min(base × 2^(attempts−1), cap), no jitter                  │
//! │  • defaults: base 2s, cap 10 min                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use scholar_core::{OutboxEntry, OutboxWrite};
use scholar_db::Database;

use crate::config::CacheConfig;
use crate::error::{CacheResult, RemoteError};
use crate::events::{CacheEventEmitter, NoOpEmitter};
use crate::remote::{PushEntry, PushStatus, RemoteApi};

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        RetryPolicy { base, cap }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        RetryPolicy::new(config.backoff_base(), config.backoff_cap())
    }

    /// Delay before the next attempt once `attempts` deliveries have failed.
    ///
    /// `delay(1) = base`, `delay(2) = 2 × base`, ... never above `cap`.
    pub fn delay(&self, attempts: i64) -> Duration {
        let mut schedule = ExponentialBackoff {
            current_interval: self.base,
            initial_interval: self.base,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.cap,
            max_elapsed_time: None,
            ..Default::default()
        };

        // Past ~64 doublings every schedule is pinned at the cap.
        let steps = attempts.clamp(1, 64);
        let mut delay = self.base;
        for _ in 0..steps {
            delay = schedule.next_backoff().unwrap_or(self.cap);
        }
        delay.min(self.cap)
    }

    fn next_attempt_at(&self, now: DateTime<Utc>, attempts: i64) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cap.as_secs() as i64));
        now + delay
    }
}

// =============================================================================
// Drain Report
// =============================================================================

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries the server accepted (now deleted).
    pub delivered: usize,
    /// Entries returned to `pending` with a later `next_attempt_at`.
    pub deferred: usize,
    /// Entries parked as `failed_permanent`.
    pub rejected: usize,
    /// Entries whose backoff has not elapsed.
    pub skipped_not_due: usize,
    /// Entries held back behind a stalled entry for the same target.
    pub blocked: usize,
    /// The drain stopped because the server was unreachable.
    pub offline: bool,
    /// The drain stopped because the server refused the session.
    pub refused: bool,
    /// Failure descriptions for deferred entries.
    pub errors: Vec<String>,
}

impl DrainReport {
    /// True if every attempted entry was delivered.
    pub fn is_clean(&self) -> bool {
        self.deferred == 0 && self.rejected == 0 && !self.offline && !self.refused
    }
}

enum Delivery {
    Delivered,
    Rejected(String),
    Deferred(String),
    Offline(String),
    Refused(String),
}

// =============================================================================
// Outbox Processor
// =============================================================================

/// Queues writes locally and drains them to the server.
#[derive(Clone)]
pub struct OutboxProcessor {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    policy: RetryPolicy,
    emitter: Arc<dyn CacheEventEmitter>,
}

impl OutboxProcessor {
    /// Creates a new outbox processor.
    pub fn new(db: Database, remote: Arc<dyn RemoteApi>, policy: RetryPolicy) -> Self {
        Self::with_emitter(db, remote, policy, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        policy: RetryPolicy,
        emitter: Arc<dyn CacheEventEmitter>,
    ) -> Self {
        OutboxProcessor {
            db,
            remote,
            policy,
            emitter,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Stores a write for later delivery. Never touches the network.
    pub async fn enqueue(&self, write: &OutboxWrite) -> CacheResult<OutboxEntry> {
        let entry = self.db.outbox().enqueue(write).await?;
        info!(
            entry_id = %entry.id,
            intent = %entry.intent,
            target = %entry.target,
            "Write queued for delivery"
        );
        Ok(entry)
    }

    /// Delivers every due pending entry. Safe to call as often as needed.
    pub async fn drain(&self) -> CacheResult<DrainReport> {
        self.drain_at(Utc::now()).await
    }

    /// [`drain`](Self::drain) with an explicit clock, for tests.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> CacheResult<DrainReport> {
        let outbox = self.db.outbox();
        let entries = outbox.pending_in_order().await?;

        let mut report = DrainReport::default();
        if entries.is_empty() {
            debug!("No pending outbox entries");
            return Ok(report);
        }

        let mut blocked_targets: HashSet<String> = HashSet::new();

        for entry in entries {
            if blocked_targets.contains(&entry.target) {
                report.blocked += 1;
                continue;
            }

            if !entry.is_due(now) {
                report.skipped_not_due += 1;
                blocked_targets.insert(entry.target.clone());
                continue;
            }

            if !outbox.mark_in_flight(&entry.id).await? {
                debug!(entry_id = %entry.id, "Entry changed before delivery; skipping");
                continue;
            }

            let delivery = self.deliver(&entry).await;
            match self
                .settle(&entry, delivery, now, &mut report, &mut blocked_targets)
                .await
            {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "Could not record delivery outcome");
                    if let Err(release_err) = outbox.release_in_flight(&entry.id).await {
                        warn!(
                            entry_id = %entry.id,
                            error = %release_err,
                            "Entry stays in flight until the next start"
                        );
                    }
                    return Err(e);
                }
            }
        }

        info!(
            delivered = report.delivered,
            deferred = report.deferred,
            rejected = report.rejected,
            not_due = report.skipped_not_due,
            blocked = report.blocked,
            offline = report.offline,
            refused = report.refused,
            "Outbox drain finished"
        );

        Ok(report)
    }

    /// Records the outcome of one delivery.
    ///
    /// ## Returns
    /// `false` if the drain must stop here.
    async fn settle(
        &self,
        entry: &OutboxEntry,
        delivery: Delivery,
        now: DateTime<Utc>,
        report: &mut DrainReport,
        blocked_targets: &mut HashSet<String>,
    ) -> CacheResult<bool> {
        let outbox = self.db.outbox();
        match delivery {
            Delivery::Delivered => {
                outbox.complete(&entry.id).await?;
                report.delivered += 1;
                debug!(entry_id = %entry.id, key = %entry.idempotency_key, "Write delivered");
            }
            Delivery::Rejected(reason) => {
                outbox.mark_failed_permanent(&entry.id, &reason).await?;
                report.rejected += 1;
                warn!(
                    entry_id = %entry.id,
                    key = %entry.idempotency_key,
                    reason = %reason,
                    "Write rejected by server"
                );
                self.emitter.write_rejected(entry, &reason);
            }
            Delivery::Deferred(reason) => {
                self.defer(entry, now, &reason).await?;
                report.deferred += 1;
                report.errors.push(reason);
                blocked_targets.insert(entry.target.clone());
            }
            Delivery::Offline(reason) => {
                self.defer(entry, now, &reason).await?;
                report.deferred += 1;
                report.errors.push(reason);
                report.offline = true;
                info!("Server unreachable; stopping outbox drain");
                return Ok(false);
            }
            Delivery::Refused(reason) => {
                self.defer(entry, now, &reason).await?;
                report.deferred += 1;
                warn!(reason = %reason, "Server refused the session; stopping outbox drain");
                report.errors.push(reason);
                report.refused = true;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn deliver(&self, entry: &OutboxEntry) -> Delivery {
        let batch = [PushEntry::from(entry)];

        let results = match self.remote.push(&batch).await {
            Ok(results) => results,
            Err(e) => return classify_push_error(e),
        };

        match results
            .into_iter()
            .find(|r| r.idempotency_key == entry.idempotency_key)
        {
            Some(result) => match result.status {
                PushStatus::Accepted => Delivery::Delivered,
                PushStatus::Rejected => Delivery::Rejected(
                    result
                        .message
                        .unwrap_or_else(|| "Rejected by server".to_string()),
                ),
                PushStatus::Retry => Delivery::Deferred(
                    result
                        .message
                        .unwrap_or_else(|| "Server asked to retry".to_string()),
                ),
            },
            None => Delivery::Deferred(format!(
                "No result for {} in push response",
                entry.idempotency_key
            )),
        }
    }

    async fn defer(&self, entry: &OutboxEntry, now: DateTime<Utc>, reason: &str) -> CacheResult<()> {
        let attempts = entry.attempt_count + 1;
        let next = self.policy.next_attempt_at(now, attempts);
        self.db.outbox().defer(&entry.id, next, reason).await?;
        debug!(
            entry_id = %entry.id,
            attempts,
            next_attempt_at = %next,
            reason = %reason,
            "Write deferred"
        );
        Ok(())
    }
}

fn classify_push_error(err: RemoteError) -> Delivery {
    let reason = err.to_string();
    if err.is_connectivity() {
        Delivery::Offline(reason)
    } else if err.is_refused() {
        Delivery::Refused(reason)
    } else if err.is_transient() {
        Delivery::Deferred(reason)
    } else {
        Delivery::Rejected(reason)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheErrorKind;
    use crate::remote::{PullRequest, PushResult};
    use async_trait::async_trait;
    use scholar_core::{OutboxStatus, PulledDelta};
    use scholar_db::DbConfig;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers pushes from a script; an empty script accepts everything.
    #[derive(Default)]
    struct ScriptedRemote {
        script: Mutex<VecDeque<Result<Option<PushStatus>, RemoteError>>>,
        pushed: Mutex<Vec<String>>,
    }

    impl ScriptedRemote {
        fn then(&self, step: Result<Option<PushStatus>, RemoteError>) -> &Self {
            self.script.lock().unwrap().push_back(step);
            self
        }

        fn pushed(&self) -> Vec<String> {
            self.pushed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteApi for ScriptedRemote {
        async fn push(&self, entries: &[PushEntry]) -> Result<Vec<PushResult>, RemoteError> {
            let key = entries[0].idempotency_key.clone();
            self.pushed.lock().unwrap().push(key.clone());
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Some(PushStatus::Accepted)));
            match step? {
                Some(PushStatus::Accepted) => Ok(vec![PushResult::accepted(key)]),
                Some(PushStatus::Rejected) => Ok(vec![PushResult::rejected(key, "invalid")]),
                Some(PushStatus::Retry) => Ok(vec![PushResult::retry(key, "busy")]),
                None => Ok(Vec::new()),
            }
        }

        async fn pull(&self, _request: &PullRequest) -> Result<PulledDelta, RemoteError> {
            Ok(PulledDelta::default())
        }
    }

    async fn processor(remote: Arc<ScriptedRemote>) -> OutboxProcessor {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.initialize().await.unwrap();
        OutboxProcessor::new(db, remote, RetryPolicy::default())
    }

    fn write(key: &str, target: &str) -> OutboxWrite {
        OutboxWrite::new("progress", key, json!({ "pct": 50 })).for_target(target)
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1).as_secs(), 2);
        assert_eq!(policy.delay(2).as_secs(), 4);
        assert_eq!(policy.delay(3).as_secs(), 8);
        assert_eq!(policy.delay(9).as_secs(), 512);
        assert_eq!(policy.delay(10), Duration::from_secs(600));
        assert_eq!(policy.delay(500), Duration::from_secs(600));
        assert_eq!(policy.delay(0).as_secs(), 2);
    }

    #[tokio::test]
    async fn test_drain_delivers_in_order() {
        let remote = Arc::new(ScriptedRemote::default());
        let outbox = processor(Arc::clone(&remote)).await;

        outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        outbox.enqueue(&write("p2", "lesson:L2")).await.unwrap();
        outbox.enqueue(&write("p3", "lesson:L1")).await.unwrap();

        let report = outbox.drain().await.unwrap();
        assert_eq!(report.delivered, 3);
        assert!(report.is_clean());
        assert_eq!(remote.pushed(), vec!["p1", "p2", "p3"]);

        // Nothing left: a second drain pushes nothing.
        let again = outbox.drain().await.unwrap();
        assert_eq!(again, DrainReport::default());
        assert_eq!(remote.pushed().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_blocks_same_target_only() {
        let remote = Arc::new(ScriptedRemote::default());
        remote.then(Ok(Some(PushStatus::Retry)));
        let outbox = processor(Arc::clone(&remote)).await;

        let first = outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        outbox.enqueue(&write("p2", "lesson:L1")).await.unwrap();
        outbox.enqueue(&write("q1", "quiz:Q4")).await.unwrap();

        let now = Utc::now();
        let report = outbox.drain_at(now).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(remote.pushed(), vec!["p1", "q1"]);

        let stored = outbox.db.outbox().get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!((stored.next_attempt_at - now).num_seconds(), 2);
        assert_eq!(stored.last_error.as_deref(), Some("busy"));

        // Before the backoff elapses p1 is not retried and p2 stays behind it.
        let early = outbox.drain_at(now).await.unwrap();
        assert_eq!(early.skipped_not_due, 1);
        assert_eq!(early.blocked, 1);
        assert_eq!(remote.pushed().len(), 2);

        let later = outbox
            .drain_at(now + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(later.delivered, 2);
        assert_eq!(remote.pushed(), vec!["p1", "q1", "p1", "p2"]);
    }

    #[tokio::test]
    async fn test_rejected_entry_does_not_stall_queue() {
        let remote = Arc::new(ScriptedRemote::default());
        remote.then(Ok(Some(PushStatus::Rejected)));
        let outbox = processor(Arc::clone(&remote)).await;

        let bad = outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        outbox.enqueue(&write("p2", "lesson:L1")).await.unwrap();

        let report = outbox.drain().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.delivered, 1);

        let parked = outbox.db.outbox().get(&bad.id).await.unwrap().unwrap();
        assert_eq!(parked.status, OutboxStatus::FailedPermanent);
        assert_eq!(parked.last_error.as_deref(), Some("invalid"));
    }

    #[tokio::test]
    async fn test_http_422_is_permanent() {
        let remote = Arc::new(ScriptedRemote::default());
        remote.then(Err(RemoteError::from_status(422, "bad payload")));
        let outbox = processor(Arc::clone(&remote)).await;

        outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        let report = outbox.drain().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(outbox.db.outbox().failed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_session_defers_instead_of_rejecting() {
        let remote = Arc::new(ScriptedRemote::default());
        remote.then(Err(RemoteError::from_status(401, "token expired")));
        let outbox = processor(Arc::clone(&remote)).await;

        let first = outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        outbox.enqueue(&write("q1", "quiz:Q4")).await.unwrap();
        outbox.enqueue(&write("n1", "note:N9")).await.unwrap();

        let report = outbox.drain().await.unwrap();
        assert!(report.refused);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(remote.pushed(), vec!["p1"]);

        assert!(outbox.db.outbox().failed().await.unwrap().is_empty());
        let stored = outbox.db.outbox().get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempt_count, 1);

        let counts = outbox.db.outbox().count_by_status().await.unwrap();
        assert_eq!(counts.pending, 3);
    }

    #[tokio::test]
    async fn test_unrecorded_delivery_keeps_target_blocked() {
        let remote = Arc::new(ScriptedRemote::default());
        let outbox = processor(Arc::clone(&remote)).await;

        let first = outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        outbox.enqueue(&write("p2", "lesson:L1")).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER outbox_no_delete BEFORE DELETE ON outbox \
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .execute(outbox.db.pool())
        .await
        .unwrap();

        let err = outbox.drain().await.unwrap_err();
        assert_eq!(err.kind, CacheErrorKind::Storage);
        assert_eq!(remote.pushed(), vec!["p1"]);

        let stored = outbox.db.outbox().get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);

        sqlx::query("DROP TRIGGER outbox_no_delete")
            .execute(outbox.db.pool())
            .await
            .unwrap();

        // p1 goes again before p2; the server dedupes by key.
        let report = outbox.drain().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(remote.pushed(), vec!["p1", "p1", "p2"]);
    }

    #[tokio::test]
    async fn test_offline_stops_drain() {
        let remote = Arc::new(ScriptedRemote::default());
        remote.then(Err(RemoteError::Offline("no route".into())));
        let outbox = processor(Arc::clone(&remote)).await;

        outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        outbox.enqueue(&write("q1", "quiz:Q4")).await.unwrap();

        let report = outbox.drain().await.unwrap();
        assert!(report.offline);
        assert_eq!(report.deferred, 1);
        assert_eq!(remote.pushed(), vec!["p1"]);

        let counts = outbox.db.outbox().count_by_status().await.unwrap();
        assert_eq!(counts.pending, 2);
    }

    #[tokio::test]
    async fn test_missing_result_defers() {
        let remote = Arc::new(ScriptedRemote::default());
        remote.then(Ok(None));
        let outbox = processor(Arc::clone(&remote)).await;

        outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();
        let report = outbox.drain().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert!(report.errors[0].contains("No result"));
    }

    #[tokio::test]
    async fn test_backoff_grows_with_attempts() {
        let remote = Arc::new(ScriptedRemote::default());
        remote
            .then(Err(RemoteError::from_status(503, "down")))
            .then(Err(RemoteError::from_status(503, "down")));
        let outbox = processor(Arc::clone(&remote)).await;

        let entry = outbox.enqueue(&write("p1", "lesson:L1")).await.unwrap();

        let t0 = Utc::now();
        outbox.drain_at(t0).await.unwrap();
        let t1 = t0 + chrono::Duration::seconds(3);
        outbox.drain_at(t1).await.unwrap();

        let stored = outbox.db.outbox().get(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert_eq!((stored.next_attempt_at - t1).num_seconds(), 4);
    }
}
