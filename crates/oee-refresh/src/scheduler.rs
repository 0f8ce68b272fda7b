//! Background refresh on a tick loop.
//!
//! Each tick reaps expired leases, queues every window that closed before
//! `now - safety_lag`, then claims and computes ready windows in rounds until
//! nothing is claimable or the per-tick budget is spent. Coarse windows
//! become claimable once their children finish, so a single tick can carry a
//! fresh minute all the way up to its hour. Workers run on the blocking pool
//! with one SQLite connection each and check for cancellation between
//! windows.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use oee_core::{Granularity, ROLLUP_LEVELS, TimeWindow};
use oee_db::{ClaimedWindow, Database, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::RefreshError;
use crate::aggregator::{MasterSnapshot, compute_window, materialize_reliability};

const CLAIMS_PER_WORKER: usize = 32;

/// Scheduler settings, read from the `[scheduler]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Windows closer than this to now are left for a later tick so late
    /// events have a chance to arrive.
    pub safety_lag_secs: i64,
    pub lease_secs: i64,
    pub max_retries: i64,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
    pub workers: usize,
    pub max_windows_per_tick: usize,
    /// Length of the trailing reliability record. Zero disables it.
    pub reliability_period_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            safety_lag_secs: 120,
            lease_secs: 300,
            max_retries: 5,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
            workers: 4,
            max_windows_per_tick: 5000,
            reliability_period_hours: 720,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::seconds(self.backoff_base_secs),
            backoff_cap: Duration::seconds(self.backoff_cap_secs),
        }
    }

    fn lease(&self) -> Duration {
        Duration::seconds(self.lease_secs)
    }

    fn safety_lag(&self) -> Duration {
        Duration::seconds(self.safety_lag_secs)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub reaped: usize,
    pub enqueued: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Failures that used up the last retry.
    pub exhausted: usize,
    /// Claims handed back unprocessed on cancellation.
    pub released: usize,
    /// Results dropped because another worker took over the window.
    pub lost_leases: usize,
}

impl TickSummary {
    fn absorb(&mut self, worker: &Self) {
        self.completed += worker.completed;
        self.failed += worker.failed;
        self.exhausted += worker.exhausted;
        self.released += worker.released;
        self.lost_leases += worker.lost_leases;
    }
}

/// Wall clock of one tick, anchored at the tick's `now`.
#[derive(Debug, Clone, Copy)]
struct TickClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl TickClock {
    fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.base + Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

/// Drives the refresh queue of one database file.
#[derive(Debug, Clone)]
pub struct Scheduler {
    db_path: PathBuf,
    config: SchedulerConfig,
    owner: String,
}

impl Scheduler {
    pub fn new(db_path: impl Into<PathBuf>, config: SchedulerConfig) -> Self {
        Self {
            db_path: db_path.into(),
            config,
            owner: format!("refresh-{}", Uuid::new_v4()),
        }
    }

    /// Lease owner recorded on claimed windows.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Ticks until `cancel` fires. A failing tick is logged and the loop
    /// carries on with the next one.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RefreshError> {
        // Fail fast on an unusable database path.
        self.with_db(|_| Ok(())).await?;

        let period = std::time::Duration::from_secs(self.config.tick_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            owner = %self.owner,
            interval_secs = period.as_secs(),
            workers = self.config.workers,
            "refresh scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick(Utc::now(), &cancel).await {
                        Ok(summary) if summary.claimed > 0 || summary.reaped > 0 => {
                            tracing::info!(
                                enqueued = summary.enqueued,
                                completed = summary.completed,
                                failed = summary.failed,
                                reaped = summary.reaped,
                                "refresh tick"
                            );
                        }
                        Ok(summary) => tracing::debug!(enqueued = summary.enqueued, "refresh tick idle"),
                        Err(err) => tracing::error!(kind = %err.kind(), error = %err, "refresh tick failed"),
                    }
                }
            }
        }

        tracing::info!(owner = %self.owner, "refresh scheduler stopped");
        Ok(())
    }

    /// Runs one tick as of `now`.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TickSummary, RefreshError> {
        let clock = TickClock::new(now);
        let config = self.config.clone();
        let (master, reaped, enqueued) = self
            .with_db(move |db| {
                let reaped = db.reap_expired_leases(now)?;
                let master = MasterSnapshot::load(db)?;
                let enqueued = enqueue_due(db, &master, &config, now)?;
                Ok((master, reaped, enqueued))
            })
            .await?;
        let master = Arc::new(master);

        let mut summary = TickSummary {
            reaped,
            enqueued,
            ..TickSummary::default()
        };
        let batch = self.config.workers.max(1) * CLAIMS_PER_WORKER;
        let mut budget = self.config.max_windows_per_tick;
        while budget > 0 && !cancel.is_cancelled() {
            let owner = self.owner.clone();
            let lease = self.config.lease();
            let max_retries = self.config.max_retries;
            let limit = budget.min(batch);
            let at = clock.now();
            let claims = self
                .with_db(move |db| Ok(db.claim_windows(&owner, at, lease, max_retries, limit)?))
                .await?;
            if claims.is_empty() {
                break;
            }
            budget = budget.saturating_sub(claims.len());
            summary.claimed += claims.len();
            self.process(claims, &master, clock, cancel, &mut summary)
                .await?;
        }

        let config = self.config.clone();
        self.with_db(move |db| advance(db, &master, &config, clock.now()))
            .await?;
        Ok(summary)
    }

    async fn process(
        &self,
        claims: Vec<ClaimedWindow>,
        master: &Arc<MasterSnapshot>,
        clock: TickClock,
        cancel: &CancellationToken,
        summary: &mut TickSummary,
    ) -> Result<(), RefreshError> {
        let workers = self.config.workers.max(1).min(claims.len());
        let mut chunks: Vec<Vec<ClaimedWindow>> = vec![Vec::new(); workers];
        for (idx, claim) in claims.into_iter().enumerate() {
            chunks[idx % workers].push(claim);
        }

        let mut set = JoinSet::new();
        for chunk in chunks {
            let path = self.db_path.clone();
            let master = Arc::clone(master);
            let cancel = cancel.clone();
            let policy = self.config.retry_policy();
            set.spawn_blocking(move || {
                let mut db = Database::open(&path)?;
                run_worker(&mut db, &master, &chunk, &policy, clock, &cancel)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined? {
                Ok(outcome) => summary.absorb(&outcome),
                // Its remaining claims come back once their leases expire.
                Err(err) => tracing::error!(kind = %err.kind(), error = %err, "refresh worker failed"),
            }
        }
        Ok(())
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, RefreshError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T, RefreshError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = Database::open(&path)?;
            f(&mut db)
        })
        .await?
    }
}

/// Seeds watermarks and queues every closed window up to the horizon.
fn enqueue_due(
    db: &mut Database,
    master: &MasterSnapshot,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<usize, RefreshError> {
    let horizon = now - config.safety_lag();
    let mut enqueued = 0;
    for spec in master.equipment() {
        let Some(first) = db.first_event_time(&spec.id)? else {
            continue;
        };
        // Every level starts on the same day boundary so coarse windows
        // always find their full set of children.
        let origin = Granularity::Day.align(first);
        for granularity in ROLLUP_LEVELS {
            db.init_watermark(&spec.id, granularity, origin)?;
            enqueued += db.enqueue_until(
                &spec.id,
                granularity,
                horizon,
                config.max_windows_per_tick,
                now,
            )?;
        }
    }
    Ok(enqueued)
}

fn run_worker(
    db: &mut Database,
    master: &MasterSnapshot,
    claims: &[ClaimedWindow],
    policy: &RetryPolicy,
    clock: TickClock,
    cancel: &CancellationToken,
) -> Result<TickSummary, RefreshError> {
    let mut outcome = TickSummary::default();
    for (idx, claim) in claims.iter().enumerate() {
        if cancel.is_cancelled() {
            for rest in &claims[idx..] {
                if db.release_window(rest, clock.now())? {
                    outcome.released += 1;
                }
            }
            tracing::info!(released = outcome.released, "refresh worker cancelled");
            break;
        }
        process_claim(db, master, claim, policy, clock.now(), &mut outcome)?;
    }
    Ok(outcome)
}

fn process_claim(
    db: &mut Database,
    master: &MasterSnapshot,
    claim: &ClaimedWindow,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    outcome: &mut TickSummary,
) -> Result<(), RefreshError> {
    let key = &claim.key;
    let completed = match compute_window(db, master, key) {
        Ok(record) => db
            .complete_window(claim, &record, now)
            .map_err(RefreshError::from),
        Err(err) => Err(err),
    };

    match completed {
        Ok(true) => {
            outcome.completed += 1;
            if key.granularity == Granularity::Day {
                if let Err(err) = materialize_reliability(db, master, &key.equipment_id, key.window, now) {
                    tracing::warn!(
                        equipment = %key.equipment_id,
                        period_start = %key.window.start,
                        error = %err,
                        "daily reliability failed"
                    );
                }
            }
        }
        Ok(false) => {
            outcome.lost_leases += 1;
            tracing::warn!(
                equipment = %key.equipment_id,
                granularity = %key.granularity,
                window_start = %key.window.start,
                "lease lost before completion"
            );
        }
        Err(err) => {
            outcome.failed += 1;
            let kind = err.kind();
            match db.fail_window(claim, &err.to_string(), kind, policy, now)? {
                Some(failure) if failure.exhausted => {
                    outcome.exhausted += 1;
                    tracing::error!(
                        alert = true,
                        equipment = %key.equipment_id,
                        granularity = %key.granularity,
                        window_start = %key.window.start,
                        attempts = failure.attempts,
                        kind = %kind,
                        error = %err,
                        "window refresh failed permanently"
                    );
                }
                Some(failure) => tracing::warn!(
                    equipment = %key.equipment_id,
                    granularity = %key.granularity,
                    window_start = %key.window.start,
                    attempts = failure.attempts,
                    kind = %kind,
                    error = %err,
                    "window refresh failed, will retry"
                ),
                None => outcome.lost_leases += 1,
            }
        }
    }
    Ok(())
}

/// Advances watermarks and refreshes the trailing reliability record when
/// the day watermark moved.
fn advance(
    db: &mut Database,
    master: &MasterSnapshot,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<(), RefreshError> {
    for spec in master.equipment() {
        let day_before = db.watermark(&spec.id, Granularity::Day)?;
        let mut day_after = day_before;
        for granularity in ROLLUP_LEVELS {
            let advanced = db.advance_watermark(&spec.id, granularity)?;
            if granularity == Granularity::Day {
                day_after = advanced;
            }
        }

        if day_after == day_before || config.reliability_period_hours <= 0 {
            continue;
        }
        let Some(end) = day_after else {
            continue;
        };
        let period = TimeWindow {
            start: end - Duration::hours(config.reliability_period_hours),
            end,
        };
        if let Err(err) = materialize_reliability(db, master, &spec.id, period, now) {
            tracing::warn!(equipment = %spec.id, error = %err, "rolling reliability failed");
        }
    }
    Ok(())
}
