use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::feed::{FeedSource, FetchError};
use crate::storage::{Database, DatabaseError, Subscription, SubscriptionField, EPOCH_MIN};

use super::locks::SubscriptionLocks;
use super::merge::merge;

const DEFAULT_MAX_CONCURRENT: usize = 10;

/// True once `refresh_interval_secs` has elapsed since the last fetch attempt.
///
/// A subscription that was never fetched is always due.
pub fn is_due(sub: &Subscription, now: DateTime<Utc>) -> bool {
    if sub.last_fetch_at == EPOCH_MIN {
        return true;
    }
    let interval = i64::try_from(sub.refresh_interval_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(sub.last_fetch_at) >= interval
}

/// What a single fetch-and-merge did.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The watermark advanced and the new history was written
    Updated { inserted: usize, corrected: usize },
    /// Fetched fine, nothing newer than the watermark
    Unchanged,
    /// The feed could not be fetched; only the attempt time was written
    Failed(FetchError),
    /// Another fetch for the same subscription was in flight
    Busy,
    /// The interval had not elapsed when the lock was taken
    NotDue,
    /// The id is not (or no longer) stored
    NotFound,
}

/// Tally of one [`Scheduler::tick`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Drives periodic fetch-and-merge over every stored subscription.
pub struct Scheduler<S> {
    db: Database,
    source: S,
    locks: SubscriptionLocks,
    max_concurrent: usize,
}

impl<S: FeedSource> Scheduler<S> {
    pub fn new(db: Database, source: S, locks: SubscriptionLocks) -> Self {
        Self {
            db,
            source,
            locks,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Fetch one subscription and merge the result, whether or not it is due.
    ///
    /// `last_fetch_at` is written on success and on fetch failure alike.
    /// Storage errors are returned; fetch errors are reported as
    /// [`FetchOutcome::Failed`].
    pub async fn fetch_and_merge(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome, DatabaseError> {
        self.refresh(id, now, false).await
    }

    async fn refresh(
        &self,
        id: &str,
        now: DateTime<Utc>,
        only_if_due: bool,
    ) -> Result<FetchOutcome, DatabaseError> {
        let Some(guard) = self.locks.try_acquire(id) else {
            tracing::debug!(subscription = %id, "Fetch already in flight, skipping");
            return Ok(FetchOutcome::Busy);
        };

        // Re-read under the lock
        let Some(sub) = self.db.find_one(id).await? else {
            drop(guard);
            self.locks.forget(id);
            return Ok(FetchOutcome::NotFound);
        };
        if only_if_due && !is_due(&sub, now) {
            return Ok(FetchOutcome::NotDue);
        }

        let entries = match self.source.fetch_entries(&sub.source_address).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    subscription = %id,
                    address = %sub.source_address,
                    error = %e,
                    "Feed fetch failed"
                );
                self.db
                    .update_fields(id, &[SubscriptionField::LastFetchAt(now)])
                    .await?;
                return Ok(FetchOutcome::Failed(e));
            }
        };

        let outcome = merge(sub.items, sub.last_item_change_at, entries);
        if outcome.dropped > 0 {
            tracing::debug!(
                subscription = %id,
                dropped = outcome.dropped,
                "Corrections for unknown items dropped"
            );
        }

        if !outcome.changed {
            self.db
                .update_fields(id, &[SubscriptionField::LastFetchAt(now)])
                .await?;
            return Ok(FetchOutcome::Unchanged);
        }

        let written = self
            .db
            .update_fields(
                id,
                &[
                    SubscriptionField::Items(outcome.items),
                    SubscriptionField::LastItemChangeAt(outcome.high_water_mark),
                    SubscriptionField::LastFetchAt(now),
                ],
            )
            .await?;
        if written == 0 {
            drop(guard);
            self.locks.forget(id);
            return Ok(FetchOutcome::NotFound);
        }

        tracing::info!(
            subscription = %id,
            inserted = outcome.inserted,
            corrected = outcome.corrected,
            "Subscription updated"
        );
        Ok(FetchOutcome::Updated {
            inserted: outcome.inserted,
            corrected: outcome.corrected,
        })
    }

    /// Evaluate every subscription once and refresh the due ones.
    ///
    /// Due subscriptions are fetched concurrently, at most `max_concurrent`
    /// at a time. A failure on one never affects the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, DatabaseError> {
        let due: Vec<String> = self
            .db
            .find_all()
            .await?
            .into_iter()
            .filter(|sub| is_due(sub, now))
            .map(|sub| sub.id)
            .collect();

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let results: Vec<(String, Result<FetchOutcome, DatabaseError>)> = stream::iter(due)
            .map(|id| async move {
                let result = self.refresh(&id, now, true).await;
                (id, result)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(FetchOutcome::Updated { .. }) => report.updated += 1,
                Ok(FetchOutcome::Unchanged) => report.unchanged += 1,
                Ok(FetchOutcome::Failed(_)) => report.failed += 1,
                Ok(FetchOutcome::Busy | FetchOutcome::NotDue | FetchOutcome::NotFound) => {
                    report.skipped += 1
                }
                Err(e) => {
                    tracing::warn!(subscription = %id, error = %e, "Failed to store fetch result");
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            due = report.due,
            updated = report.updated,
            failed = report.failed,
            skipped = report.skipped,
            "Scheduler tick complete"
        );
        Ok(report)
    }

    /// Tick every `poll_interval` until `shutdown` flips to `true`.
    ///
    /// Shutdown is observed between ticks; a tick in progress runs to completion.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(poll_secs = poll_interval.as_secs(), "Scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "Scheduler tick failed");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
