use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::lookup::{DurationLookup, LookupError};
use crate::storage::{
    Database, DatabaseError, FeedItem, Subscription, SubscriptionField, DURATION_FAILED,
};
use crate::sync::SubscriptionLocks;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Fills in item durations with a primary and a fallback strategy.
///
/// Every item is attempted once: whatever happens it leaves with
/// `analyzed = true`, holding either a duration or [`DURATION_FAILED`].
pub struct Enricher<P, F> {
    primary: P,
    fallback: F,
    timeout: Duration,
    max_concurrent: usize,
}

impl<P: DurationLookup, F: DurationLookup> Enricher<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self {
            primary,
            fallback,
            timeout: DEFAULT_TIMEOUT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    /// Upper bound for each individual lookup.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Items looked up at once within one subscription.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    async fn attempt<L: DurationLookup>(
        &self,
        lookup: &L,
        item: &FeedItem,
    ) -> Result<u64, LookupError> {
        tokio::time::timeout(self.timeout, lookup.lookup(item))
            .await
            .map_err(|_| LookupError::Timeout)?
    }

    async fn resolve(&self, item: &FeedItem) -> i64 {
        let primary_err = match self.attempt(&self.primary, item).await {
            Ok(secs) => return clamp_secs(secs),
            Err(e) => e,
        };
        tracing::debug!(
            item = %item.id,
            strategy = self.primary.name(),
            error = %primary_err,
            "Primary duration lookup failed, trying fallback"
        );

        match self.attempt(&self.fallback, item).await {
            Ok(secs) => clamp_secs(secs),
            Err(e) => {
                tracing::warn!(
                    item = %item.id,
                    primary_error = %primary_err,
                    fallback = self.fallback.name(),
                    error = %e,
                    "Duration lookup failed"
                );
                DURATION_FAILED
            }
        }
    }

    /// Returns `item` with its duration resolved and `analyzed` set.
    pub async fn analyze_item(&self, item: FeedItem) -> FeedItem {
        let duration = self.resolve(&item).await;
        FeedItem {
            analyzed: true,
            duration,
            ..item
        }
    }

    /// Enriches every unanalyzed item of `sub` in place.
    ///
    /// Returns whether at least one item changed. Never touches storage.
    pub async fn analyze_subscription(&self, sub: &mut Subscription) -> bool {
        !self.enrich_pending(sub).await.is_empty()
    }

    /// Enriches the unanalyzed items of `sub` in place and returns copies of
    /// exactly those items.
    async fn enrich_pending(&self, sub: &mut Subscription) -> Vec<FeedItem> {
        let pending: Vec<(usize, FeedItem)> = sub
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.analyzed)
            .map(|(index, item)| (index, item.clone()))
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        let analyzed: Vec<(usize, FeedItem)> = stream::iter(pending)
            .map(|(index, item)| async move { (index, self.analyze_item(item).await) })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut enriched = Vec::with_capacity(analyzed.len());
        for (index, item) in analyzed {
            enriched.push(item.clone());
            sub.items[index] = item;
        }
        enriched
    }

    /// One enrichment pass over every stored subscription.
    ///
    /// Lookups run without holding any lock; results are then applied under
    /// the subscription's lock to a fresh read of the row, so a merge that
    /// landed meanwhile is kept. Returns the number of subscriptions written.
    pub async fn analyze_collection(
        &self,
        db: &Database,
        locks: &SubscriptionLocks,
    ) -> Result<usize> {
        let subscriptions = db
            .find_all()
            .await
            .context("Failed to load subscriptions")?;

        let mut updated = 0;
        for mut sub in subscriptions {
            let enriched = self.enrich_pending(&mut sub).await;
            if enriched.is_empty() {
                continue;
            }
            match write_back(db, locks, &sub.id, &enriched).await {
                Ok(true) => {
                    tracing::info!(subscription = %sub.id, "Durations stored");
                    updated += 1;
                }
                Ok(false) => {
                    tracing::debug!(subscription = %sub.id, "Nothing left to store after re-read");
                }
                Err(e) => {
                    tracing::warn!(subscription = %sub.id, error = %e, "Failed to store durations");
                }
            }
        }
        Ok(updated)
    }

    /// Run [`analyze_collection`](Self::analyze_collection) every `interval`
    /// until `shutdown` flips to `true`.
    pub async fn run(
        &self,
        db: Database,
        locks: SubscriptionLocks,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "Enrichment started");
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

            match self.analyze_collection(&db, &locks).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(updated = count, "Enrichment pass complete"),
                Err(e) => tracing::warn!(error = %e, "Enrichment pass failed"),
            }
        }
        tracing::info!("Enrichment stopped");
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Copies the durations in `enriched` onto the stored row's still-unanalyzed
/// items and writes the item list back.
///
/// An item only takes a result looked up for the same id and the same
/// `updated_at`; an item corrected by a merge meanwhile stays unanalyzed.
/// Returns `false` when the row is gone or nothing was left to apply.
async fn write_back(
    db: &Database,
    locks: &SubscriptionLocks,
    subscription_id: &str,
    enriched: &[FeedItem],
) -> Result<bool, DatabaseError> {
    let guard = locks.acquire(subscription_id).await;

    let Some(current) = db.find_one(subscription_id).await? else {
        drop(guard);
        locks.forget(subscription_id);
        return Ok(false);
    };

    let results: HashMap<(&str, DateTime<Utc>), i64> = enriched
        .iter()
        .map(|item| ((item.id.as_str(), item.updated_at), item.duration))
        .collect();

    let mut items = current.items;
    let mut applied = 0;
    for item in items.iter_mut().filter(|item| !item.analyzed) {
        if let Some(&duration) = results.get(&(item.id.as_str(), item.updated_at)) {
            item.analyzed = true;
            item.duration = duration;
            applied += 1;
        }
    }
    if applied == 0 {
        return Ok(false);
    }

    let written = db
        .update_fields(subscription_id, &[SubscriptionField::Items(items)])
        .await?;
    Ok(written > 0)
}
