//! Reconciles freshly fetched entries against a subscription's stored history.
//!
//! Every entry is classified against the watermark passed in:
//!
//! | Condition                        | Effect                                  |
//! |----------------------------------|-----------------------------------------|
//! | `published_at > watermark`       | appended as a new item                  |
//! | `updated_at > watermark`         | replaces the first item with the same id |
//! | otherwise                        | stale, ignored                          |
//!
//! A correction whose id is not in the history is dropped rather than inserted.

use chrono::{DateTime, Utc};

use crate::feed::RawEntry;
use crate::storage::FeedItem;

/// Result of a single [`merge`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub items: Vec<FeedItem>,
    /// Max `updated_at` over `items`, never below the incoming mark
    pub high_water_mark: DateTime<Utc>,
    /// True iff the watermark strictly advanced
    pub changed: bool,
    pub inserted: usize,
    pub corrected: usize,
    /// Corrections that referenced an id missing from the history
    pub dropped: usize,
}

pub fn merge(
    existing: Vec<FeedItem>,
    high_water_mark: DateTime<Utc>,
    fresh: Vec<RawEntry>,
) -> MergeOutcome {
    let mut items = existing;
    let mut inserted = 0;
    let mut corrected = 0;
    let mut dropped = 0;

    for entry in fresh {
        if entry.published_at > high_water_mark {
            items.push(entry.into());
            inserted += 1;
        } else if entry.updated_at > high_water_mark {
            match items.iter_mut().find(|item| item.id == entry.id) {
                Some(slot) => {
                    *slot = entry.into();
                    corrected += 1;
                }
                None => {
                    tracing::debug!(item = %entry.id, "Dropping correction for unknown item");
                    dropped += 1;
                }
            }
        }
    }

    let new_mark = watermark_of(&items, high_water_mark);

    MergeOutcome {
        changed: new_mark > high_water_mark,
        high_water_mark: new_mark,
        items,
        inserted,
        corrected,
        dropped,
    }
}

/// Max `updated_at` over `items`, never lower than `floor`.
///
/// An empty list yields `floor`, which for a fresh subscription is
/// [`EPOCH_MIN`](crate::storage::EPOCH_MIN).
fn watermark_of(items: &[FeedItem], floor: DateTime<Utc>) -> DateTime<Utc> {
    items
        .iter()
        .map(|item| item.updated_at)
        .fold(floor, |acc, at| acc.max(at))
}
