//! Duration enrichment for stored items.
//!
//! Each unanalyzed item is looked up once through a primary strategy (the
//! Data API), falling back to the item's watch page. Items for which both
//! fail keep [`DURATION_FAILED`](crate::storage::DURATION_FAILED) and are not
//! retried automatically.

mod duration;
mod lookup;
mod pipeline;

pub use duration::{parse_iso8601_duration, DurationParseError};
pub use lookup::{DurationLookup, LookupError, WatchPageLookup, YoutubeApiLookup};
pub use pipeline::Enricher;
