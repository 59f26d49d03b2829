//! Feed retrieval: parsing, fetching and resolving subscription addresses.
//!
//! - [`parser`] - converts RSS/Atom bytes into [`RawEntry`] values using `feed-rs`
//! - [`fetcher`] - the [`FeedSource`] seam and its HTTP implementation
//! - [`discovery`] - turns a channel or playlist page link into a feed address

mod discovery;
mod fetcher;
mod parser;

pub use discovery::{
    channel_feed_from_html, discover, feed_details, resolve_feed_address, DiscoveryError,
};
pub(crate) use fetcher::read_limited_bytes;
pub use fetcher::{FeedSource, FetchError, HttpFeedSource};
pub use parser::{parse_feed, FeedDetails, ParsedFeed, RawEntry};

#[cfg(test)]
pub(crate) use parser::fixtures;
