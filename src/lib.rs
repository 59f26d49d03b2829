//! Keeps channel and playlist video feeds in sync and enriches their items
//! with durations.
//!
//! - [`storage`] - SQLite-backed subscription records
//! - [`feed`] - fetching, parsing and resolving feeds
//! - [`sync`] - merging fetched entries into history on a per-feed schedule
//! - [`enrich`] - duration lookups with a fallback strategy
//! - [`config`] - the optional TOML configuration file

pub mod config;
pub mod enrich;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
