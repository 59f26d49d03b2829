use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another instance of tubefeed appears to be using the database. Please close it and try again.")]
    InstanceLocked,

    /// Insert collided with an existing subscription id
    #[error("Subscription {0} already exists")]
    AlreadyExists(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored row could not be decoded (bad JSON item list, bad timestamp)
    #[error("Corrupt subscription record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Duration marker for an item whose primary and fallback lookups both failed.
///
/// Opaque: callers must not interpret it as elapsed time.
pub const DURATION_FAILED: i64 = -1;

/// The "nothing seen yet" watermark and the "never fetched" timestamp.
pub const EPOCH_MIN: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

// ============================================================================
// Helper Types
// ============================================================================

/// Row type for subscription queries
pub(crate) type SubscriptionRow = (
    String,         // id
    String,         // source_address
    String,         // title
    i64,            // refresh_interval_secs
    Option<String>, // last_fetch_at
    Option<String>, // last_item_change_at
    Option<String>, // viewed_at
    String,         // items (JSON)
    i64,            // created_at
);

/// Data needed to register a new subscription
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub id: String,
    pub source_address: String,
    pub title: String,
    pub refresh_interval_secs: u64,
}

/// A single named field for [`Database::update_fields`](super::Database::update_fields).
///
/// Each variant maps to one column; the last write wins.
#[derive(Debug, Clone)]
pub enum SubscriptionField {
    Title(String),
    SourceAddress(String),
    RefreshInterval(u64),
    LastFetchAt(DateTime<Utc>),
    LastItemChangeAt(DateTime<Utc>),
    /// Replaces the whole item list in one write
    Items(Vec<FeedItem>),
    ViewedAt(Option<DateTime<Utc>>),
}

impl SubscriptionField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SubscriptionField::Title(_) => "title",
            SubscriptionField::SourceAddress(_) => "source_address",
            SubscriptionField::RefreshInterval(_) => "refresh_interval_secs",
            SubscriptionField::LastFetchAt(_) => "last_fetch_at",
            SubscriptionField::LastItemChangeAt(_) => "last_item_change_at",
            SubscriptionField::Items(_) => "items",
            SubscriptionField::ViewedAt(_) => "viewed_at",
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// One piece of content belonging to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub link: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_uri: Option<String>,
    #[serde(default)]
    pub analyzed: bool,
    /// Seconds. `0` until analyzed, [`DURATION_FAILED`] when enrichment failed.
    #[serde(default)]
    pub duration: i64,
}

impl FeedItem {
    pub fn enrichment_failed(&self) -> bool {
        self.analyzed && self.duration < 0
    }
}

/// A tracked source with its own refresh cadence and item history.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub source_address: String,
    pub title: String,
    pub refresh_interval_secs: u64,
    /// Most recent fetch attempt, successful or not. [`EPOCH_MIN`] if never fetched.
    pub last_fetch_at: DateTime<Utc>,
    /// High-water mark: max `updated_at` over `items`, [`EPOCH_MIN`] when empty.
    pub last_item_change_at: DateTime<Utc>,
    pub viewed_at: Option<DateTime<Utc>>,
    /// First-seen order
    pub items: Vec<FeedItem>,
    pub created_at: i64,
}

impl Subscription {
    /// Items published after the user last viewed this subscription.
    pub fn new_items(&self) -> impl Iterator<Item = &FeedItem> {
        let viewed_at = self.viewed_at;
        self.items
            .iter()
            .filter(move |item| viewed_at.is_none_or(|seen| item.published_at > seen))
    }

    pub fn pending_analysis(&self) -> usize {
        self.items.iter().filter(|item| !item.analyzed).count()
    }
}
