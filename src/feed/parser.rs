use anyhow::Result;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::storage::FeedItem;

/// One entry as reported by the feed, before it is merged into history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,
    pub link: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub thumbnail: Option<String>,
    pub summary: Option<String>,
    pub author_name: Option<String>,
    pub author_uri: Option<String>,
}

impl From<RawEntry> for FeedItem {
    fn from(entry: RawEntry) -> Self {
        FeedItem {
            id: entry.id,
            link: entry.link,
            title: entry.title,
            published_at: entry.published_at,
            updated_at: entry.updated_at,
            thumbnail: entry.thumbnail,
            summary: entry.summary,
            author_name: entry.author_name,
            author_uri: entry.author_uri,
            analyzed: false,
            duration: 0,
        }
    }
}

/// Identity of a feed, read from its channel-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDetails {
    /// Namespaced source id, e.g. `yt:channel:…`
    pub id: String,
    /// First link of the feed (the feed's own address for video feeds)
    pub link: String,
    pub title: String,
}

/// Parsed feed document.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub details: FeedDetails,
    pub entries: Vec<RawEntry>,
    /// Entries dropped for lacking both a published and an updated timestamp
    pub skipped: usize,
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    let feed = parser::parse(bytes)?;

    let details = FeedDetails {
        id: feed.id.trim().to_string(),
        link: feed
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_default(),
        title: feed
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled".to_string()),
    };

    let mut skipped = 0;
    let entries: Vec<RawEntry> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default();
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let (published_at, updated_at) = match (entry.published, entry.updated) {
                (Some(p), Some(u)) => (p, u),
                (Some(p), None) => (p, p),
                (None, Some(u)) => (u, u),
                (None, None) => {
                    skipped += 1;
                    return None;
                }
            };

            let media = entry.media.first();
            let thumbnail = media
                .and_then(|m| m.thumbnails.first())
                .map(|t| t.image.uri.clone());
            let summary = media
                .and_then(|m| m.description.as_ref())
                .map(|d| d.content.clone())
                .or_else(|| entry.summary.map(|s| s.content));

            let author = entry.authors.first();
            let author_name = author.map(|a| a.name.clone());
            let author_uri = author.and_then(|a| a.uri.clone());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let id = generate_id(existing_id, &link, &title, published_at);

            Some(RawEntry {
                id,
                link,
                title,
                published_at,
                updated_at,
                thumbnail,
                summary,
                author_name,
                author_uri,
            })
        })
        .collect();

    Ok(ParsedFeed {
        details,
        entries,
        skipped,
    })
}

fn generate_id(existing: Option<&str>, link: &str, title: &str, published: DateTime<Utc>) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!("{}|{}|{}", link, title, published.timestamp());
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
