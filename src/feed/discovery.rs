use crate::feed::fetcher::{read_limited_bytes, FetchError, HttpFeedSource};
use crate::feed::parser::FeedDetails;
use crate::util::{
    find_tag_attr, is_channel, is_playlist, is_video, is_youtube, playlist_feed_url,
};
use std::time::Duration;
use thiserror::Error;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PAGE_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// Errors that can occur while resolving a page link into a feed.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The link is not a channel, video or playlist page on the video site
    #[error("not a channel or playlist link: {0}")]
    Unsupported(String),
    /// The channel page carries no RSS link
    #[error("no feed link found on {0}")]
    NotAFeed(String),
    /// Fetching the page or the feed failed
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Resolves a channel or playlist page link into the address of its feed.
///
/// Playlist links map directly onto the playlist feed. Channel and video
/// pages are fetched and scanned for `<link … title="RSS" href=…>`.
pub async fn resolve_feed_address(
    client: &reqwest::Client,
    page_url: &str,
) -> Result<String, DiscoveryError> {
    if !is_youtube(page_url) {
        return Err(DiscoveryError::Unsupported(page_url.to_owned()));
    }

    if is_playlist(page_url) {
        return playlist_feed_url(page_url)
            .ok_or_else(|| DiscoveryError::Unsupported(page_url.to_owned()));
    }

    // Video pages advertise their channel's feed too
    if !is_channel(page_url) && !is_video(page_url) {
        return Err(DiscoveryError::Unsupported(page_url.to_owned()));
    }

    fetch_channel_feed_address(client, page_url).await
}

/// Resolves `page_url` and reads the resulting feed's identity.
///
/// The returned [`FeedDetails::link`] falls back to the resolved address when
/// the feed does not advertise its own.
pub async fn discover(
    client: &reqwest::Client,
    page_url: &str,
) -> Result<FeedDetails, DiscoveryError> {
    let address = resolve_feed_address(client, page_url).await?;
    tracing::debug!(page = %page_url, feed = %address, "Resolved feed address");
    feed_details(client, &address).await
}

/// Fetches a feed and returns its channel-level details.
pub async fn feed_details(
    client: &reqwest::Client,
    feed_address: &str,
) -> Result<FeedDetails, DiscoveryError> {
    let source = HttpFeedSource::new(client.clone()).with_timeout(DISCOVERY_TIMEOUT);
    let mut details = source.fetch_feed(feed_address).await?.details;

    if details.link.is_empty() {
        details.link = feed_address.to_owned();
    }
    if details.id.is_empty() {
        return Err(DiscoveryError::NotAFeed(feed_address.to_owned()));
    }
    Ok(details)
}

async fn fetch_channel_feed_address(
    client: &reqwest::Client,
    page_url: &str,
) -> Result<String, DiscoveryError> {
    let bytes = tokio::time::timeout(DISCOVERY_TIMEOUT, fetch_page(client, page_url))
        .await
        .map_err(|_| FetchError::Timeout)??;
    let html = String::from_utf8_lossy(&bytes);

    channel_feed_from_html(&html).ok_or_else(|| DiscoveryError::NotAFeed(page_url.to_owned()))
}

async fn fetch_page(client: &reqwest::Client, page_url: &str) -> Result<Vec<u8>, FetchError> {
    let response = client
        .get(page_url)
        .send()
        .await
        .map_err(FetchError::Network)?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, MAX_PAGE_SIZE).await
}

/// Finds the feed address advertised by a channel page.
pub fn channel_feed_from_html(html: &str) -> Option<String> {
    find_tag_attr(html, "link", "title", "RSS", "href").map(|href| href.replace("&amp;", "&"))
}
