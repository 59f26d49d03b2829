use std::future::Future;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use super::duration::{parse_iso8601_duration, DurationParseError};
use crate::feed::{read_limited_bytes, FetchError};
use crate::storage::FeedItem;
use crate::util::{find_tag_attr, video_id};

const DATA_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const MAX_API_RESPONSE: usize = 1024 * 1024; // 1MB
const MAX_PAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB
const VIDEO_ID_PREFIX: &str = "yt:video:";

/// Why a single duration lookup failed. Every variant is a strategy failure:
/// the pipeline moves on to the fallback, then to the failure marker.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("No API key configured")]
    MissingCredential,
    #[error("Lookup timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Response too large")]
    ResponseTooLarge,
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Bad duration: {0}")]
    Duration(#[from] DurationParseError),
    #[error("No duration found")]
    NotFound,
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
}

impl From<FetchError> for LookupError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network(e) => LookupError::Network(e.without_url()),
            FetchError::HttpStatus(status) => LookupError::HttpStatus(status),
            FetchError::Timeout => LookupError::Timeout,
            FetchError::ResponseTooLarge => LookupError::ResponseTooLarge,
            other => LookupError::Malformed(other.to_string()),
        }
    }
}

/// One way of finding out how long an item runs, in seconds.
pub trait DurationLookup: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &'static str;

    fn lookup(&self, item: &FeedItem) -> impl Future<Output = Result<u64, LookupError>> + Send;
}

impl<T: DurationLookup> DurationLookup for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn lookup(&self, item: &FeedItem) -> impl Future<Output = Result<u64, LookupError>> + Send {
        (**self).lookup(item)
    }
}

// ============================================================================
// Data API
// ============================================================================

#[derive(Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    content_details: ContentDetails,
}

#[derive(Deserialize)]
struct ContentDetails {
    duration: String,
}

/// Authoritative lookup through the Data API `videos` endpoint, keyed by the
/// item id with its `yt:video:` namespace stripped, or else by the video id
/// in the item link.
pub struct YoutubeApiLookup {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    base_url: String,
}

impl YoutubeApiLookup {
    pub fn new(client: reqwest::Client, api_key: Option<SecretString>) -> Self {
        Self {
            client,
            api_key,
            base_url: DATA_API_BASE.to_string(),
        }
    }

    /// Point at another API host (tests). Must be HTTPS unless on localhost.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn check_base_url(&self) -> Result<(), LookupError> {
        let base = self.base_url.as_str();
        if base.starts_with("https://") {
            return Ok(());
        }
        let is_localhost =
            base.starts_with("http://127.0.0.1") || base.starts_with("http://localhost");
        if !is_localhost {
            tracing::error!(base_url = %base, "Rejecting non-HTTPS API base URL");
            return Err(LookupError::InsecureBaseUrl);
        }
        Ok(())
    }
}

impl DurationLookup for YoutubeApiLookup {
    fn name(&self) -> &'static str {
        "data-api"
    }

    async fn lookup(&self, item: &FeedItem) -> Result<u64, LookupError> {
        let api_key = self.api_key.as_ref().ok_or(LookupError::MissingCredential)?;
        self.check_base_url()?;

        let id = match item.id.strip_prefix(VIDEO_ID_PREFIX) {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => video_id(&item.link).ok_or(LookupError::NotFound)?,
        };

        let mut url = url::Url::parse(&format!("{}/videos", self.base_url))
            .map_err(|e| LookupError::Malformed(format!("base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("part", "contentDetails")
            .append_pair("id", &id)
            .append_pair("key", api_key.expose_secret());

        // The request URL carries the key; errors must not
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LookupError::Network(e.without_url()))?;

        if !response.status().is_success() {
            return Err(LookupError::HttpStatus(response.status().as_u16()));
        }

        let body = read_limited_bytes(response, MAX_API_RESPONSE).await?;
        let parsed: VideoListResponse =
            serde_json::from_slice(&body).map_err(|e| LookupError::Malformed(e.to_string()))?;

        let resource = parsed.items.into_iter().next().ok_or(LookupError::NotFound)?;
        Ok(parse_iso8601_duration(&resource.content_details.duration)?)
    }
}

// ============================================================================
// Watch page
// ============================================================================

/// Fallback lookup: reads `<meta itemprop="duration">` from the item's page.
pub struct WatchPageLookup {
    client: reqwest::Client,
}

impl WatchPageLookup {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl DurationLookup for WatchPageLookup {
    fn name(&self) -> &'static str {
        "watch-page"
    }

    async fn lookup(&self, item: &FeedItem) -> Result<u64, LookupError> {
        let url = url::Url::parse(&item.link)
            .map_err(|e| LookupError::Malformed(format!("item link {:?}: {e}", item.link)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LookupError::Malformed(format!(
                "unsupported scheme in {:?}",
                item.link
            )));
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(LookupError::HttpStatus(response.status().as_u16()));
        }

        let body = read_limited_bytes(response, MAX_PAGE_SIZE).await?;
        let html = String::from_utf8_lossy(&body);

        let duration = find_tag_attr(&html, "meta", "itemprop", "duration", "content")
            .ok_or(LookupError::NotFound)?;
        Ok(parse_iso8601_duration(duration)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(id: &str, link: &str) -> FeedItem {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        FeedItem {
            id: id.to_string(),
            link: link.to_string(),
            title: "Video".to_string(),
            published_at: at,
            updated_at: at,
            thumbnail: None,
            summary: None,
            author_name: None,
            author_uri: None,
            analyzed: false,
            duration: 0,
        }
    }

    fn api(server: &MockServer) -> YoutubeApiLookup {
        YoutubeApiLookup::new(
            reqwest::Client::new(),
            Some(SecretString::from("test-key".to_string())),
        )
        .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_api_lookup_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/videos"))
            .and(query_param("part", "contentDetails"))
            .and(query_param("id", "AAAAAAAAAAA"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"kind":"youtube#videoListResponse","items":[{"id":"AAAAAAAAAAA","contentDetails":{"duration":"PT8M11S","definition":"hd"}}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let secs = api(&server)
            .lookup(&item("yt:video:AAAAAAAAAAA", ""))
            .await
            .unwrap();
        assert_eq!(secs, 491);
    }

    #[tokio::test]
    async fn test_api_lookup_takes_id_from_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/videos"))
            .and(query_param("id", "jNQXAC9IVRw"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"items":[{"id":"jNQXAC9IVRw","contentDetails":{"duration":"PT19S"}}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let secs = api(&server)
            .lookup(&item(
                "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
                "https://youtu.be/jNQXAC9IVRw",
            ))
            .await
            .unwrap();
        assert_eq!(secs, 19);
    }

    #[tokio::test]
    async fn test_api_lookup_without_video_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let err = api(&server)
            .lookup(&item("urn:entry:1", "https://www.youtube.com/@kurzgesagt"))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NotFound));
    }

    #[tokio::test]
    async fn test_api_lookup_without_key() {
        let lookup = YoutubeApiLookup::new(reqwest::Client::new(), None);
        let err = lookup
            .lookup(&item("yt:video:AAAAAAAAAAA", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::MissingCredential));
    }

    #[tokio::test]
    async fn test_api_lookup_unknown_video() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"items":[]}"#))
            .mount(&server)
            .await;

        let err = api(&server)
            .lookup(&item("yt:video:gone", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NotFound));
    }

    #[tokio::test]
    async fn test_api_lookup_quota_exceeded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = api(&server)
            .lookup(&item("yt:video:AAAAAAAAAAA", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::HttpStatus(403)));
    }

    #[tokio::test]
    async fn test_api_lookup_malformed_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = api(&server)
            .lookup(&item("yt:video:AAAAAAAAAAA", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_api_rejects_insecure_base() {
        let lookup = YoutubeApiLookup::new(
            reqwest::Client::new(),
            Some(SecretString::from("test-key".to_string())),
        )
        .with_base_url("http://api.example.com");
        let err = lookup
            .lookup(&item("yt:video:AAAAAAAAAAA", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::InsecureBaseUrl));
    }

    #[tokio::test]
    async fn test_watch_page_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/watch"))
            .and(query_param("v", "AAAAAAAAAAA"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><meta itemprop="name" content="First video"><meta itemprop="duration" content="PT8M11S"></head></html>"#,
            ))
            .mount(&server)
            .await;

        let lookup = WatchPageLookup::new(reqwest::Client::new());
        let link = format!("{}/watch?v=AAAAAAAAAAA", server.uri());
        let secs = lookup
            .lookup(&item("yt:video:AAAAAAAAAAA", &link))
            .await
            .unwrap();
        assert_eq!(secs, 491);
    }

    #[tokio::test]
    async fn test_watch_page_without_duration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let lookup = WatchPageLookup::new(reqwest::Client::new());
        let err = lookup
            .lookup(&item("x", &format!("{}/watch?v=x", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::NotFound));
    }

    #[tokio::test]
    async fn test_watch_page_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let lookup = WatchPageLookup::new(reqwest::Client::new());
        let err = lookup
            .lookup(&item("x", &format!("{}/watch?v=x", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_watch_page_rejects_bad_link() {
        let lookup = WatchPageLookup::new(reqwest::Client::new());
        let err = lookup.lookup(&item("x", "not a url")).await.unwrap_err();
        assert!(matches!(err, LookupError::Malformed(_)));
    }
}
