//! Integration tests for the subscription lifecycle: subscribe, collect,
//! analyze, view, unsubscribe.
//!
//! Each test creates its own in-memory SQLite database and its own mock HTTP
//! server standing in for the feed host, the Data API and the watch pages.

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tubefeed::enrich::{Enricher, WatchPageLookup, YoutubeApiLookup};
use tubefeed::feed::{feed_details, HttpFeedSource};
use tubefeed::storage::{
    Database, DatabaseError, NewSubscription, SubscriptionField, DURATION_FAILED,
};
use tubefeed::sync::{FetchOutcome, Scheduler, SubscriptionLocks};

const CHANNEL_ID: &str = "yt:channel:UCsXVk37bltHxD1rDPwtNM8Q";

struct Video {
    id: &'static str,
    published: &'static str,
    updated: &'static str,
}

fn channel_feed(server: &str, videos: &[Video]) -> String {
    let entries: String = videos
        .iter()
        .map(|v| {
            format!(
                r#" <entry>
  <id>yt:video:{id}</id>
  <yt:videoId>{id}</yt:videoId>
  <title>Video {id}</title>
  <link rel="alternate" href="{server}/watch?v={id}"/>
  <author><name>Kurzgesagt</name><uri>https://www.youtube.com/channel/UCsXVk37bltHxD1rDPwtNM8Q</uri></author>
  <published>{published}</published>
  <updated>{updated}</updated>
  <media:group>
   <media:title>Video {id}</media:title>
   <media:thumbnail url="https://i1.ytimg.com/vi/{id}/hqdefault.jpg" width="480" height="360"/>
   <media:description>About {id}</media:description>
  </media:group>
 </entry>
"#,
                id = v.id,
                published = v.published,
                updated = v.updated,
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns:media="http://search.yahoo.com/mrss/" xmlns="http://www.w3.org/2005/Atom">
 <link rel="self" href="{server}/feeds/videos.xml?channel_id=UCsXVk37bltHxD1rDPwtNM8Q"/>
 <id>{CHANNEL_ID}</id>
 <title>Kurzgesagt</title>
 <published>2013-07-09T00:00:00+00:00</published>
{entries}</feed>"#
    )
}

async fn serve_feed(server: &MockServer, body: String) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/feeds/videos.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn serve_api_duration(server: &MockServer, video: &str, duration: &str) {
    Mock::given(method("GET"))
        .and(path("/videos"))
        .and(query_param("id", video))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"{{"items":[{{"id":"{video}","contentDetails":{{"duration":"{duration}"}}}}]}}"#
        )))
        .mount(server)
        .await;
}

async fn serve_watch_page(server: &MockServer, video: &str, duration: Option<&str>) {
    let meta = duration
        .map(|d| format!(r#"<meta itemprop="duration" content="{d}">"#))
        .unwrap_or_default();
    Mock::given(method("GET"))
        .and(path("/watch"))
        .and(query_param("v", video))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("<html><head>{meta}</head></html>")),
        )
        .mount(server)
        .await;
}

async fn subscribe(db: &Database, server: &MockServer) -> String {
    let client = reqwest::Client::new();
    let details = feed_details(&client, &format!("{}/feeds/videos.xml", server.uri()))
        .await
        .unwrap();
    let sub = db
        .insert_if_absent(&NewSubscription {
            id: details.id,
            source_address: details.link,
            title: details.title,
            refresh_interval_secs: 300,
        })
        .await
        .unwrap();
    sub.id
}

fn scheduler(db: &Database, locks: &SubscriptionLocks) -> Scheduler<HttpFeedSource> {
    let source = HttpFeedSource::new(reqwest::Client::new())
        .with_timeout(Duration::from_secs(5))
        .with_backoff_base(Duration::from_millis(1));
    Scheduler::new(db.clone(), source, locks.clone())
}

fn enricher(server: &MockServer) -> Enricher<YoutubeApiLookup, WatchPageLookup> {
    let client = reqwest::Client::new();
    Enricher::new(
        YoutubeApiLookup::new(
            client.clone(),
            Some(SecretString::from("integration-key".to_string())),
        )
        .with_base_url(server.uri()),
        WatchPageLookup::new(client),
    )
    .with_timeout(Duration::from_secs(5))
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_reads_feed_identity() {
    let server = MockServer::start().await;
    serve_feed(&server, channel_feed(&server.uri(), &[])).await;
    let db = Database::open(":memory:").await.unwrap();

    let id = subscribe(&db, &server).await;
    assert_eq!(id, CHANNEL_ID);

    let sub = db.find_one(&id).await.unwrap().unwrap();
    assert_eq!(sub.title, "Kurzgesagt");
    assert!(sub.source_address.ends_with("/feeds/videos.xml?channel_id=UCsXVk37bltHxD1rDPwtNM8Q"));
    assert!(sub.items.is_empty());
}

#[tokio::test]
async fn test_subscribe_twice_is_a_conflict() {
    let server = MockServer::start().await;
    serve_feed(&server, channel_feed(&server.uri(), &[])).await;
    let db = Database::open(":memory:").await.unwrap();

    subscribe(&db, &server).await;
    let err = db
        .insert_if_absent(&NewSubscription {
            id: CHANNEL_ID.to_string(),
            source_address: "elsewhere".to_string(),
            title: "dup".to_string(),
            refresh_interval_secs: 60,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::AlreadyExists(id) if id == CHANNEL_ID));
}

// ============================================================================
// Collect
// ============================================================================

#[tokio::test]
async fn test_collect_then_correct_then_repeat() {
    let server = MockServer::start().await;
    let videos = [
        Video { id: "aaaaaaaaaaa", published: "2024-05-01T10:00:00+00:00", updated: "2024-05-01T10:00:00+00:00" },
        Video { id: "bbbbbbbbbbb", published: "2024-05-02T10:00:00+00:00", updated: "2024-05-02T10:30:00+00:00" },
    ];
    serve_feed(&server, channel_feed(&server.uri(), &videos)).await;
    let db = Database::open(":memory:").await.unwrap();
    let id = subscribe(&db, &server).await;
    let scheduler = scheduler(&db, &SubscriptionLocks::new());

    let now = Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap();
    let outcome = scheduler.fetch_and_merge(&id, now).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Updated { inserted: 2, corrected: 0 }));

    let sub = db.find_one(&id).await.unwrap().unwrap();
    assert_eq!(sub.items.len(), 2);
    assert_eq!(sub.last_item_change_at, Utc.with_ymd_and_hms(2024, 5, 2, 10, 30, 0).unwrap());

    // The first video is re-edited; the feed now reports a newer updated time
    let edited = [
        Video { id: "aaaaaaaaaaa", published: "2024-05-01T10:00:00+00:00", updated: "2024-05-03T08:00:00+00:00" },
        Video { id: "bbbbbbbbbbb", published: "2024-05-02T10:00:00+00:00", updated: "2024-05-02T10:30:00+00:00" },
    ];
    serve_feed(&server, channel_feed(&server.uri(), &edited)).await;

    let later = Utc.with_ymd_and_hms(2024, 5, 3, 9, 0, 0).unwrap();
    let outcome = scheduler.fetch_and_merge(&id, later).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Updated { inserted: 0, corrected: 1 }));

    let sub = db.find_one(&id).await.unwrap().unwrap();
    let ids: Vec<_> = sub.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["yt:video:aaaaaaaaaaa", "yt:video:bbbbbbbbbbb"]);
    assert_eq!(sub.items[0].updated_at, Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).unwrap());

    // Same feed again: nothing changes but the attempt time
    let even_later = Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap();
    let outcome = scheduler.fetch_and_merge(&id, even_later).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Unchanged));
    let again = db.find_one(&id).await.unwrap().unwrap();
    assert_eq!(again.items, sub.items);
    assert_eq!(again.last_fetch_at, even_later);
}

#[tokio::test]
async fn test_unreachable_feed_keeps_history() {
    let server = MockServer::start().await;
    let videos = [Video { id: "aaaaaaaaaaa", published: "2024-05-01T10:00:00+00:00", updated: "2024-05-01T10:00:00+00:00" }];
    serve_feed(&server, channel_feed(&server.uri(), &videos)).await;
    let db = Database::open(":memory:").await.unwrap();
    let id = subscribe(&db, &server).await;
    let scheduler = scheduler(&db, &SubscriptionLocks::new());

    let now = Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap();
    scheduler.fetch_and_merge(&id, now).await.unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let later = Utc.with_ymd_and_hms(2024, 5, 3, 1, 0, 0).unwrap();
    let outcome = scheduler.fetch_and_merge(&id, later).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Failed(_)));

    let sub = db.find_one(&id).await.unwrap().unwrap();
    assert_eq!(sub.items.len(), 1);
    assert_eq!(sub.last_fetch_at, later);
}

// ============================================================================
// Analyze
// ============================================================================

#[tokio::test]
async fn test_analyze_uses_api_then_watch_page() {
    let server = MockServer::start().await;
    let videos = [
        Video { id: "aaaaaaaaaaa", published: "2024-05-01T10:00:00+00:00", updated: "2024-05-01T10:00:00+00:00" },
        Video { id: "bbbbbbbbbbb", published: "2024-05-02T10:00:00+00:00", updated: "2024-05-02T10:00:00+00:00" },
        Video { id: "ccccccccccc", published: "2024-05-02T12:00:00+00:00", updated: "2024-05-02T12:00:00+00:00" },
    ];
    serve_feed(&server, channel_feed(&server.uri(), &videos)).await;
    let db = Database::open(":memory:").await.unwrap();
    let id = subscribe(&db, &server).await;
    let locks = SubscriptionLocks::new();
    scheduler(&db, &locks)
        .fetch_and_merge(&id, Utc::now())
        .await
        .unwrap();

    // a: known to the API; b: API has nothing, page does; c: neither
    serve_api_duration(&server, "aaaaaaaaaaa", "PT1H2M3S").await;
    Mock::given(method("GET"))
        .and(path("/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"items":[]}"#))
        .mount(&server)
        .await;
    serve_watch_page(&server, "bbbbbbbbbbb", Some("PT8M11S")).await;
    serve_watch_page(&server, "ccccccccccc", None).await;

    let enricher = enricher(&server);
    assert_eq!(enricher.analyze_collection(&db, &locks).await.unwrap(), 1);

    let sub = db.find_one(&id).await.unwrap().unwrap();
    let durations: Vec<(bool, i64)> = sub.items.iter().map(|i| (i.analyzed, i.duration)).collect();
    assert_eq!(durations, [(true, 3_723), (true, 491), (true, DURATION_FAILED)]);
    assert_eq!(sub.pending_analysis(), 0);

    // Failed items are not retried
    assert_eq!(enricher.analyze_collection(&db, &locks).await.unwrap(), 0);
}

// ============================================================================
// View / Unsubscribe
// ============================================================================

#[tokio::test]
async fn test_new_items_follow_viewed_at() {
    let server = MockServer::start().await;
    let videos = [
        Video { id: "aaaaaaaaaaa", published: "2024-05-01T10:00:00+00:00", updated: "2024-05-01T10:00:00+00:00" },
        Video { id: "bbbbbbbbbbb", published: "2024-05-02T10:00:00+00:00", updated: "2024-05-02T10:00:00+00:00" },
    ];
    serve_feed(&server, channel_feed(&server.uri(), &videos)).await;
    let db = Database::open(":memory:").await.unwrap();
    let id = subscribe(&db, &server).await;
    scheduler(&db, &SubscriptionLocks::new())
        .fetch_and_merge(&id, Utc::now())
        .await
        .unwrap();

    let sub = db.find_one(&id).await.unwrap().unwrap();
    assert_eq!(sub.new_items().count(), 2);

    let seen = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    db.update_fields(&id, &[SubscriptionField::ViewedAt(Some(seen))])
        .await
        .unwrap();
    let sub = db.find_one(&id).await.unwrap().unwrap();
    let fresh: Vec<_> = sub.new_items().map(|i| i.id.as_str()).collect();
    assert_eq!(fresh, ["yt:video:bbbbbbbbbbb"]);
}

#[tokio::test]
async fn test_unsubscribe_removes_everything() {
    let server = MockServer::start().await;
    serve_feed(&server, channel_feed(&server.uri(), &[])).await;
    let db = Database::open(":memory:").await.unwrap();
    let id = subscribe(&db, &server).await;

    assert_eq!(db.delete_one(&id).await.unwrap(), 1);
    assert!(db.find_one(&id).await.unwrap().is_none());
    assert_eq!(db.delete_one(&id).await.unwrap(), 0);

    let outcome = scheduler(&db, &SubscriptionLocks::new())
        .fetch_and_merge(&id, Utc::now())
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::NotFound));
}
