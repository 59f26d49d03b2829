use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use reqwest::redirect::Policy;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

use tubefeed::config::Config;
use tubefeed::enrich::{Enricher, WatchPageLookup, YoutubeApiLookup};
use tubefeed::feed::{self, HttpFeedSource};
use tubefeed::storage::{
    Database, DatabaseError, FeedItem, NewSubscription, Subscription, SubscriptionField,
    EPOCH_MIN,
};
use tubefeed::sync::{FetchOutcome, Scheduler, SubscriptionLocks};

type DurationEnricher = Enricher<YoutubeApiLookup, WatchPageLookup>;

/// Get the config directory path (~/.config/tubefeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tubefeed"))
}

fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 5 {
            return attempt.error("Too many redirects (max 5)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

#[derive(Parser, Debug)]
#[command(
    name = "tubefeed",
    about = "Keeps channel and playlist feeds in sync and fills in video durations"
)]
struct Args {
    /// Config file (default: ~/.config/tubefeed/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides the config file)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Reset database (delete and recreate)
    #[arg(long, global = true)]
    reset_db: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a channel or playlist by its page link
    Subscribe {
        url: String,
        /// Refresh interval in seconds
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// Stop following a subscription and drop its history
    Unsubscribe { id: String },
    /// Change how often a subscription is refreshed
    SetInterval { id: String, secs: u64 },
    /// Record that the subscription was looked at (now, or at --at)
    MarkViewed {
        id: String,
        /// RFC 3339 timestamp
        #[arg(long, value_name = "TIME")]
        at: Option<String>,
    },
    /// List subscriptions with item and new-item counts
    List,
    /// Show the items of one subscription
    Items {
        id: String,
        /// Only items published since the last view
        #[arg(long)]
        new: bool,
    },
    /// Refresh due subscriptions once (every subscription with --all)
    CollectOnce {
        #[arg(long)]
        all: bool,
    },
    /// Run one enrichment pass
    AnalyzeOnce,
    /// Run the scheduler and the enrichment loop until Ctrl+C
    Run,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
            {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to set config directory permissions to 0700"
                );
            }
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    tracing::debug!(?config, "Effective configuration");

    let db_path = args
        .db
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("tubefeed.db"));

    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of tubefeed appears to be using the database. Please close it and try again."
            );
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let client = reqwest::Client::builder()
        .redirect(create_redirect_policy())
        .user_agent(concat!("tubefeed/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(std::time::Duration::from_secs(30))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;

    let result = dispatch(args.command, &db, client, &config).await;
    db.close().await;
    result
}

async fn dispatch(
    command: Command,
    db: &Database,
    client: reqwest::Client,
    config: &Config,
) -> Result<ExitCode> {
    match command {
        Command::Subscribe { url, interval } => {
            subscribe(db, &client, &url, interval.unwrap_or(config.default_refresh_interval_secs))
                .await
        }
        Command::Unsubscribe { id } => {
            let removed = db.delete_one(&id).await.context("Failed to delete subscription")?;
            report_found(removed, &id, "Unsubscribed")
        }
        Command::SetInterval { id, secs } => {
            let updated = db
                .update_fields(&id, &[SubscriptionField::RefreshInterval(secs)])
                .await
                .context("Failed to update interval")?;
            report_found(updated, &id, "Interval updated for")
        }
        Command::MarkViewed { id, at } => {
            let at = match at {
                Some(text) => DateTime::parse_from_rfc3339(&text)
                    .with_context(|| format!("Invalid timestamp {text:?}"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let updated = db
                .update_fields(&id, &[SubscriptionField::ViewedAt(Some(at))])
                .await
                .context("Failed to mark subscription viewed")?;
            report_found(updated, &id, "Marked viewed:")
        }
        Command::List => {
            let subs = db.find_all().await.context("Failed to load subscriptions")?;
            if subs.is_empty() {
                println!("No subscriptions yet. Add one with `tubefeed subscribe <url>`.");
            }
            for sub in &subs {
                print_subscription(sub);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Items { id, new } => {
            let Some(sub) = db.find_one(&id).await.context("Failed to load subscription")? else {
                eprintln!("No subscription with id {id}");
                return Ok(ExitCode::FAILURE);
            };
            let items: Vec<&FeedItem> = if new {
                sub.new_items().collect()
            } else {
                sub.items.iter().collect()
            };
            for item in items {
                println!(
                    "{}  {:>8}  {}\n            {}",
                    item.published_at.format("%Y-%m-%d %H:%M"),
                    format_duration(item),
                    item.title,
                    item.link
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::CollectOnce { all } => {
            let scheduler = build_scheduler(db, &client, config);
            if all {
                collect_all(&scheduler, db).await?;
            } else {
                let report = scheduler
                    .tick(Utc::now())
                    .await
                    .context("Failed to run scheduler tick")?;
                println!(
                    "{} due: {} updated, {} unchanged, {} failed, {} skipped",
                    report.due, report.updated, report.unchanged, report.failed, report.skipped
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::AnalyzeOnce => {
            let enricher = build_enricher(&client, config);
            let updated = enricher
                .analyze_collection(db, &SubscriptionLocks::new())
                .await?;
            println!("Durations stored for {updated} subscription(s)");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run => {
            run(db, &client, config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn subscribe(
    db: &Database,
    client: &reqwest::Client,
    url: &str,
    interval: u64,
) -> Result<ExitCode> {
    let details = feed::discover(client, url)
        .await
        .with_context(|| format!("Failed to resolve a feed for {url}"))?;

    let new = NewSubscription {
        id: details.id,
        source_address: details.link,
        title: details.title,
        refresh_interval_secs: interval,
    };
    match db.insert_if_absent(&new).await {
        Ok(sub) => {
            println!("Subscribed to {} ({})", sub.title, sub.id);
            Ok(ExitCode::SUCCESS)
        }
        Err(DatabaseError::AlreadyExists(id)) => {
            eprintln!("Already subscribed: {id}");
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e).context("Failed to store subscription"),
    }
}

fn report_found(count: u64, id: &str, done: &str) -> Result<ExitCode> {
    if count == 0 {
        eprintln!("No subscription with id {id}");
        return Ok(ExitCode::FAILURE);
    }
    println!("{done} {id}");
    Ok(ExitCode::SUCCESS)
}

fn build_scheduler(
    db: &Database,
    client: &reqwest::Client,
    config: &Config,
) -> Scheduler<HttpFeedSource> {
    let source = HttpFeedSource::new(client.clone()).with_timeout(config.fetch_timeout());
    Scheduler::new(db.clone(), source, SubscriptionLocks::new())
        .with_max_concurrent(config.max_concurrent_fetches)
}

fn build_enricher(client: &reqwest::Client, config: &Config) -> DurationEnricher {
    let api_key = config.api_key();
    if api_key.is_none() {
        tracing::info!("No Data API key configured, durations come from watch pages only");
    }
    Enricher::new(
        YoutubeApiLookup::new(client.clone(), api_key),
        WatchPageLookup::new(client.clone()),
    )
    .with_timeout(config.lookup_timeout())
    .with_max_concurrent(config.max_concurrent_lookups)
}

async fn collect_all(scheduler: &Scheduler<HttpFeedSource>, db: &Database) -> Result<()> {
    let subs = db.find_all().await.context("Failed to load subscriptions")?;
    for sub in subs {
        match scheduler.fetch_and_merge(&sub.id, Utc::now()).await {
            Ok(FetchOutcome::Updated { inserted, corrected }) => {
                println!("{}: {inserted} new, {corrected} corrected", sub.id)
            }
            Ok(FetchOutcome::Failed(e)) => println!("{}: failed ({e})", sub.id),
            Ok(_) => println!("{}: no change", sub.id),
            Err(e) => {
                tracing::warn!(subscription = %sub.id, error = %e, "Failed to store fetch result")
            }
        }
    }
    Ok(())
}

async fn run(db: &Database, client: &reqwest::Client, config: &Config) -> Result<()> {
    let locks = SubscriptionLocks::new();
    let source = HttpFeedSource::new(client.clone()).with_timeout(config.fetch_timeout());
    let scheduler = Arc::new(
        Scheduler::new(db.clone(), source, locks.clone())
            .with_max_concurrent(config.max_concurrent_fetches),
    );
    let enricher = Arc::new(build_enricher(client, config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown_rx.clone();
        let poll = config.poll_interval();
        tokio::spawn(async move { scheduler.run(poll, shutdown).await })
    };
    let enricher_task = {
        let enricher = Arc::clone(&enricher);
        let db = db.clone();
        let interval = config.analysis_interval();
        tokio::spawn(async move { enricher.run(db, locks, interval, shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    println!("Shutting down after the current pass...");
    // Receivers only disappear once both loops have exited
    let _ = shutdown_tx.send(true);

    for (name, task) in [("scheduler", scheduler_task), ("enrichment", enricher_task)] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "Background task panicked");
        }
    }
    Ok(())
}

fn print_subscription(sub: &Subscription) {
    let last_fetch = if sub.last_fetch_at == EPOCH_MIN {
        "never".to_string()
    } else {
        sub.last_fetch_at.format("%Y-%m-%d %H:%M").to_string()
    };
    println!(
        "{}  {}\n    {} items, {} new, {} awaiting duration, every {}s, last fetch {}",
        sub.id,
        sub.title,
        sub.items.len(),
        sub.new_items().count(),
        sub.pending_analysis(),
        sub.refresh_interval_secs,
        last_fetch
    );
}

fn format_duration(item: &FeedItem) -> String {
    if !item.analyzed {
        return "?".to_string();
    }
    if item.enrichment_failed() {
        return "n/a".to_string();
    }
    let secs = item.duration;
    let (hours, mins, secs) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}:{mins:02}:{secs:02}")
    } else {
        format!("{mins}:{secs:02}")
    }
}
