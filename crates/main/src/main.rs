//! Process entrypoint. Loads configuration, wires C1–C11, starts the
//! tick/drain workers as jittered-interval tasks, and serves the HTTP
//! surface until a shutdown signal arrives.
//!
//! The teacher's own `crates/main` links a dozen protocol servers behind
//! one binary selected by Cargo features; this binary is simpler (one
//! store, one provider, one HTTP surface) so it takes plain CLI flags
//! (`clap`, same as the closest example in the pack) instead of a
//! feature matrix.

mod workers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use clap::Parser;
use extractor::{EntityExtractor, ExtractionContext, ExtractorError, ExtractedEntities, SimilarityResult};
use jt_config::Config;
use labels::{LabelReflector, LabelReflectorConfig};
use provider::{HttpProviderClient, RetryPolicy};
use ratelimit::{Capacity, RateLimiter, RateLimiterConfig};
use resolver::ProjectResolver;
use scheduler::{Scheduler, SchedulerConfig};
use store::Store;
use types::Message;
use watch::WatchCoordinator;

/// Picks between the deterministic stub and the vendor-backed extractor
/// at boot per `ai_provider` (spec §4.5 "the concrete vendor is
/// configuration, never a code path"). `Scheduler` is generic over one
/// concrete extractor type, so the choice is a enum, not a trait object.
enum SelectedExtractor {
    Stub(extractor::stub::StubEntityExtractor),
    Vendor(extractor::HttpEntityExtractor),
}

#[async_trait]
impl EntityExtractor for SelectedExtractor {
    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<ExtractedEntities, ExtractorError> {
        match self {
            SelectedExtractor::Stub(e) => e.extract(ctx).await,
            SelectedExtractor::Vendor(e) => e.extract(ctx).await,
        }
    }

    async fn compare(&self, a: &Message, b: &Message) -> Result<SimilarityResult, ExtractorError> {
        match self {
            SelectedExtractor::Stub(e) => e.compare(a, b).await,
            SelectedExtractor::Vendor(e) => e.compare(a, b).await,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "jobthread", about = "Mailbox-ingestion and project-resolution backend")]
struct Cli {
    /// Path to a TOML config file. Falls back to defaults + env vars
    /// when omitted (spec §6 "Configuration").
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run pending store migrations then exit.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env_only()?,
    };

    telemetry::init(&config.log_filter);
    tracing::info!(context = "main", event = "startup", database_url = %redact_url(&config.database_url), "Starting.");

    let store = Arc::new(Store::connect(&config.database_url).await?);
    store.migrate().await?;
    if cli.migrate_only {
        tracing::info!(context = "main", event = "migrate-only", "Migrations applied, exiting.");
        return Ok(());
    }

    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        read: Capacity { per_sec: config.rate_read_per_sec, burst: config.rate_burst },
        write: Capacity { per_sec: config.rate_write_per_sec, burst: config.rate_burst },
        ..RateLimiterConfig::default()
    }));
    let retry = RetryPolicy { max_attempts: config.queue_max_attempts, ..RetryPolicy::default() };
    let provider = Arc::new(HttpProviderClient::new("https://mail.example-provider.invalid", limiter, retry));

    let lease = StdDuration::from_secs(config.queue_lease_seconds);
    let notifications = Arc::new(queue::notification_queue(store.clone(), lease, config.queue_max_attempts));
    let ai_queue = Arc::new(queue::ai_processing_queue(store.clone(), lease, config.queue_max_attempts));

    let watch = Arc::new(WatchCoordinator::new(store.clone(), provider.clone(), notifications.clone(), config.watch_renewal_margin_min as i64));
    let resolver = Arc::new(ProjectResolver::new(store.clone(), ai_queue.clone()));
    let label_reflector = Arc::new(LabelReflector::new(store.clone(), provider.clone(), LabelReflectorConfig::default()));
    let corrections_store = Arc::new(corrections::CorrectionStore::with_min_support(store.clone(), config.learning_pattern_min_support));

    let extractor = Arc::new(build_extractor(&config));

    let scheduler_config = SchedulerConfig {
        retro_scan_slice_size: config.retro_scan_slice_size as i64,
        grouping_accuracy_alert_threshold: config.grouping_accuracy_alert_threshold,
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        provider.clone(),
        extractor,
        watch.clone(),
        notifications.clone(),
        ai_queue.clone(),
        resolver.clone(),
        label_reflector.clone(),
        corrections_store.clone(),
        scheduler_config,
    ));

    let app_state = http::AppState::new(
        store.clone(),
        provider.clone(),
        watch.clone(),
        notifications.clone(),
        ai_queue.clone(),
        resolver.clone(),
        label_reflector.clone(),
        corrections_store.clone(),
        scheduler.clone(),
        config.http_auth_token.clone(),
    );

    let worker_handles = workers::spawn_all(scheduler.clone(), &config);

    let listener = tokio::net::TcpListener::bind(&config.http_bind_addr).await?;
    tracing::info!(context = "main", event = "http-listen", addr = %config.http_bind_addr, "Serving.");
    let router = http::router(app_state);

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                tracing::error!(context = "main", event = "http-serve-error", error = %e, "HTTP server exited.");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(context = "main", event = "shutdown", "Signal received, shutting down.");
        }
    }

    for handle in worker_handles {
        handle.abort();
    }
    Ok(())
}

fn build_extractor(config: &Config) -> SelectedExtractor {
    if config.ai_provider == "deterministic-stub" {
        SelectedExtractor::Stub(extractor::stub::StubEntityExtractor::new())
    } else {
        SelectedExtractor::Vendor(extractor::HttpEntityExtractor::new(extractor::VendorConfig {
            endpoint: config.ai_provider.clone(),
            model: config.ai_model.clone(),
            timeout: StdDuration::from_millis(config.ai_timeout_ms),
        }))
    }
}

fn redact_url(url: &str) -> String {
    match url.find("://") {
        Some(idx) if url[idx + 3..].contains('@') => {
            let (scheme, rest) = url.split_at(idx + 3);
            let at = rest.find('@').unwrap();
            format!("{scheme}***@{}", &rest[at + 1..])
        }
        _ => url.to_string(),
    }
}
