use std::{process, sync::Arc};

use recall::{
    CacheError, PersistenceManager, RequestFingerprint, SerialisationManager, StoreError,
    clock::SystemClock,
    config::{self, Command, LoadError, Settings},
    persistence::CacheStats,
    store,
    telemetry::{self, TelemetryError},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("failed to open cache store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &CliError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "recall failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "recall failed");
    });
}

async fn run() -> Result<(), CliError> {
    let (cli_args, settings) = config::load_with_cli()?;
    let command = cli_args.command.unwrap_or(Command::Stats);

    telemetry::init(&settings.logging)?;
    let persistence = open_persistence(&settings).await?;

    match command {
        Command::Stats => {
            print_stats(&persistence.stats().await?);
        }
        Command::Clear(args) => {
            let removed = persistence
                .clear_cache(args.type_name.as_deref(), args.stale_only)
                .await?;
            println!("removed {removed} entries");
        }
        Command::Invalidate(args) => {
            let fingerprint = RequestFingerprint::for_request(
                &args.method,
                &args.url,
                args.body.as_deref().map(str::as_bytes),
                &args.type_name,
            );
            if persistence.invalidate(&fingerprint).await? {
                println!("invalidated {fingerprint}");
            } else {
                println!("no entry for {fingerprint}");
            }
        }
        Command::PurgeStale => {
            let removed = persistence.clear_cache(None, true).await?;
            println!("purged {removed} expired entries");
        }
    }

    Ok(())
}

async fn open_persistence(settings: &Settings) -> Result<PersistenceManager, CliError> {
    let store = store::open(&settings.store).await?;
    info!(backend = store.backend(), "Opened cache store");

    let serialiser = SerialisationManager::new()
        .with_compression_level(settings.cache.compression_level)
        .with_type_header(settings.store.embeds_type_header())
        .with_required_encryption(settings.cache.require_encryption);

    Ok(PersistenceManager::new(
        store,
        serialiser,
        settings.cache.clone(),
        Arc::new(SystemClock),
    ))
}

fn print_stats(stats: &CacheStats) {
    println!("entries:    {}", stats.entries);
    println!("stale:      {}", stats.stale);
    println!("encrypted:  {}", stats.encrypted);
    println!("compressed: {}", stats.compressed);
    println!("bytes:      {}", stats.payload_bytes);
    for (type_hash, count) in &stats.by_type {
        println!("  {type_hash}  {count}");
    }
}
