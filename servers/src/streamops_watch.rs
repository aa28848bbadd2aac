//! # StreamOps Watch
//!
//! Terminal operations monitor. Connects the realtime sync client, prints
//! connection changes, realtime events and notifications as they happen and,
//! with `--poll-jobs-secs`, refreshes the jobs list on an interval.
//!
//! Stops on Ctrl-C or SIGTERM, closing the socket with a normal closure.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lib_streamops::cache::{CacheChange, CacheKey, EntityKind, QueryParams};
use lib_streamops::configs::{load_config, load_dotenv, ClientConfig};
use lib_streamops::loggers::{init_tracing, LogOptions};
use lib_streamops::notifications::NotificationEvent;
use lib_streamops::SyncClient;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

mod watch_logic;
use watch_logic::{describe_event, describe_jobs, describe_notification, is_noisy};

#[derive(Parser, Debug)]
#[command(about = "StreamOps realtime operations monitor", version)]
struct Cli {
    #[command(flatten)]
    config: ClientConfig,

    #[arg(long, env = "STREAMOPS_POLL_JOBS_SECS", help = "Refresh the jobs list every N seconds.")]
    poll_jobs_secs: Option<u64>,

    #[arg(long, help = "Also print system stats frames.")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let cli = Cli::parse();
    let settings = load_config(cli.config).context("invalid configuration")?;

    let _guard = init_tracing(&LogOptions {
        app_name: "streamops_watch".to_string(),
        level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
    })?;

    let client = SyncClient::new(&settings)?;
    let mut events = client.connection().add_listener();
    let mut notifications = client.notifications().subscribe();
    let mut cache_changes = client.cache().subscribe();

    println!("watching {} (topics: {})", settings.ws_url, client.connection().topics().join(", "));
    client.connect();

    let params = QueryParams::new();
    let jobs_key = CacheKey::collection(EntityKind::Jobs, params.clone());
    let _poll = cli
        .poll_jobs_secs
        .filter(|secs| *secs > 0)
        .map(|secs| client.poll_jobs(&params, Duration::from_secs(secs)));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            event = events.recv() => match event {
                Some(event) => {
                    if cli.verbose || !is_noisy(&event) {
                        println!("{}", describe_event(&event));
                    }
                }
                None => break,
            },

            notification = notifications.recv() => match notification {
                Ok(NotificationEvent::Pushed(n)) => println!("{}", describe_notification(&n)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!("Skipped {} notifications", skipped),
                Err(RecvError::Closed) => break,
            },

            change = cache_changes.recv() => match change {
                Ok(CacheChange::Updated(key)) if key == jobs_key => {
                    match client.cache().get_as(&jobs_key) {
                        Some(page) => println!("{}", describe_jobs(&page)),
                        None => tracing::debug!("Jobs list not decodable"),
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::debug!("Skipped {} cache changes", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Ctrl-C received, initiating shutdown.");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                tracing::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
