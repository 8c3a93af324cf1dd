mod cleanup;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use markpost_api::config::{Config, DatabaseConfig};
use markpost_api::github::GitHubProvider;
use markpost_api::rate_limit::{self, MemoryCounterStore};
use markpost_api::retention::{self, RetentionSweeper};
use markpost_api::{AppStateInner, router};
use markpost_db::Database;

/// How often closed rate-limit windows are dropped.
const LIMITER_PURGE_INTERVAL_SECS: u64 = 600;

/// Markdown pastebin server.
#[derive(Parser)]
#[command(name = "markpost", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Delete posts older than the retention period and exit.
    Cleanup {
        /// Posts deleted per batch. Defaults to MARKPOST_CLEANUP_BATCH_SIZE.
        #[arg(long)]
        batch_size: Option<i64>,
        /// Only report how many posts would be deleted.
        #[arg(long)]
        dry_run: bool,
        /// List up to N of the oldest expired posts instead of deleting.
        #[arg(long, value_name = "N")]
        preview: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "markpost=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    let db = Arc::new(open_database(&config.database)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db).await,
        Command::Cleanup {
            batch_size,
            dry_run,
            preview,
        } => {
            let options = cleanup::Options {
                retention_days: config.post_retention_days,
                batch_size: batch_size.unwrap_or(config.cleanup_batch_size),
                dry_run,
                preview,
            };
            cleanup::run(db, options).await
        }
    }
}

fn open_database(database: &DatabaseConfig) -> anyhow::Result<Database> {
    let db = if database.is_in_memory() {
        warn!("Using an in-memory database; posts are lost on restart");
        Database::open_in_memory()?
    } else {
        Database::open(Path::new(&database.url))?
    };
    Ok(db)
}

async fn serve(config: Config, db: Arc<Database>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let provider = Arc::new(GitHubProvider::new(&config.github));
    if config.github.client_id.is_empty() {
        warn!("MARKPOST_GITHUB_CLIENT_ID is not set; GitHub login will fail");
    }

    let state = Arc::new(AppStateInner::new(
        &config,
        db.clone(),
        provider,
        Arc::new(MemoryCounterStore::new()),
    ));

    // Background tasks
    tokio::spawn(rate_limit::run_purge_loop(
        state.post_limits.clone(),
        LIMITER_PURGE_INTERVAL_SECS,
        shutdown.clone(),
    ));
    if config.cleanup_interval_secs > 0 {
        let sweeper = Arc::new(RetentionSweeper::new(db));
        tokio::spawn(retention::run_sweep_loop(
            sweeper,
            config.post_retention_days,
            config.cleanup_batch_size,
            config.cleanup_interval_secs,
            shutdown.clone(),
        ));
    } else {
        info!("Background cleanup disabled");
    }

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Markpost listening on {}", addr);
    info!(
        "Retention: {} days, limits: api {}/min, ip {}/min {}/day, post key {}/min {}/day, policy {:?}",
        config.post_retention_days,
        config.rate_limit.api_per_minute,
        config.rate_limit.ip_per_minute,
        config.rate_limit.ip_per_day,
        config.rate_limit.post_key_per_minute,
        config.rate_limit.post_key_per_day,
        config.rate_limit.failure_policy,
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let signal_token = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        signal_token.cancel();
    })
    .await?;

    shutdown.cancel();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
