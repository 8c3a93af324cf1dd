use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use markpost_api::error::run_blocking;
use markpost_api::retention::RetentionSweeper;
use markpost_db::Database;

pub struct Options {
    pub retention_days: i64,
    pub batch_size: i64,
    pub dry_run: bool,
    pub preview: Option<i64>,
}

/// One-shot sweep for the `cleanup` subcommand. Preview and dry-run only
/// read.
pub async fn run(db: Arc<Database>, options: Options) -> anyhow::Result<()> {
    let sweeper = Arc::new(RetentionSweeper::new(db));
    let days = options.retention_days;

    if let Some(limit) = options.preview {
        let posts = {
            let sweeper = sweeper.clone();
            run_blocking(move || sweeper.preview_expired(days, limit)).await?
        };
        println!(
            "{} oldest posts older than {} days:",
            posts.len(),
            options.retention_days
        );
        for post in posts {
            println!("  {}  {}  {}", post.created_at.to_rfc3339(), post.id, post.title);
        }
        return Ok(());
    }

    let expired = {
        let sweeper = sweeper.clone();
        run_blocking(move || sweeper.count_expired(days)).await?
    };
    if options.dry_run {
        println!(
            "Dry run: {} posts older than {} days would be deleted",
            expired, options.retention_days
        );
        return Ok(());
    }

    info!(
        "Deleting {} expired posts (retention {} days, batch size {})",
        expired, options.retention_days, options.batch_size
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping after the current batch...");
            on_signal.cancel();
        }
    });

    let report = sweeper
        .cleanup_expired(options.retention_days, options.batch_size, &cancel)
        .await?;
    println!(
        "Deleted {} posts in {} batches{}",
        report.deleted,
        report.batches,
        if report.cancelled { " (interrupted)" } else { "" }
    );
    Ok(())
}
