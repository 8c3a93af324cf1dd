//! Batched deletion of posts older than the retention period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use markpost_db::{ContentStore, PostRow};

use crate::error::{ServiceError, ServiceResult, run_blocking};

pub const DEFAULT_BATCH_SIZE: i64 = 100;
/// Keeps one batch's `IN (...)` list well under SQLite's variable limit.
pub const MAX_BATCH_SIZE: i64 = 10_000;
pub const DEFAULT_PREVIEW_LIMIT: i64 = 10;
const DEFAULT_PAUSE: Duration = Duration::from_millis(100);

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub batches: u64,
    pub deleted: u64,
    /// Stopped early because the sweep was cancelled.
    pub cancelled: bool,
}

pub struct RetentionSweeper {
    store: Arc<dyn ContentStore>,
    pause: Duration,
}

fn cutoff(retention_days: i64) -> ServiceResult<DateTime<Utc>> {
    if retention_days <= 0 {
        return Err(ServiceError::validation(format!(
            "retention days must be positive, got {}",
            retention_days
        )));
    }
    TimeDelta::try_days(retention_days)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| {
            ServiceError::validation(format!(
                "retention of {} days reaches past the earliest representable date",
                retention_days
            ))
        })
}

/// Non-positive means the default; anything above the maximum is clamped.
fn batch_limit(batch_size: i64) -> u32 {
    let batch_size = if batch_size <= 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size.min(MAX_BATCH_SIZE)
    };
    u32::try_from(batch_size).unwrap_or(DEFAULT_BATCH_SIZE as u32)
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            pause: DEFAULT_PAUSE,
        }
    }

    /// Pause between batches, giving other writers a turn at the database.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn count_expired(&self, retention_days: i64) -> ServiceResult<u64> {
        let cutoff = cutoff(retention_days)?;
        self.store
            .count_posts_before(cutoff)
            .map_err(|e| ServiceError::from_store("count expired posts", e))
    }

    /// Oldest first. A non-positive `limit` means the default of 10.
    pub fn preview_expired(&self, retention_days: i64, limit: i64) -> ServiceResult<Vec<PostRow>> {
        let cutoff = cutoff(retention_days)?;
        let limit = if limit <= 0 { DEFAULT_PREVIEW_LIMIT } else { limit };
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        self.store
            .posts_before(cutoff, limit)
            .map_err(|e| ServiceError::from_store("preview expired posts", e))
    }

    /// Deletes everything older than the cutoff in batches of `batch_size`.
    ///
    /// The cutoff is fixed when the sweep starts, so posts ageing past it
    /// mid-sweep wait for the next one. The sweep ends when a batch comes
    /// back empty or short, or when `cancel` fires during a pause.
    pub async fn cleanup_expired(
        &self,
        retention_days: i64,
        batch_size: i64,
        cancel: &CancellationToken,
    ) -> ServiceResult<SweepReport> {
        let cutoff = cutoff(retention_days)?;
        let batch = batch_limit(batch_size);

        let mut report = SweepReport::default();
        loop {
            let store = self.store.clone();
            let ids = run_blocking(move || {
                store
                    .post_ids_before(cutoff, batch)
                    .map_err(|e| ServiceError::from_store("select expired posts", e))
            })
            .await?;
            if ids.is_empty() {
                break;
            }

            let store = self.store.clone();
            let deleted = run_blocking(move || {
                store
                    .delete_posts(&ids)
                    .map_err(|e| ServiceError::from_store("delete expired posts", e))
            })
            .await?;
            report.batches += 1;
            report.deleted += deleted as u64;
            debug!("Retention batch {}: deleted {} posts", report.batches, deleted);

            if deleted < batch as usize {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.pause) => {}
                _ = cancel.cancelled() => {
                    warn!("Retention sweep cancelled after {} posts", report.deleted);
                    report.cancelled = true;
                    break;
                }
            }
        }

        Ok(report)
    }
}

/// Background task that sweeps on an interval until `shutdown` fires.
pub async fn run_sweep_loop(
    sweeper: Arc<RetentionSweeper>,
    retention_days: i64,
    batch_size: i64,
    interval_secs: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                debug!("Retention sweep loop stopped");
                return;
            }
        }

        match sweeper.cleanup_expired(retention_days, batch_size, &shutdown).await {
            Ok(report) => {
                if report.deleted > 0 {
                    info!(
                        "Cleanup: deleted {} expired posts in {} batches",
                        report.deleted, report.batches
                    );
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use markpost_db::{MemoryStore, NewPost, NewUser, UserStore};

    use super::*;
    use crate::error::ErrorCode;

    fn seed(store: &MemoryStore, ages_in_days: &[i64]) -> Vec<String> {
        let user = store
            .create_user(&NewUser::with_password("owner", "hash", "pk"))
            .unwrap();
        ages_in_days
            .iter()
            .enumerate()
            .map(|(i, days)| {
                let post = NewPost {
                    id: format!("post-{}", i),
                    title: format!("t{}", i),
                    body: "b".into(),
                    user_id: user.id,
                    created_at: Utc::now() - ChronoDuration::days(*days),
                };
                store.create_post(&post).unwrap().id
            })
            .collect()
    }

    fn sweeper(store: Arc<MemoryStore>) -> RetentionSweeper {
        RetentionSweeper::new(store).with_pause(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn batch_of_one_clears_old_posts_and_keeps_new() {
        let store = Arc::new(MemoryStore::new());
        let ids = seed(&store, &[10, 9, 1]);
        let sweeper = sweeper(store.clone());

        let report = sweeper
            .cleanup_expired(7, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.deleted, 2);
        assert!(!report.cancelled);

        assert!(store.post_by_id(&ids[0]).is_err());
        assert!(store.post_by_id(&ids[1]).is_err());
        assert!(store.post_by_id(&ids[2]).is_ok());
        assert_eq!(sweeper.count_expired(7).unwrap(), 0);
    }

    #[test]
    fn preview_returns_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let ids = seed(&store, &[8, 20, 9, 30]);
        let sweeper = sweeper(store);

        let preview = sweeper.preview_expired(7, 2).unwrap();
        let got: Vec<&str> = preview.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(got, vec![ids[3].as_str(), ids[1].as_str()]);

        assert_eq!(sweeper.count_expired(7).unwrap(), 4);
        assert_eq!(sweeper.preview_expired(7, 0).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn non_positive_arguments() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[10, 10, 10]);
        let sweeper = sweeper(store);
        let cancel = CancellationToken::new();

        assert_eq!(
            sweeper.cleanup_expired(0, 10, &cancel).await.unwrap_err().code,
            ErrorCode::Validation
        );
        assert_eq!(sweeper.count_expired(-1).unwrap_err().code, ErrorCode::Validation);

        // Zero batch size falls back to the default and finishes in one batch.
        let report = sweeper.cleanup_expired(7, 0, &cancel).await.unwrap();
        assert_eq!(report, SweepReport { batches: 1, deleted: 3, cancelled: false });
    }

    #[test]
    fn retention_past_the_calendar_is_a_validation_error() {
        let sweeper = sweeper(Arc::new(MemoryStore::new()));
        assert_eq!(
            sweeper.count_expired(100_000_000).unwrap_err().code,
            ErrorCode::Validation
        );
        assert_eq!(
            sweeper.preview_expired(i64::MAX, 5).unwrap_err().code,
            ErrorCode::Validation
        );
        assert_eq!(sweeper.count_expired(36_500).unwrap(), 0);
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(batch_limit(0), DEFAULT_BATCH_SIZE as u32);
        assert_eq!(batch_limit(-5), DEFAULT_BATCH_SIZE as u32);
        assert_eq!(batch_limit(250), 250);
        assert_eq!(batch_limit(40_000), MAX_BATCH_SIZE as u32);
        assert_eq!(batch_limit(i64::MAX), MAX_BATCH_SIZE as u32);
    }

    #[tokio::test]
    async fn huge_batch_size_still_sweeps() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[10, 12, 1]);
        let sweeper = sweeper(store);

        let report = sweeper
            .cleanup_expired(7, i64::MAX, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, SweepReport { batches: 1, deleted: 2, cancelled: false });
    }

    #[tokio::test]
    async fn cancellation_stops_between_batches() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[10, 10, 10, 10]);
        let sweeper = RetentionSweeper::new(store.clone()).with_pause(Duration::from_secs(60));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = sweeper.cleanup_expired(7, 1, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.deleted, 1);
        assert_eq!(store.count_posts_before(Utc::now()).unwrap(), 3);
    }
}
