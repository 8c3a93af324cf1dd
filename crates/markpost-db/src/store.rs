use chrono::{DateTime, Utc};
use rusqlite::ffi;
use thiserror::Error;

use crate::models::{NewPost, NewUser, PostRow, UserRow};

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures a store can report. `NotFound` and the constraint variants are
/// kept apart from `Backend` so callers can map them to distinct outcomes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("referenced record does not exist")]
    ForeignKeyViolation,

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            rusqlite::Error::SqliteFailure(e, msg) => match e.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    StoreError::UniqueViolation(msg.clone().unwrap_or_default())
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => StoreError::ForeignKeyViolation,
                ffi::SQLITE_CONSTRAINT_CHECK => {
                    StoreError::Invalid(msg.clone().unwrap_or_default())
                }
                _ => StoreError::Backend(err.to_string()),
            },
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Credential store. Every lookup reports a missing row as
/// [`StoreError::NotFound`].
pub trait UserStore: Send + Sync {
    fn user_by_id(&self, id: i64) -> StoreResult<UserRow>;
    fn user_by_username(&self, username: &str) -> StoreResult<UserRow>;
    fn user_by_post_key(&self, post_key: &str) -> StoreResult<UserRow>;
    fn user_by_github_id(&self, github_id: i64) -> StoreResult<UserRow>;
    fn create_user(&self, user: &NewUser) -> StoreResult<UserRow>;
    fn update_password(
        &self,
        user_id: i64,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Content store for posts.
pub trait ContentStore: Send + Sync {
    fn create_post(&self, post: &NewPost) -> StoreResult<PostRow>;
    fn post_by_id(&self, id: &str) -> StoreResult<PostRow>;
    /// Newest first.
    fn posts_by_user(&self, user_id: i64, limit: u32, offset: u64) -> StoreResult<Vec<PostRow>>;
    fn count_posts_by_user(&self, user_id: i64) -> StoreResult<u64>;

    fn count_posts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
    /// Oldest first.
    fn posts_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<PostRow>>;
    /// Ids only, in no particular order.
    fn post_ids_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<String>>;
    /// Returns the number of rows actually removed.
    fn delete_posts(&self, ids: &[String]) -> StoreResult<usize>;
}
