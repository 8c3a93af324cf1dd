use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public view of an account. Never carries the password hash or post key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub github_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A post as listed on the owner's dashboard (no body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}
