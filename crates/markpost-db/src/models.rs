//! Row types. These map directly to SQLite rows and are distinct from the
//! markpost-types API models so the DB layer stays independent.

use chrono::{DateTime, Utc};
use markpost_types::models::{PostSummary, User};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    /// Argon2 PHC string. `None` for accounts created through GitHub.
    pub password: Option<String>,
    pub post_key: String,
    pub github_id: Option<i64>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    pub fn to_public(&self) -> User {
        User {
            id: self.id,
            username: self.username.clone(),
            github_id: self.github_id,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password: Option<String>,
    pub post_key: String,
    pub github_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl NewUser {
    pub fn with_password(username: &str, password_hash: &str, post_key: &str) -> Self {
        Self {
            username: username.to_string(),
            password: Some(password_hash.to_string()),
            post_key: post_key.to_string(),
            github_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn from_github(username: &str, github_id: i64, post_key: &str) -> Self {
        Self {
            username: username.to_string(),
            password: None,
            post_key: post_key.to_string(),
            github_id: Some(github_id),
            created_at: Utc::now(),
        }
    }

    /// An account needs at least one way to log in.
    pub fn has_credential(&self) -> bool {
        self.password.is_some() || self.github_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PostRow {
    pub id: String,
    pub title: String,
    pub body: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

impl PostRow {
    pub fn to_summary(&self) -> PostSummary {
        PostSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: String,
    pub title: String,
    pub body: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}
