use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

use crate::Database;
use crate::models::{NewPost, NewUser, PostRow, UserRow};
use crate::store::{ContentStore, StoreError, StoreResult, UserStore};

const USER_COLUMNS: &str =
    "id, username, password, post_key, github_id, password_changed_at, created_at";
const POST_COLUMNS: &str = "id, title, body, user_id, created_at";

impl UserStore for Database {
    fn user_by_id(&self, id: i64) -> StoreResult<UserRow> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    fn user_by_username(&self, username: &str) -> StoreResult<UserRow> {
        self.with_conn(|conn| query_user(conn, "username = ?1", username))
    }

    fn user_by_post_key(&self, post_key: &str) -> StoreResult<UserRow> {
        self.with_conn(|conn| query_user(conn, "post_key = ?1", post_key))
    }

    fn user_by_github_id(&self, github_id: i64) -> StoreResult<UserRow> {
        self.with_conn(|conn| query_user(conn, "github_id = ?1", github_id))
    }

    fn create_user(&self, user: &NewUser) -> StoreResult<UserRow> {
        if !user.has_credential() {
            return Err(StoreError::Invalid(
                "user needs a password or an external identity".into(),
            ));
        }

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password, post_key, github_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    &user.username,
                    &user.password,
                    &user.post_key,
                    user.github_id,
                    user.created_at,
                ],
            )?;

            Ok(UserRow {
                id: conn.last_insert_rowid(),
                username: user.username.clone(),
                password: user.password.clone(),
                post_key: user.post_key.clone(),
                github_id: user.github_id,
                password_changed_at: None,
                created_at: user.created_at,
            })
        })
    }

    fn update_password(
        &self,
        user_id: i64,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET password = ?1, password_changed_at = ?2 WHERE id = ?3",
                rusqlite::params![password_hash, changed_at, user_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }
}

impl ContentStore for Database {
    fn create_post(&self, post: &NewPost) -> StoreResult<PostRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, title, body, user_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![&post.id, &post.title, &post.body, post.user_id, post.created_at],
            )?;
            Ok(PostRow {
                id: post.id.clone(),
                title: post.title.clone(),
                body: post.body.clone(),
                user_id: post.user_id,
                created_at: post.created_at,
            })
        })
    }

    fn post_by_id(&self, id: &str) -> StoreResult<PostRow> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS);
            let row = conn.query_row(&sql, [id], post_from_row)?;
            Ok(row)
        })
    }

    fn posts_by_user(&self, user_id: i64, limit: u32, offset: u64) -> StoreResult<Vec<PostRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM posts WHERE user_id = ?1
                 ORDER BY created_at DESC, id
                 LIMIT ?2 OFFSET ?3",
                POST_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset as i64], post_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn count_posts_by_user(&self, user_id: i64) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM posts WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn count_posts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM posts WHERE created_at < ?1",
                [cutoff],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn posts_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<PostRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM posts WHERE created_at < ?1 ORDER BY created_at ASC LIMIT ?2",
                POST_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![cutoff, limit], post_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn post_ids_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM posts WHERE created_at < ?1 LIMIT ?2")?;
            let ids = stmt
                .query_map(rusqlite::params![cutoff, limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn delete_posts(&self, ids: &[String]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!("DELETE FROM posts WHERE id IN ({})", placeholders.join(", "));
            let deleted = conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
            Ok(deleted)
        })
    }
}

fn query_user<P: rusqlite::ToSql>(conn: &Connection, filter: &str, value: P) -> StoreResult<UserRow> {
    let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, filter);
    let row = conn.query_row(&sql, [value], user_from_row)?;
    Ok(row)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        post_key: row.get(3)?,
        github_id: row.get(4)?,
        password_changed_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}
