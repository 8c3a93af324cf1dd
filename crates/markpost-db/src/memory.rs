use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::models::{NewPost, NewUser, PostRow, UserRow};
use crate::store::{ContentStore, StoreError, StoreResult, UserStore};

/// In-process store with the same contract as [`crate::Database`]: unique
/// keys, the credential invariant and user references on posts are all
/// enforced. Backs service tests that have no business touching SQLite.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_user_id: i64,
    users: Vec<UserRow>,
    posts: Vec<PostRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Inner) -> StoreResult<T>,
    {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("memory store lock poisoned: {}", e)))?;
        f(&mut inner)
    }

    fn find_user<P>(&self, pred: P) -> StoreResult<UserRow>
    where
        P: Fn(&UserRow) -> bool,
    {
        self.with_inner(|inner| {
            inner
                .users
                .iter()
                .find(|u| pred(u))
                .cloned()
                .ok_or(StoreError::NotFound)
        })
    }
}

impl UserStore for MemoryStore {
    fn user_by_id(&self, id: i64) -> StoreResult<UserRow> {
        self.find_user(|u| u.id == id)
    }

    fn user_by_username(&self, username: &str) -> StoreResult<UserRow> {
        self.find_user(|u| u.username == username)
    }

    fn user_by_post_key(&self, post_key: &str) -> StoreResult<UserRow> {
        self.find_user(|u| u.post_key == post_key)
    }

    fn user_by_github_id(&self, github_id: i64) -> StoreResult<UserRow> {
        self.find_user(|u| u.github_id == Some(github_id))
    }

    fn create_user(&self, user: &NewUser) -> StoreResult<UserRow> {
        if !user.has_credential() {
            return Err(StoreError::Invalid(
                "user needs a password or an external identity".into(),
            ));
        }

        self.with_inner(|inner| {
            for existing in &inner.users {
                if existing.username == user.username {
                    return Err(StoreError::UniqueViolation("users.username".into()));
                }
                if existing.post_key == user.post_key {
                    return Err(StoreError::UniqueViolation("users.post_key".into()));
                }
                if user.github_id.is_some() && existing.github_id == user.github_id {
                    return Err(StoreError::UniqueViolation("users.github_id".into()));
                }
            }

            inner.next_user_id += 1;
            let row = UserRow {
                id: inner.next_user_id,
                username: user.username.clone(),
                password: user.password.clone(),
                post_key: user.post_key.clone(),
                github_id: user.github_id,
                password_changed_at: None,
                created_at: user.created_at,
            };
            inner.users.push(row.clone());
            Ok(row)
        })
    }

    fn update_password(
        &self,
        user_id: i64,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_inner(|inner| {
            let user = inner
                .users
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or(StoreError::NotFound)?;
            user.password = Some(password_hash.to_string());
            user.password_changed_at = Some(changed_at);
            Ok(())
        })
    }
}

impl ContentStore for MemoryStore {
    fn create_post(&self, post: &NewPost) -> StoreResult<PostRow> {
        self.with_inner(|inner| {
            if !inner.users.iter().any(|u| u.id == post.user_id) {
                return Err(StoreError::ForeignKeyViolation);
            }
            if inner.posts.iter().any(|p| p.id == post.id) {
                return Err(StoreError::UniqueViolation("posts.id".into()));
            }
            let row = PostRow {
                id: post.id.clone(),
                title: post.title.clone(),
                body: post.body.clone(),
                user_id: post.user_id,
                created_at: post.created_at,
            };
            inner.posts.push(row.clone());
            Ok(row)
        })
    }

    fn post_by_id(&self, id: &str) -> StoreResult<PostRow> {
        self.with_inner(|inner| {
            inner
                .posts
                .iter()
                .find(|p| p.id == id)
                .cloned()
                .ok_or(StoreError::NotFound)
        })
    }

    fn posts_by_user(&self, user_id: i64, limit: u32, offset: u64) -> StoreResult<Vec<PostRow>> {
        self.with_inner(|inner| {
            let mut posts: Vec<PostRow> = inner
                .posts
                .iter()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect();
            posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(posts
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        })
    }

    fn count_posts_by_user(&self, user_id: i64) -> StoreResult<u64> {
        self.with_inner(|inner| {
            Ok(inner.posts.iter().filter(|p| p.user_id == user_id).count() as u64)
        })
    }

    fn count_posts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.with_inner(|inner| {
            Ok(inner.posts.iter().filter(|p| p.created_at < cutoff).count() as u64)
        })
    }

    fn posts_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<PostRow>> {
        self.with_inner(|inner| {
            let mut posts: Vec<PostRow> = inner
                .posts
                .iter()
                .filter(|p| p.created_at < cutoff)
                .cloned()
                .collect();
            posts.sort_by_key(|p| p.created_at);
            posts.truncate(limit as usize);
            Ok(posts)
        })
    }

    fn post_ids_before(&self, cutoff: DateTime<Utc>, limit: u32) -> StoreResult<Vec<String>> {
        self.with_inner(|inner| {
            Ok(inner
                .posts
                .iter()
                .filter(|p| p.created_at < cutoff)
                .take(limit as usize)
                .map(|p| p.id.clone())
                .collect())
        })
    }

    fn delete_posts(&self, ids: &[String]) -> StoreResult<usize> {
        self.with_inner(|inner| {
            let before = inner.posts.len();
            inner.posts.retain(|p| !ids.contains(&p.id));
            Ok(before - inner.posts.len())
        })
    }
}
