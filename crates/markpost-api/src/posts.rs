use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use markpost_db::{ContentStore, NewPost, StoreError};
use markpost_types::api::{CreatePostRequest, CreatePostResponse, Pagination, PostListResponse};
use markpost_types::models::PostSummary;

use crate::AppState;
use crate::error::{ErrorCode, ServiceError, ServiceResult, run_blocking};
use crate::keys;
use crate::middleware::AuthUser;
use crate::render;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;
const MAX_ID_ATTEMPTS: usize = 5;

pub struct PostService {
    store: Arc<dyn ContentStore>,
    title_max_bytes: usize,
    body_max_bytes: usize,
}

/// A post ready to serve.
#[derive(Debug, Clone)]
pub struct RenderedPost {
    pub title: String,
    pub html: String,
}

impl PostService {
    pub fn new(store: Arc<dyn ContentStore>, title_max_bytes: usize, body_max_bytes: usize) -> Self {
        Self {
            store,
            title_max_bytes,
            body_max_bytes,
        }
    }

    pub fn create_post(&self, user_id: i64, title: &str, body: &str) -> ServiceResult<String> {
        if title.trim().is_empty() {
            return Err(ServiceError::validation("title is required"));
        }
        if body.trim().is_empty() {
            return Err(ServiceError::validation("body is required"));
        }
        if title.len() > self.title_max_bytes {
            return Err(ServiceError::validation(format!(
                "title exceeds {} bytes",
                self.title_max_bytes
            )));
        }
        if body.len() > self.body_max_bytes {
            return Err(ServiceError::validation(format!(
                "body exceeds {} bytes",
                self.body_max_bytes
            )));
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let post = NewPost {
                id: keys::post_id(),
                title: title.to_string(),
                body: body.to_string(),
                user_id,
                created_at: Utc::now(),
            };
            match self.store.create_post(&post) {
                Ok(row) => {
                    debug!("User {} created post {}", user_id, row.id);
                    return Ok(row.id);
                }
                Err(StoreError::UniqueViolation(_)) => {
                    warn!("Post id collision on {}, retrying", post.id);
                }
                Err(e) => return Err(ServiceError::from_store("create post", e)),
            }
        }
        Err(ServiceError::internal("could not allocate a unique post id"))
    }

    pub fn render_post(&self, id: &str) -> ServiceResult<RenderedPost> {
        let post = self
            .store
            .post_by_id(id)
            .map_err(|e| ServiceError::from_store("query post", e))?;
        Ok(RenderedPost {
            html: render::post_page(&post.title, &post.body),
            title: post.title,
        })
    }

    /// `page` defaults to 1, `limit` to 10; anything out of range is a
    /// validation error rather than being clamped.
    pub fn list_posts(
        &self,
        user_id: i64,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> ServiceResult<(Vec<PostSummary>, Pagination)> {
        let page = match page {
            None => 1,
            Some(p) if p >= 1 && p <= u32::MAX as i64 => p as u32,
            Some(p) => return Err(ServiceError::validation(format!("invalid page {}", p))),
        };
        let limit = match limit {
            None => DEFAULT_PAGE_SIZE,
            Some(l) if l >= 1 && l <= MAX_PAGE_SIZE as i64 => l as u32,
            Some(l) => {
                return Err(ServiceError::validation(format!(
                    "limit must be between 1 and {}, got {}",
                    MAX_PAGE_SIZE, l
                )));
            }
        };

        let offset = u64::from(page - 1) * u64::from(limit);
        let posts = self
            .store
            .posts_by_user(user_id, limit, offset)
            .map_err(|e| ServiceError::from_store("list posts", e))?;
        let total = self
            .store
            .count_posts_by_user(user_id)
            .map_err(|e| ServiceError::from_store("count posts", e))?;

        let pagination = Pagination {
            page,
            limit,
            total,
            total_pages: total.div_ceil(u64::from(limit)),
        };
        Ok((posts.iter().map(|p| p.to_summary()).collect(), pagination))
    }
}

// -- Handlers --

pub async fn create_post(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = run_blocking(move || state.posts.create_post(user.id, &req.title, &req.body)).await?;
    Ok((StatusCode::CREATED, Json(CreatePostResponse { id })))
}

pub async fn render_post(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match run_blocking(move || state.posts.render_post(&id)).await {
        Ok(post) => Html(post.html).into_response(),
        Err(e) if e.code == ErrorCode::NotFound => {
            (StatusCode::NOT_FOUND, Html(render::not_found_page())).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_posts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let (posts, pagination) =
        run_blocking(move || state.posts.list_posts(user.id, query.page, query.limit)).await?;
    Ok(Json(PostListResponse { posts, pagination }))
}
