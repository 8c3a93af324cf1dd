pub mod auth;
pub mod config;
pub mod error;
pub mod github;
pub mod keys;
pub mod middleware;
pub mod password;
pub mod posts;
pub mod rate_limit;
pub mod render;
pub mod retention;
pub mod tokens;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use markpost_db::{ContentStore, UserStore};
use markpost_types::api::HealthResponse;

use crate::auth::AuthService;
use crate::config::Config;
use crate::github::IdentityProvider;
use crate::posts::PostService;
use crate::rate_limit::{CounterStore, GlobalLimiter, RateLimitChain};
use crate::tokens::TokenService;

/// JSON and framing overhead allowed on top of the title and body limits.
const REQUEST_OVERHEAD_BYTES: usize = 64 * 1024;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub auth: Arc<AuthService>,
    pub posts: PostService,
    pub post_limits: Arc<RateLimitChain>,
    pub global_limit: Option<GlobalLimiter>,
    pub trust_forwarded_for: bool,
    pub max_request_bytes: usize,
}

impl AppStateInner {
    pub fn new<S>(
        config: &Config,
        store: Arc<S>,
        provider: Arc<dyn IdentityProvider>,
        counters: Arc<dyn CounterStore>,
    ) -> Self
    where
        S: UserStore + ContentStore + 'static,
    {
        let tokens = TokenService::new(
            &config.jwt_secret,
            config.access_token_ttl_secs,
            config.refresh_token_ttl_secs,
        );
        let users: Arc<dyn UserStore> = store.clone();
        let content: Arc<dyn ContentStore> = store;

        Self {
            auth: Arc::new(AuthService::new(
                users,
                tokens,
                provider,
                config.allow_registration,
            )),
            posts: PostService::new(content, config.title_max_bytes, config.body_max_bytes),
            post_limits: Arc::new(RateLimitChain::from_config(&config.rate_limit, counters)),
            global_limit: GlobalLimiter::per_minute(config.rate_limit.api_per_minute),
            trust_forwarded_for: config.rate_limit.trust_forwarded_for,
            max_request_bytes: config.title_max_bytes
                + config.body_max_bytes
                + REQUEST_OVERHEAD_BYTES,
        }
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        message: "markpost is running".into(),
    })
}

/// All routes, with the global limiter in front. CORS and tracing layers
/// are left to the binary.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/oauth/url", get(auth::oauth_url))
        .route("/api/oauth/login", post(auth::oauth_login))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/refresh", post(auth::refresh));

    let protected = Router::new()
        .route("/api/auth/change-password", post(auth::change_password))
        .route("/api/post_key", get(auth::post_key))
        .route("/api/posts", get(posts::list_posts))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_auth));

    // `GET /{id}` and `POST /{post_key}` share one path pattern; only the
    // POST side is limited and key-gated.
    let create = post(posts::create_post)
        .route_layer(from_fn_with_state(state.clone(), middleware::require_post_key))
        .route_layer(from_fn_with_state(state.clone(), middleware::enforce_post_limits))
        .route_layer(DefaultBodyLimit::max(state.max_request_bytes));
    let content = Router::new().route("/{key}", get(posts::render_post).merge(create));

    Router::new()
        .merge(public)
        .merge(protected)
        .merge(content)
        .layer(from_fn_with_state(state.clone(), middleware::global_limit))
        .with_state(state)
}
