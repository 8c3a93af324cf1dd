use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use markpost_api::config::Config;
use markpost_api::github::{ExternalIdentity, IdentityProvider, OAuthError};
use markpost_api::rate_limit::MemoryCounterStore;
use markpost_api::{AppStateInner, router};
use markpost_db::Database;

struct StubGitHub;

#[async_trait]
impl IdentityProvider for StubGitHub {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://github.com/login/oauth/authorize?client_id=test&state={}", state)
    }

    async fn exchange_code(&self, code: &str) -> Result<String, OAuthError> {
        if code == "valid-code" {
            Ok("gho_token".into())
        } else {
            Err(OAuthError::Rejected("bad_verification_code".into()))
        }
    }

    async fn fetch_identity(&self, _token: &str) -> Result<ExternalIdentity, OAuthError> {
        Ok(ExternalIdentity {
            id: 583231,
            login: "octocat".into(),
        })
    }
}

fn test_config() -> Config {
    let mut config = Config::with_secret("integration-test-secret-0123456789");
    config.database.url = ":memory:".into();
    config.rate_limit.api_per_minute = 0;
    config
}

fn app(config: &Config) -> Router {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let state = AppStateInner::new(
        config,
        db,
        Arc::new(StubGitHub),
        Arc::new(MemoryCounterStore::new()),
    );
    router(Arc::new(state))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn bearer_get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn register(app: &Router, username: &str) -> Value {
    let (status, body) = send(
        app,
        json_req(
            "POST",
            "/api/auth/register",
            json!({"username": username, "password": "password123"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    serde_json::from_str(&body).unwrap()
}

async fn post_key_for(app: &Router, access_token: &str) -> String {
    let (status, body) = send(app, bearer_get("/api/post_key", access_token)).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    v["post_key"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app(&test_config());
    let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["status"], "ok");
}

#[tokio::test]
async fn login_post_and_read_back() {
    let app = app(&test_config());
    register(&app, "alice").await;

    let (status, body) = send(
        &app,
        json_req(
            "POST",
            "/api/auth/login",
            json!({"username": "alice", "password": "password123"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(session["user"]["username"], "alice");
    let access = session["tokens"]["access_token"].as_str().unwrap();

    let key = post_key_for(&app, access).await;
    let (status, body) = send(
        &app,
        json_req("POST", &format!("/{}", key), json!({"title": "Greeting", "body": "## Hi\n\nthere"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let created: Value = serde_json::from_str(&body).unwrap();
    let id = created["id"].as_str().unwrap();

    let (status, html) = send(&app, Request::get(format!("/{}", id)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("<h2>Hi</h2>"));
    assert!(html.contains("<title>Greeting</title>"));
}

#[tokio::test]
async fn unknown_post_is_an_html_404() {
    let app = app(&test_config());
    let (status, html) = send(&app, Request::get("/doesnotexist").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(html.contains("Post not found"));
}

#[tokio::test]
async fn unknown_post_key_is_unauthorized() {
    let app = app(&test_config());
    let (status, body) = send(&app, json_req("POST", "/nokey", json!({"title": "t", "body": "b"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["error"], "unauthorized");
}

#[tokio::test]
async fn bad_login_is_401_invalid_credentials() {
    let app = app(&test_config());
    register(&app, "bob").await;
    let (status, body) = send(
        &app,
        json_req("POST", "/api/auth/login", json!({"username": "bob", "password": "nope-nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["error"], "invalid_credentials");
}

#[tokio::test]
async fn post_key_limit_returns_429_without_naming_the_dimension() {
    let mut config = test_config();
    config.rate_limit.post_key_per_minute = 2;
    let app = app(&config);

    let session = register(&app, "carol").await;
    let key = post_key_for(&app, session["tokens"]["access_token"].as_str().unwrap()).await;

    for _ in 0..2 {
        let (status, _) = send(&app, json_req("POST", &format!("/{}", key), json!({"title": "t", "body": "b"}))).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, body) = send(&app, json_req("POST", &format!("/{}", key), json!({"title": "t", "body": "b"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["error"], "rate_limited");
    assert!(!body.contains("post_key"));
    assert!(!body.contains("minute"));
}

#[tokio::test]
async fn global_limit_applies_to_every_route() {
    let mut config = test_config();
    config.rate_limit.api_per_minute = 2;
    let app = app(&config);

    for _ in 0..2 {
        let (status, _) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn listing_paginates_and_validates() {
    let app = app(&test_config());
    let session = register(&app, "dave").await;
    let access = session["tokens"]["access_token"].as_str().unwrap();
    let key = post_key_for(&app, access).await;

    for i in 0..3 {
        send(&app, json_req("POST", &format!("/{}", key), json!({"title": format!("p{}", i), "body": "b"}))).await;
    }

    let (status, body) = send(&app, bearer_get("/api/posts?page=1&limit=2", access)).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["posts"].as_array().unwrap().len(), 2);
    assert_eq!(v["pagination"]["total"], 3);
    assert_eq!(v["pagination"]["total_pages"], 2);

    let (status, _) = send(&app, bearer_get("/api/posts?limit=101", access)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Request::get("/api/posts").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_tokens_only_refresh() {
    let app = app(&test_config());
    let session = register(&app, "erin").await;
    let refresh = session["tokens"]["refresh_token"].as_str().unwrap();

    let (status, _) = send(&app, bearer_get("/api/post_key", refresh)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, json_req("POST", "/api/auth/refresh", json!({"refresh_token": refresh}))).await;
    assert_eq!(status, StatusCode::OK);
    let renewed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(renewed["user"]["username"], "erin");

    let access = session["tokens"]["access_token"].as_str().unwrap();
    let (status, _) = send(&app, json_req("POST", "/api/auth/refresh", json!({"refresh_token": access}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn change_password_swaps_credentials() {
    let app = app(&test_config());
    let session = register(&app, "frank").await;
    let access = session["tokens"]["access_token"].as_str().unwrap();

    let change = |current: &str, new: &str| {
        Request::builder()
            .method("POST")
            .uri("/api/auth/change-password")
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"current_password": current, "new_password": new}).to_string()))
            .unwrap()
    };

    let (status, body) = send(&app, change("wrong-one", "wrong-one")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("invalid_current_password"));

    let (status, body) = send(&app, change("password123", "password123")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("same_password"));

    let (status, _) = send(&app, change("password123", "newpassword456")).await;
    assert_eq!(status, StatusCode::OK);

    let login = |password: &str| {
        json_req("POST", "/api/auth/login", json!({"username": "frank", "password": password}))
    };
    assert_eq!(send(&app, login("password123")).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(send(&app, login("newpassword456")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn oauth_flow_checks_state_echo() {
    let app = app(&test_config());

    let (status, body) = send(&app, Request::get("/api/oauth/url").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    let state = v["state"].as_str().unwrap().to_string();
    assert!(v["url"].as_str().unwrap().contains(&state));

    let login = |header_state: Option<&str>, query_state: &str, code: &str| {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/oauth/login?state={}", query_state))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(s) = header_state {
            builder = builder.header("X-Oauth-State", s);
        }
        builder.body(Body::from(json!({"code": code}).to_string())).unwrap()
    };

    assert_eq!(send(&app, login(None, &state, "valid-code")).await.0, StatusCode::BAD_REQUEST);
    assert_eq!(send(&app, login(Some("other"), &state, "valid-code")).await.0, StatusCode::BAD_REQUEST);
    assert_eq!(send(&app, login(Some(&state), &state, "")).await.0, StatusCode::BAD_REQUEST);
    assert_eq!(send(&app, login(Some(&state), &state, "stale-code")).await.0, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, login(Some(&state), &state, "valid-code")).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let session: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(session["user"]["username"], "octocat");
    assert_eq!(session["user"]["github_id"], 583231);
}
