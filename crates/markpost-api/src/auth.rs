use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use markpost_db::{NewUser, StoreError, UserRow, UserStore};
use markpost_types::api::{
    AuthResponse, ChangePasswordRequest, Claims, LoginRequest, MessageResponse, OAuthLoginRequest,
    OAuthUrlResponse, PostKeyResponse, RefreshRequest, RegisterRequest, TokenKind,
};

use crate::AppState;
use crate::error::{ErrorCode, ServiceError, ServiceResult, run_blocking};
use crate::github::{ExternalIdentity, IdentityProvider, OAuthError};
use crate::keys;
use crate::middleware::AuthUser;
use crate::password;
use crate::tokens::TokenService;

pub const OAUTH_STATE_HEADER: &str = "x-oauth-state";

const MIN_PASSWORD_LEN: usize = 8;
const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=32;
/// Attempts at a free username / post key before giving up.
const MAX_CREATE_ATTEMPTS: usize = 20;

pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: TokenService,
    provider: Arc<dyn IdentityProvider>,
    allow_registration: bool,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        tokens: TokenService,
        provider: Arc<dyn IdentityProvider>,
        allow_registration: bool,
    ) -> Self {
        Self {
            users,
            tokens,
            provider,
            allow_registration,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// The state is not kept server-side; the caller echoes it back in a
    /// header and the login handler compares the two.
    pub fn github_auth_url(&self) -> (String, String) {
        let state = keys::oauth_state();
        (self.provider.authorize_url(&state), state)
    }

    pub async fn login_with_github(self: &Arc<Self>, code: &str) -> ServiceResult<AuthResponse> {
        let access_token = self.provider.exchange_code(code).await.map_err(oauth_failure)?;
        let identity = self
            .provider
            .fetch_identity(&access_token)
            .await
            .map_err(oauth_failure)?;
        if !identity.is_valid() {
            return Err(ServiceError::unauthorized("provider returned an empty identity"));
        }

        let this = self.clone();
        run_blocking(move || this.login_with_identity(&identity)).await
    }

    /// Finds the account linked to `identity`, creating it on first login.
    pub fn login_with_identity(&self, identity: &ExternalIdentity) -> ServiceResult<AuthResponse> {
        let user = match self.users.user_by_github_id(identity.id) {
            Ok(user) => user,
            Err(StoreError::NotFound) => self.create_github_user(identity)?,
            Err(e) => return Err(ServiceError::from_store("query user by github id", e)),
        };
        self.session(user)
    }

    fn create_github_user(&self, identity: &ExternalIdentity) -> ServiceResult<UserRow> {
        let mut suffix = 1;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let username = if suffix == 1 {
                identity.login.clone()
            } else {
                format!("{}-{}", identity.login, suffix)
            };

            match self
                .users
                .create_user(&NewUser::from_github(&username, identity.id, &keys::post_key()))
            {
                Ok(user) => {
                    info!("Created user {} for GitHub account {}", user.username, identity.id);
                    return Ok(user);
                }
                Err(StoreError::UniqueViolation(what)) if what.contains("username") => suffix += 1,
                Err(StoreError::UniqueViolation(what)) if what.contains("github_id") => {
                    // Lost a race with a concurrent first login.
                    return self
                        .users
                        .user_by_github_id(identity.id)
                        .map_err(|e| ServiceError::from_store("query user by github id", e));
                }
                Err(StoreError::UniqueViolation(_)) => continue,
                Err(e) => return Err(ServiceError::from_store("create github user", e)),
            }
        }
        Err(ServiceError::internal(format!(
            "no free username for GitHub login {}",
            identity.login
        )))
    }

    /// Unknown user, an OAuth-only account and a wrong password all look the
    /// same to the caller.
    pub fn login_with_password(&self, username: &str, password: &str) -> ServiceResult<AuthResponse> {
        let invalid = || ServiceError::new(ErrorCode::InvalidCredentials, "invalid credentials");

        let user = match self.users.user_by_username(username) {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(invalid()),
            Err(e) => return Err(ServiceError::from_store("query user by username", e)),
        };
        let Some(hash) = user.password.as_deref() else {
            return Err(invalid());
        };
        if !password::verify(password, hash)? {
            return Err(invalid());
        }
        self.session(user)
    }

    pub fn register(&self, username: &str, password: &str) -> ServiceResult<AuthResponse> {
        if !self.allow_registration {
            return Err(ServiceError::unauthorized("registration is disabled"));
        }
        validate_username(username)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ServiceError::validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let hash = password::hash(password)?;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            match self
                .users
                .create_user(&NewUser::with_password(username, &hash, &keys::post_key()))
            {
                Ok(user) => {
                    info!("Registered user {}", user.username);
                    return self.session(user);
                }
                Err(StoreError::UniqueViolation(what)) if what.contains("post_key") => continue,
                Err(StoreError::UniqueViolation(_)) => {
                    return Err(ServiceError::new(ErrorCode::Conflict, "username already taken"));
                }
                Err(e) => return Err(ServiceError::from_store("create user", e)),
            }
        }
        Err(ServiceError::internal("could not allocate a unique post key"))
    }

    pub fn refresh_token(&self, refresh_token: &str) -> ServiceResult<AuthResponse> {
        let claims = self.tokens.validate(refresh_token, TokenKind::Refresh)?;
        let user = self.user_for_claims(&claims)?;
        self.session(user)
    }

    /// The current password is checked before the new one is compared to it.
    pub fn change_password(&self, user_id: i64, current: &str, new: &str) -> ServiceResult<()> {
        let user = self
            .users
            .user_by_id(user_id)
            .map_err(|e| ServiceError::from_store("query user", e))?;

        let current_ok = match user.password.as_deref() {
            Some(hash) => password::verify(current, hash)?,
            None => false,
        };
        if !current_ok {
            return Err(ServiceError::new(
                ErrorCode::InvalidCurrentPassword,
                "current password mismatch",
            ));
        }
        if new == current {
            return Err(ServiceError::new(ErrorCode::SamePassword, "new password equals current"));
        }
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Err(ServiceError::validation(format!(
                "new password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let hash = password::hash(new)?;
        self.users
            .update_password(user_id, &hash, Utc::now())
            .map_err(|e| ServiceError::from_store("update password", e))?;
        info!("User {} changed their password", user.username);
        Ok(())
    }

    pub fn query_post_key(&self, user_id: i64) -> ServiceResult<PostKeyResponse> {
        let user = self
            .users
            .user_by_id(user_id)
            .map_err(|e| ServiceError::from_store("query post key", e))?;
        Ok(PostKeyResponse {
            post_key: user.post_key,
            created_at: user.created_at,
        })
    }

    /// Resolves a bearer access token to its user.
    pub fn authenticate(&self, access_token: &str) -> ServiceResult<UserRow> {
        let claims = self.tokens.validate(access_token, TokenKind::Access)?;
        self.user_for_claims(&claims)
    }

    pub fn authenticate_post_key(&self, post_key: &str) -> ServiceResult<UserRow> {
        match self.users.user_by_post_key(post_key) {
            Ok(user) => Ok(user),
            Err(StoreError::NotFound) => Err(ServiceError::unauthorized("unknown post key")),
            Err(e) => Err(ServiceError::from_store("query user by post key", e)),
        }
    }

    /// Missing users and tokens minted before the last password change are
    /// both unauthorized.
    fn user_for_claims(&self, claims: &Claims) -> ServiceResult<UserRow> {
        let user_id = TokenService::subject(claims)?;
        let user = match self.users.user_by_id(user_id) {
            Ok(user) => user,
            Err(StoreError::NotFound) => {
                return Err(ServiceError::unauthorized("token subject no longer exists"));
            }
            Err(e) => return Err(ServiceError::from_store("query user", e)),
        };

        if let Some(changed_at) = user.password_changed_at {
            if claims.iat < changed_at.timestamp() {
                return Err(ServiceError::unauthorized("token predates password change"));
            }
        }
        Ok(user)
    }

    fn session(&self, user: UserRow) -> ServiceResult<AuthResponse> {
        let tokens = self.tokens.issue_pair(user.id)?;
        Ok(AuthResponse {
            user: user.to_public(),
            tokens,
        })
    }
}

fn validate_username(username: &str) -> ServiceResult<()> {
    if !USERNAME_LEN.contains(&username.len()) {
        return Err(ServiceError::validation("username must be 3 to 32 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ServiceError::validation(
            "username may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

fn oauth_failure(err: OAuthError) -> ServiceError {
    match err {
        OAuthError::Rejected(msg) => {
            warn!("GitHub rejected login: {}", msg);
            ServiceError::unauthorized("oauth code rejected")
        }
        OAuthError::InvalidIdentity(msg) => {
            warn!("GitHub returned an unusable identity: {}", msg);
            ServiceError::unauthorized("invalid external identity")
        }
        OAuthError::Transport(msg) => ServiceError::internal(format!("github: {}", msg)),
    }
}

// -- Handlers --

#[derive(Debug, Deserialize)]
pub struct OAuthStateQuery {
    pub state: Option<String>,
}

pub async fn oauth_url(State(state): State<AppState>) -> Json<OAuthUrlResponse> {
    let (url, oauth_state) = state.auth.github_auth_url();
    Json(OAuthUrlResponse {
        url,
        state: oauth_state,
    })
}

pub async fn oauth_login(
    State(state): State<AppState>,
    Query(query): Query<OAuthStateQuery>,
    headers: HeaderMap,
    Json(req): Json<OAuthLoginRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let header_state = headers
        .get(OAUTH_STATE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::validation("missing X-Oauth-State header"))?;
    let query_state = query
        .state
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::validation("missing state parameter"))?;
    if header_state != query_state {
        return Err(ServiceError::validation("oauth state mismatch"));
    }
    if req.code.trim().is_empty() {
        return Err(ServiceError::validation("missing authorization code"));
    }

    let session = state.auth.login_with_github(&req.code).await?;
    Ok(Json(session))
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = run_blocking(move || state.auth.register(&req.username, &req.password)).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session =
        run_blocking(move || state.auth.login_with_password(&req.username, &req.password)).await?;
    Ok(Json(session))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = run_blocking(move || state.auth.refresh_token(&req.refresh_token)).await?;
    Ok(Json(session))
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    run_blocking(move || {
        state
            .auth
            .change_password(user.id, &req.current_password, &req.new_password)
    })
    .await?;
    Ok(Json(MessageResponse {
        message: "Password changed".into(),
    }))
}

pub async fn post_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, ServiceError> {
    let key = run_blocking(move || state.auth.query_post_key(user.id)).await?;
    Ok(Json(key))
}
