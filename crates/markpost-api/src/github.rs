//! GitHub OAuth code exchange and identity lookup.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::GitHubConfig;

const GITHUB_AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "markpost";

#[derive(Debug, Error)]
pub enum OAuthError {
    /// The provider refused the code or token.
    #[error("rejected by provider: {0}")]
    Rejected(String),

    /// Network failure or a provider fault unrelated to the caller's input.
    #[error("provider unreachable: {0}")]
    Transport(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

/// A user as the external provider knows them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExternalIdentity {
    pub id: i64,
    pub login: String,
}

impl ExternalIdentity {
    pub fn is_valid(&self) -> bool {
        self.id != 0 && !self.login.trim().is_empty()
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorize_url(&self, state: &str) -> String;
    /// Trades an authorization code for a provider access token.
    async fn exchange_code(&self, code: &str) -> Result<String, OAuthError>;
    async fn fetch_identity(&self, access_token: &str) -> Result<ExternalIdentity, OAuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct GitHubProvider {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    authorize_endpoint: String,
    token_endpoint: String,
    api_base: String,
}

impl GitHubProvider {
    pub fn new(config: &GitHubConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_url: config.redirect_url.clone(),
            authorize_endpoint: GITHUB_AUTH_URL.to_string(),
            token_endpoint: GITHUB_TOKEN_URL.to_string(),
            api_base: GITHUB_API_URL.to_string(),
        }
    }

    /// Points token exchange and the user API at another host. Only the
    /// authorize URL keeps pointing at github.com.
    pub fn with_endpoints(mut self, token_endpoint: &str, api_base: &str) -> Self {
        self.token_endpoint = token_endpoint.to_string();
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

fn classify_status(status: StatusCode, body: String) -> OAuthError {
    if status.is_client_error() {
        OAuthError::Rejected(format!("{}: {}", status, body))
    } else {
        OAuthError::Transport(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    fn authorize_url(&self, state: &str) -> String {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_url.as_str()),
            ("scope", "read:user"),
            ("state", state),
        ];
        match Url::parse_with_params(&self.authorize_endpoint, &params) {
            Ok(url) => url.to_string(),
            Err(e) => {
                error!("Failed to build GitHub authorize URL: {}", e);
                self.authorize_endpoint.clone()
            }
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<String, OAuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_url.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_endpoint)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::Transport(format!("token exchange request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::Transport(format!("unreadable token response: {}", e)))?;

        // GitHub answers 200 with an `error` field for bad codes.
        if let Some(err) = token.error {
            debug!("GitHub rejected code: {}", err);
            return Err(OAuthError::Rejected(format!(
                "{}: {}",
                err,
                token.error_description.unwrap_or_default()
            )));
        }

        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OAuthError::Rejected("no access token in response".into()))
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<ExternalIdentity, OAuthError> {
        let response = self
            .client
            .get(format!("{}/user", self.api_base))
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| OAuthError::Transport(format!("user request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let identity: ExternalIdentity = response
            .json()
            .await
            .map_err(|e| OAuthError::InvalidIdentity(format!("unreadable user response: {}", e)))?;

        if !identity.is_valid() {
            return Err(OAuthError::InvalidIdentity(format!(
                "id={} login={:?}",
                identity.id, identity.login
            )));
        }
        Ok(identity)
    }
}
