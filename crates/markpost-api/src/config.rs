//! Runtime configuration, read once from the environment at startup.

use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::rate_limit::FailurePolicy;

/// Values that must never be accepted as a signing secret.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "dev-secret-change-me",
    "change-me-to-a-random-string",
    "changeme",
    "secret",
    "your-secret-key",
];

/// Ten years.
pub const MAX_TOKEN_TTL_SECS: i64 = 10 * 365 * 86_400;
/// A century.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    pub url: String,
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url == ":memory:"
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitHubConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per minute through the global bucket. 0 disables it.
    pub api_per_minute: u32,
    pub ip_per_minute: u32,
    pub ip_per_day: u32,
    pub post_key_per_minute: u32,
    pub post_key_per_day: u32,
    pub failure_policy: FailurePolicy,
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            api_per_minute: 60,
            ip_per_minute: 100,
            ip_per_day: 1000,
            post_key_per_minute: 10,
            post_key_per_day: 100,
            failure_policy: FailurePolicy::Open,
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database: DatabaseConfig,
    pub github: GitHubConfig,
    pub jwt_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub rate_limit: RateLimitConfig,
    pub title_max_bytes: usize,
    pub body_max_bytes: usize,
    pub post_retention_days: i64,
    pub cleanup_batch_size: i64,
    /// 0 disables the background sweep.
    pub cleanup_interval_secs: u64,
    pub allow_registration: bool,
}

impl Config {
    /// Builds a config with defaults for everything but the secret. Used by
    /// tests and as the base `from_lookup` overrides.
    pub fn with_secret(jwt_secret: &str) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            database: DatabaseConfig {
                kind: DatabaseKind::Sqlite,
                url: "./data/markpost.db".into(),
            },
            github: GitHubConfig::default(),
            jwt_secret: jwt_secret.to_string(),
            access_token_ttl_secs: 86_400,
            refresh_token_ttl_secs: 2_592_000,
            rate_limit: RateLimitConfig::default(),
            title_max_bytes: 1000,
            body_max_bytes: 10 * 1024 * 1024,
            post_retention_days: 7,
            cleanup_batch_size: 100,
            cleanup_interval_secs: 3600,
            allow_registration: true,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let jwt_secret = get("MARKPOST_JWT_SECRET").ok_or(ConfigError::Missing("MARKPOST_JWT_SECRET"))?;
        let mut config = Self::with_secret(&jwt_secret);

        if let Some(host) = get("MARKPOST_HOST") {
            config.host = host;
        }
        config.port = parse_or("MARKPOST_PORT", get("MARKPOST_PORT"), config.port)?;

        if let Some(kind) = get("MARKPOST_DATABASE_TYPE") {
            config.database.kind = match kind.to_ascii_lowercase().as_str() {
                "sqlite" => DatabaseKind::Sqlite,
                "postgresql" => {
                    return Err(ConfigError::invalid(
                        "MARKPOST_DATABASE_TYPE",
                        &kind,
                        "postgresql is not supported by this build",
                    ));
                }
                _ => {
                    return Err(ConfigError::invalid(
                        "MARKPOST_DATABASE_TYPE",
                        &kind,
                        "expected sqlite",
                    ));
                }
            };
        }
        if let Some(url) = get("MARKPOST_DATABASE_URL") {
            config.database.url = url;
        }

        config.github = GitHubConfig {
            client_id: get("MARKPOST_GITHUB_CLIENT_ID").unwrap_or_default(),
            client_secret: get("MARKPOST_GITHUB_CLIENT_SECRET").unwrap_or_default(),
            redirect_url: get("MARKPOST_GITHUB_REDIRECT_URL").unwrap_or_default(),
        };

        config.access_token_ttl_secs = parse_or(
            "MARKPOST_ACCESS_TOKEN_TTL_SECS",
            get("MARKPOST_ACCESS_TOKEN_TTL_SECS"),
            config.access_token_ttl_secs,
        )?;
        config.refresh_token_ttl_secs = parse_or(
            "MARKPOST_REFRESH_TOKEN_TTL_SECS",
            get("MARKPOST_REFRESH_TOKEN_TTL_SECS"),
            config.refresh_token_ttl_secs,
        )?;

        let rl = &mut config.rate_limit;
        rl.api_per_minute = parse_or("MARKPOST_API_RATE_LIMIT", get("MARKPOST_API_RATE_LIMIT"), rl.api_per_minute)?;
        rl.ip_per_minute = parse_or(
            "MARKPOST_RATE_LIMIT_IP_PER_MINUTE",
            get("MARKPOST_RATE_LIMIT_IP_PER_MINUTE"),
            rl.ip_per_minute,
        )?;
        rl.ip_per_day = parse_or(
            "MARKPOST_RATE_LIMIT_IP_PER_DAY",
            get("MARKPOST_RATE_LIMIT_IP_PER_DAY"),
            rl.ip_per_day,
        )?;
        rl.post_key_per_minute = parse_or(
            "MARKPOST_RATE_LIMIT_POST_KEY_PER_MINUTE",
            get("MARKPOST_RATE_LIMIT_POST_KEY_PER_MINUTE"),
            rl.post_key_per_minute,
        )?;
        rl.post_key_per_day = parse_or(
            "MARKPOST_RATE_LIMIT_POST_KEY_PER_DAY",
            get("MARKPOST_RATE_LIMIT_POST_KEY_PER_DAY"),
            rl.post_key_per_day,
        )?;
        if parse_bool("MARKPOST_RATE_LIMIT_FAIL_CLOSED", get("MARKPOST_RATE_LIMIT_FAIL_CLOSED"), false)? {
            rl.failure_policy = FailurePolicy::Closed;
        }
        rl.trust_forwarded_for = parse_bool(
            "MARKPOST_TRUST_FORWARDED_FOR",
            get("MARKPOST_TRUST_FORWARDED_FOR"),
            false,
        )?;

        config.title_max_bytes = parse_or(
            "MARKPOST_TITLE_MAX_BYTES",
            get("MARKPOST_TITLE_MAX_BYTES"),
            config.title_max_bytes,
        )?;
        config.body_max_bytes = parse_or(
            "MARKPOST_BODY_MAX_BYTES",
            get("MARKPOST_BODY_MAX_BYTES"),
            config.body_max_bytes,
        )?;
        config.post_retention_days = parse_or(
            "MARKPOST_POST_RETENTION_DAYS",
            get("MARKPOST_POST_RETENTION_DAYS"),
            config.post_retention_days,
        )?;
        config.cleanup_batch_size = parse_or(
            "MARKPOST_CLEANUP_BATCH_SIZE",
            get("MARKPOST_CLEANUP_BATCH_SIZE"),
            config.cleanup_batch_size,
        )?;
        config.cleanup_interval_secs = parse_or(
            "MARKPOST_CLEANUP_INTERVAL_SECS",
            get("MARKPOST_CLEANUP_INTERVAL_SECS"),
            config.cleanup_interval_secs,
        )?;
        config.allow_registration = parse_bool(
            "MARKPOST_ALLOW_REGISTRATION",
            get("MARKPOST_ALLOW_REGISTRATION"),
            config.allow_registration,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str()) {
            return Err(ConfigError::invalid(
                "MARKPOST_JWT_SECRET",
                "<redacted>",
                "placeholder secret; generate one with: openssl rand -hex 32",
            ));
        }

        validate_sqlite_url(&self.database.url)?;

        check_range(
            "MARKPOST_ACCESS_TOKEN_TTL_SECS",
            self.access_token_ttl_secs,
            MAX_TOKEN_TTL_SECS,
        )?;
        check_range(
            "MARKPOST_REFRESH_TOKEN_TTL_SECS",
            self.refresh_token_ttl_secs,
            MAX_TOKEN_TTL_SECS,
        )?;
        check_range(
            "MARKPOST_POST_RETENTION_DAYS",
            self.post_retention_days,
            MAX_RETENTION_DAYS,
        )?;
        Ok(())
    }
}

fn check_range(key: &'static str, value: i64, max: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::invalid(key, &value.to_string(), "must be positive"));
    }
    if value > max {
        return Err(ConfigError::invalid(
            key,
            &value.to_string(),
            format!("must be at most {}", max),
        ));
    }
    Ok(())
}

fn validate_sqlite_url(url: &str) -> Result<(), ConfigError> {
    const KEY: &str = "MARKPOST_DATABASE_URL";

    if url.is_empty() {
        return Err(ConfigError::Missing(KEY));
    }
    if url == ":memory:" {
        return Ok(());
    }

    let path = Path::new(url);
    let has_ext = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("sqlite3" | "sqlite" | "db")
    );
    if !has_ext {
        return Err(ConfigError::invalid(
            KEY,
            url,
            "expected :memory: or a path ending in .sqlite3, .sqlite or .db",
        ));
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.is_dir() {
            return Err(ConfigError::invalid(KEY, url, "parent directory does not exist"));
        }
    }
    Ok(())
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::invalid(key, &v, e.to_string())),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::invalid(key, other, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    const SECRET: (&str, &str) = ("MARKPOST_JWT_SECRET", "0123456789abcdef0123456789abcdef");

    #[test]
    fn defaults_apply_when_only_the_secret_is_set() {
        let config = load(&[SECRET, ("MARKPOST_DATABASE_URL", ":memory:")]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit.api_per_minute, 60);
        assert_eq!(config.rate_limit.post_key_per_day, 100);
        assert_eq!(config.rate_limit.failure_policy, FailurePolicy::Open);
        assert_eq!(config.body_max_bytes, 10_485_760);
        assert_eq!(config.post_retention_days, 7);
        assert!(config.allow_registration);
    }

    #[test]
    fn secret_is_required_and_placeholders_refused() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing("MARKPOST_JWT_SECRET"))));
        assert!(load(&[
            ("MARKPOST_JWT_SECRET", "dev-secret-change-me"),
            ("MARKPOST_DATABASE_URL", ":memory:"),
        ])
        .is_err());
    }

    #[test]
    fn database_settings_are_validated() {
        assert!(load(&[SECRET, ("MARKPOST_DATABASE_TYPE", "postgresql")]).is_err());
        assert!(load(&[SECRET, ("MARKPOST_DATABASE_TYPE", "mysql")]).is_err());
        assert!(load(&[SECRET, ("MARKPOST_DATABASE_URL", "data.txt")]).is_err());
        assert!(load(&[SECRET, ("MARKPOST_DATABASE_URL", "/no/such/dir/markpost.db")]).is_err());
        assert!(load(&[
            SECRET,
            ("MARKPOST_DATABASE_TYPE", "SQLite"),
            ("MARKPOST_DATABASE_URL", "markpost.sqlite3"),
        ])
        .is_ok());
    }

    #[test]
    fn numbers_and_flags_are_parsed_strictly() {
        let memory = ("MARKPOST_DATABASE_URL", ":memory:");
        assert!(load(&[SECRET, memory, ("MARKPOST_PORT", "eighty")]).is_err());
        assert!(load(&[SECRET, memory, ("MARKPOST_POST_RETENTION_DAYS", "0")]).is_err());
        assert!(load(&[SECRET, memory, ("MARKPOST_TRUST_FORWARDED_FOR", "maybe")]).is_err());

        let config = load(&[
            SECRET,
            memory,
            ("MARKPOST_RATE_LIMIT_FAIL_CLOSED", "true"),
            ("MARKPOST_RATE_LIMIT_IP_PER_MINUTE", "0"),
            ("MARKPOST_ALLOW_REGISTRATION", "off"),
        ])
        .unwrap();
        assert_eq!(config.rate_limit.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.rate_limit.ip_per_minute, 0);
        assert!(!config.allow_registration);
    }

    #[test]
    fn oversized_lifetimes_are_refused() {
        let memory = ("MARKPOST_DATABASE_URL", ":memory:");
        for key in ["MARKPOST_ACCESS_TOKEN_TTL_SECS", "MARKPOST_REFRESH_TOKEN_TTL_SECS"] {
            assert!(load(&[SECRET, memory, (key, "9223372036854775807")]).is_err());
            let max = MAX_TOKEN_TTL_SECS.to_string();
            assert!(load(&[SECRET, memory, (key, max.as_str())]).is_ok());
        }
        assert!(load(&[SECRET, memory, ("MARKPOST_POST_RETENTION_DAYS", "100000000")]).is_err());
        assert!(load(&[SECRET, memory, ("MARKPOST_POST_RETENTION_DAYS", "36500")]).is_ok());
    }
}
