//! Signed, expiring JWTs for the access/refresh pair.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use markpost_types::api::{Claims, TokenKind, TokenPair};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

/// Only the HMAC family is ever accepted; anything else in the header is an
/// algorithm-confusion attempt.
const ACCEPTED_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    pub fn issue(&self, user_id: i64, kind: TokenKind, ttl_secs: i64) -> ServiceResult<String> {
        self.issue_at(user_id, kind, ttl_secs, Utc::now().timestamp())
    }

    pub fn issue_at(
        &self,
        user_id: i64,
        kind: TokenKind,
        ttl_secs: i64,
        now: i64,
    ) -> ServiceResult<String> {
        let exp = now.checked_add(ttl_secs).ok_or_else(|| {
            ServiceError::internal(format!(
                "{} token lifetime of {}s overflows the expiry",
                kind.as_str(),
                ttl_secs
            ))
        })?;
        let claims = Claims {
            sub: user_id.to_string(),
            kind,
            jti: Uuid::new_v4(),
            iat: now,
            nbf: now,
            exp,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ServiceError::internal(format!("failed to sign {} token: {}", kind.as_str(), e)))
    }

    pub fn issue_pair(&self, user_id: i64) -> ServiceResult<TokenPair> {
        Ok(TokenPair {
            access_token: self.issue(user_id, TokenKind::Access, self.access_ttl_secs)?,
            refresh_token: self.issue(user_id, TokenKind::Refresh, self.refresh_ttl_secs)?,
            expires_in: self.access_ttl_secs,
        })
    }

    pub fn validate(&self, token: &str, expected: TokenKind) -> ServiceResult<Claims> {
        self.validate_at(token, expected, Utc::now().timestamp())
    }

    /// Time checks are done here against `now` rather than by the decoder,
    /// which applies its own clock and a default leeway.
    pub fn validate_at(&self, token: &str, expected: TokenKind, now: i64) -> ServiceResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = ACCEPTED_ALGORITHMS.to_vec();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| {
                debug!("token rejected: {}", e);
                ServiceError::unauthorized("invalid token")
            })?
            .claims;

        if now < claims.nbf {
            return Err(ServiceError::unauthorized("token not yet valid"));
        }
        if now > claims.exp {
            return Err(ServiceError::unauthorized("token expired"));
        }
        if claims.kind != expected {
            return Err(ServiceError::unauthorized(format!(
                "expected {} token, got {}",
                expected.as_str(),
                claims.kind.as_str()
            )));
        }
        Ok(claims)
    }

    /// Parses the numeric user id out of validated claims.
    pub fn subject(claims: &Claims) -> ServiceResult<i64> {
        claims
            .sub
            .parse()
            .map_err(|_| ServiceError::unauthorized("malformed token subject"))
    }
}
