//! Bearer-token validation and the per-connection identity it yields.
//!
//! Tokens are JWTs signed by the configured issuer. Successful
//! validations are cached keyed by token hash so hot callers skip
//! signature checks; the cache TTL never exceeds half the remaining
//! token lifetime.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use homelink_proto::ErrorCode;

/// Service tier derived from the token; governs session and rate caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Free,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    /// Maximum concurrent agent sessions for this tier.
    pub fn session_cap(&self) -> usize {
        match self {
            Self::Free => 1,
            Self::Premium => 3,
            Self::Enterprise => 10,
        }
    }

    fn from_claim(claim: &str) -> Self {
        match claim {
            "enterprise" => Self::Enterprise,
            "premium" => Self::Premium,
            _ => Self::Free,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller, cached for the lifetime of a connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub tier: Tier,
    /// Token expiry, unix seconds.
    pub expires_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Missing => ErrorCode::TokenMissing,
            Self::Invalid(_) => ErrorCode::TokenInvalid,
            Self::Expired => ErrorCode::TokenExpired,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
    #[serde(rename = "https://homelink/tier")]
    tier_ns: Option<String>,
    #[serde(default)]
    tier: Option<String>,
}

struct CachedIdentity {
    identity: Identity,
    valid_until: Instant,
}

pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    cache: DashMap<[u8; 32], CachedIdentity>,
    max_cache_ttl: Duration,
}

impl TokenValidator {
    pub fn new(
        secret: &str,
        issuer: Option<&str>,
        audience: Option<&str>,
        max_cache_ttl: Duration,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = audience {
            validation.set_audience(&[aud]);
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            cache: DashMap::new(),
            max_cache_ttl,
        }
    }

    /// Verify a bearer token and return the identity it carries.
    #[tracing::instrument(name = "auth.validate_token", level = "debug", skip_all)]
    pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let cache_key: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        if let Some(hit) = self.cache.get(&cache_key) {
            if hit.valid_until > Instant::now() {
                return Ok(hit.identity.clone());
            }
        }

        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                kind => AuthError::Invalid(format!("{kind:?}")),
            },
        )?;

        let claims = data.claims;
        let tier_claim = claims.tier_ns.or(claims.tier).unwrap_or_default();
        let identity = Identity {
            user_id: claims.sub,
            tier: Tier::from_claim(&tier_claim),
            expires_at: claims.exp,
        };

        let now_unix = unix_now();
        let remaining = Duration::from_secs(claims.exp.saturating_sub(now_unix));
        let ttl = (remaining / 2).min(self.max_cache_ttl);
        if !ttl.is_zero() {
            self.cache.insert(
                cache_key,
                CachedIdentity {
                    identity: identity.clone(),
                    valid_until: Instant::now() + ttl,
                },
            );
        }
        Ok(identity)
    }

    /// Drop expired cache entries; called by the periodic cleaner.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.cache.retain(|_, cached| cached.valid_until > now);
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
