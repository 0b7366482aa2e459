//! API tokens for service principals.
//!
//! A token is `base64url(principal-uuid ":" secret)`. Only argon2 hashes of
//! secrets are stored, by an external secret store, and a principal may have
//! several valid secrets at once so a new one can be rolled out before the
//! old one expires.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::clock::Clock;
use super::principal::PrincipalId;

/// Log target for credential events that need a human.
pub const ALERT_TARGET: &str = "modeled_rust::security::alert";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("secret hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Store(#[from] SecretStoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretStoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken {
    principal: PrincipalId,
    secret: String,
}

impl ApiToken {
    pub fn new(principal: PrincipalId, secret: impl Into<String>) -> Self {
        ApiToken {
            principal,
            secret: secret.into(),
        }
    }

    /// A token with a fresh random secret.
    pub fn generate(principal: PrincipalId) -> Self {
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self::new(principal, secret)
    }

    pub fn principal(&self) -> PrincipalId {
        self.principal
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.principal, self.secret))
    }

    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|_| TokenError::Malformed("not base64url"))?;
        let text = String::from_utf8(bytes).map_err(|_| TokenError::Malformed("not utf-8"))?;
        let (principal, secret) = text
            .split_once(':')
            .ok_or(TokenError::Malformed("missing separator"))?;
        let principal = principal
            .parse::<PrincipalId>()
            .map_err(|_| TokenError::Malformed("bad principal id"))?;
        if secret.is_empty() {
            return Err(TokenError::Malformed("empty secret"));
        }
        Ok(Self::new(principal, secret))
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiToken")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// PHC-format argon2 hash of a secret, for handing to a secret store.
pub fn hash_secret(secret: &str) -> Result<String, TokenError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes()).map_err(|e| TokenError::Hash(e.to_string()))?;
    hash_with(&Argon2::default(), secret, &salt)
}

fn hash_with(argon2: &Argon2<'_>, secret: &str, salt: &SaltString) -> Result<String, TokenError> {
    argon2
        .hash_password(secret.as_bytes(), salt)
        .map(|hash| hash.to_string())
        .map_err(|e| TokenError::Hash(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    pub phc_hash: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The external secret-management service.
pub trait SecretStore: Send + Sync {
    fn secrets(&self, principal: PrincipalId) -> Result<Vec<StoredSecret>, SecretStoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid(PrincipalId),
    /// The secret matched one that has expired.
    Expired(PrincipalId),
    Unknown,
}

struct CachedSecrets {
    secrets: Vec<StoredSecret>,
    fetched_at: DateTime<Utc>,
}

/// Checks presented tokens against the secret store, caching each
/// principal's secrets for `ttl`.
///
/// A token that matches none of the cached secrets triggers one refetch,
/// at most every 30 seconds per principal, so a freshly rotated-in secret
/// is picked up without waiting out the ttl. Entries past the ttl are
/// evicted whenever a fetch lands; principals without secrets are never
/// cached.
pub struct TokenVerifier {
    store: Arc<dyn SecretStore>,
    ttl: Duration,
    refetch_after: Duration,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<PrincipalId, CachedSecrets>>,
}

impl TokenVerifier {
    pub fn new(store: Arc<dyn SecretStore>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        TokenVerifier {
            store,
            ttl,
            refetch_after: ttl.min(Duration::seconds(30)),
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn verify(&self, raw: &str) -> Result<Verification, TokenError> {
        let token = match ApiToken::parse(raw) {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting unparseable api token");
                return Ok(Verification::Unknown);
            }
        };
        let principal = token.principal();
        let now = self.clock.now();

        if let Some((secrets, age)) = self.cached(principal, now) {
            let outcome = check(&token, &secrets, now);
            if outcome != Verification::Unknown || age < self.refetch_after {
                return Ok(alert_on_expired(outcome));
            }
            tracing::debug!(%principal, "api token missed cached secrets; refetching");
        }
        let secrets = self.fetch(principal, now)?;
        Ok(alert_on_expired(check(&token, &secrets, now)))
    }

    /// Forget cached secrets, e.g. right after a rotation.
    pub fn invalidate(&self, principal: PrincipalId) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.remove(&principal);
    }

    /// Live cached secrets and their age.
    fn cached(&self, principal: PrincipalId, now: DateTime<Utc>) -> Option<(Vec<StoredSecret>, Duration)> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = cache.get(&principal)?;
        let age = now - cached.fetched_at;
        (age < self.ttl).then(|| (cached.secrets.clone(), age))
    }

    fn fetch(&self, principal: PrincipalId, now: DateTime<Utc>) -> Result<Vec<StoredSecret>, TokenError> {
        let secrets = self.store.secrets(principal)?;
        tracing::debug!(%principal, count = secrets.len(), "fetched api token secrets");

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.retain(|_, cached| now - cached.fetched_at < self.ttl);
        if secrets.is_empty() {
            cache.remove(&principal);
        } else {
            cache.insert(
                principal,
                CachedSecrets {
                    secrets: secrets.clone(),
                    fetched_at: now,
                },
            );
        }
        Ok(secrets)
    }
}

fn alert_on_expired(outcome: Verification) -> Verification {
    if let Verification::Expired(principal) = outcome {
        tracing::warn!(target: ALERT_TARGET, %principal, "expired api token presented");
    }
    outcome
}

/// Match a token against one principal's secrets.
fn check(token: &ApiToken, secrets: &[StoredSecret], now: DateTime<Utc>) -> Verification {
    let principal = token.principal();
    let argon2 = Argon2::default();
    let mut expired = false;
    for stored in secrets {
        let parsed = match PasswordHash::new(&stored.phc_hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(%principal, error = %e, "skipping unreadable stored secret");
                continue;
            }
        };
        if argon2.verify_password(token.secret().as_bytes(), &parsed).is_err() {
            continue;
        }
        match stored.expires_at {
            Some(expires_at) if now >= expires_at => expired = true,
            _ => return Verification::Valid(principal),
        }
    }
    if expired {
        Verification::Expired(principal)
    } else {
        Verification::Unknown
    }
}
