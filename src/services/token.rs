use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::AuthConfig;
use crate::error::{AppError, Result};
use crate::models::{ClaimSet, ClaimValue};

/// Shared secret accepted in test mode
const TEST_SECRET: &[u8] = b"test";

/// Lower bound between two forced key set refreshes
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

type RawClaims = HashMap<String, Value>;

/// Source of the asymmetric keys tokens are verified against
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Current key set; `refresh` asks for a fresh copy instead of a cached one
    async fn keys(&self, refresh: bool) -> Result<Arc<JwkSet>>;
}

struct CachedKeys {
    fetched_at: Instant,
    keys: Arc<JwkSet>,
}

/// JWK set fetched over HTTP and cached for a fixed time
pub struct RemoteKeySet {
    url: String,
    client: reqwest::Client,
    ttl: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl RemoteKeySet {
    pub fn new(url: impl Into<String>, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(KEY_FETCH_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
            ttl,
            cache: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> Result<JwkSet> {
        let fetch_error = |e: reqwest::Error| {
            AppError::InvalidToken(format!("Failed to fetch key set from {}: {}", self.url, e))
        };

        let keys = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_error)?
            .json::<JwkSet>()
            .await
            .map_err(fetch_error)?;

        tracing::debug!("Fetched {} signing keys from {}", keys.keys.len(), self.url);
        Ok(keys)
    }
}

#[async_trait]
impl KeySource for RemoteKeySet {
    async fn keys(&self, refresh: bool) -> Result<Arc<JwkSet>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                let age = cached.fetched_at.elapsed();
                let fresh = if refresh {
                    age < MIN_REFRESH_INTERVAL
                } else {
                    age < self.ttl
                };
                if fresh {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let keys = Arc::new(self.fetch().await?);
        *self.cache.write().await = Some(CachedKeys {
            fetched_at: Instant::now(),
            keys: keys.clone(),
        });
        Ok(keys)
    }
}

/// Fixed key set, for deployments that pin keys and for tests
pub struct StaticKeySet {
    keys: Arc<JwkSet>,
}

impl StaticKeySet {
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys: Arc::new(keys),
        }
    }
}

#[async_trait]
impl KeySource for StaticKeySet {
    async fn keys(&self, _refresh: bool) -> Result<Arc<JwkSet>> {
        Ok(self.keys.clone())
    }
}

enum TrustMode {
    Production {
        keys: Arc<dyn KeySource>,
        issuer: String,
        audience: String,
        algorithms: Vec<Algorithm>,
    },
    Test,
}

/// Validates bearer tokens and extracts the caller's claims
pub struct TokenVerifier {
    mode: TrustMode,
    role_claim: String,
}

impl TokenVerifier {
    /// RS256 tokens checked against `keys`, `issuer` and `audience`
    pub fn production(
        keys: Arc<dyn KeySource>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            mode: TrustMode::Production {
                keys,
                issuer: issuer.into(),
                audience: audience.into(),
                algorithms: vec![Algorithm::RS256],
            },
            role_claim: "role".to_string(),
        }
    }

    /// HS256 tokens signed with the fixed test secret
    pub fn test_mode() -> Self {
        Self {
            mode: TrustMode::Test,
            role_claim: "role".to_string(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let verifier = if config.test_mode {
            Self::test_mode()
        } else {
            let keys = RemoteKeySet::new(
                config.key_url.clone(),
                Duration::from_secs(config.jwks_cache_secs),
            )?;
            Self::production(Arc::new(keys), &config.issuer, &config.audience)
        };
        Ok(verifier.with_role_claim(&config.role_claim))
    }

    pub fn with_role_claim(mut self, claim: &str) -> Self {
        self.role_claim = claim.to_string();
        self
    }

    /// Restrict production mode to `algorithms` instead of RS256
    pub fn with_algorithms(mut self, algs: Vec<Algorithm>) -> Self {
        if let TrustMode::Production { algorithms, .. } = &mut self.mode {
            *algorithms = algs;
        }
        self
    }

    pub fn algorithm_name(&self) -> &'static str {
        match self.mode {
            TrustMode::Production { .. } => "RS256",
            TrustMode::Test => "HS256",
        }
    }

    /// Verify `token` and return the claims of its subject
    pub async fn verify(&self, token: &str) -> Result<ClaimSet> {
        let raw = match &self.mode {
            TrustMode::Test => Self::decode_test(token)?,
            TrustMode::Production {
                keys,
                issuer,
                audience,
                algorithms,
            } => Self::decode_production(token, keys.as_ref(), issuer, audience, algorithms).await?,
        };

        self.extract(raw)
    }

    fn decode_test(token: &str) -> Result<RawClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        validation.validate_nbf = true;

        decode::<RawClaims>(token, &DecodingKey::from_secret(TEST_SECRET), &validation)
            .map(|data| data.claims)
            .map_err(invalid_token)
    }

    async fn decode_production(
        token: &str,
        keys: &dyn KeySource,
        issuer: &str,
        audience: &str,
        algorithms: &[Algorithm],
    ) -> Result<RawClaims> {
        let header = decode_header(token).map_err(invalid_token)?;
        if !algorithms.contains(&header.alg) {
            return Err(AppError::InvalidToken(format!(
                "Unsupported algorithm {:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_nbf = true;

        let candidates = candidate_keys(keys, header.kid.as_deref()).await?;
        let mut last_error = AppError::InvalidToken("No signing key available".to_string());

        for jwk in &candidates {
            let key = match DecodingKey::from_jwk(jwk) {
                Ok(key) => key,
                Err(e) => {
                    last_error = invalid_token(e);
                    continue;
                }
            };

            match decode::<RawClaims>(token, &key, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => {
                    let wrong_key = matches!(
                        e.kind(),
                        jsonwebtoken::errors::ErrorKind::InvalidSignature
                            | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm
                    );
                    last_error = invalid_token(e);
                    if !wrong_key {
                        break;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Turn verified raw claims into a typed claim set
    fn extract(&self, raw: RawClaims) -> Result<ClaimSet> {
        let subject = match raw.get("sub") {
            Some(Value::String(sub)) if !sub.is_empty() => sub.clone(),
            Some(_) => return Err(AppError::InvalidClaims("sub claim must be a string".to_string())),
            None => return Err(AppError::InvalidClaims("sub claim is missing".to_string())),
        };

        let roles = raw
            .get(&self.role_claim)
            .map(|v| ClaimValue::from_json(&self.role_claim, v))
            .transpose()?
            .map(ClaimValue::into_list)
            .unwrap_or_default();

        let mut scopes = Vec::new();
        for name in ["scope", "scp"] {
            if let Some(value) = raw.get(name) {
                scopes.extend(ClaimValue::from_json(name, value)?.into_space_delimited_list());
            }
        }

        Ok(ClaimSet {
            subject,
            roles,
            scopes,
        })
    }
}

/// Keys that may have signed a token with the given `kid`
async fn candidate_keys(keys: &dyn KeySource, kid: Option<&str>) -> Result<Vec<Jwk>> {
    let set = keys.keys(false).await?;
    let Some(kid) = kid else {
        return Ok(set.keys.clone());
    };

    if let Some(jwk) = set.find(kid) {
        return Ok(vec![jwk.clone()]);
    }

    // Key rotation: the issuer may have published keys since the last fetch
    let set = keys.keys(true).await?;
    set.find(kid)
        .map(|jwk| vec![jwk.clone()])
        .ok_or_else(|| AppError::InvalidToken(format!("No signing key with kid {}", kid)))
}

fn invalid_token(e: jsonwebtoken::errors::Error) -> AppError {
    AppError::InvalidToken(e.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    /// Mint a test-mode token for `sub` with the given roles and scope
    pub fn test_token(sub: &str, roles: &[&str], scope: Option<&str>) -> String {
        let now = chrono::Utc::now().timestamp();
        let mut claims = json!({
            "sub": sub,
            "role": roles,
            "iat": now,
            "exp": now + 3600,
        });
        if let Some(scope) = scope {
            claims["scope"] = json!(scope);
        }
        sign_test(&claims)
    }

    pub fn sign_test(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(super::TEST_SECRET),
        )
        .unwrap()
    }
}
