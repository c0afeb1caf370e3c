//! Identity provider adapter. Session tokens are issued by an external
//! provider (Clerk); this module only verifies them and looks up the
//! signed-in user's email through the provider's backend API.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::config::IdentityConfig;
use crate::models::AppError;

/// Claims we rely on from a provider session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Provider user id.
    pub sub: String,
    pub iat: usize,
    pub exp: usize,
    /// Authorized party: the origin that requested the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<Claims, AppError>;
    async fn primary_email(&self, user_id: &str) -> Result<String, AppError>;
    async fn user_id_from_token(&self, token: &str) -> Result<String, AppError> {
        let claims = self.validate_token(token).await?;
        if claims.sub.is_empty() {
            return Err(AppError::Unauthorized("token has no subject".into()));
        }
        Ok(claims.sub)
    }
}

#[derive(Debug, Deserialize)]
struct ProviderUser {
    primary_email_address_id: Option<String>,
    #[serde(default)]
    email_addresses: Vec<ProviderEmail>,
}

#[derive(Debug, Deserialize)]
struct ProviderEmail {
    id: String,
    email_address: String,
}

impl ProviderUser {
    fn primary_email(self) -> Option<String> {
        let primary_id = self.primary_email_address_id;
        let mut emails = self.email_addresses;
        let pos = emails.iter().position(|e| Some(&e.id) == primary_id.as_ref()).unwrap_or(0);
        if pos < emails.len() { Some(emails.swap_remove(pos).email_address) } else { None }
    }
}

/// Verifies provider session JWTs and queries the provider's user API.
#[derive(Clone)]
pub struct ClerkIdentityProvider {
    decoding: DecodingKey,
    validation: Validation,
    authorized_parties: Vec<String>,
    api_url: String,
    secret_key: Option<String>,
    http: reqwest::Client,
    redis: Option<redis::Client>,
    cache_ttl_secs: u64,
}

impl ClerkIdentityProvider {
    /// RS256 verification with the provider's PEM public key.
    pub fn with_public_key(pem: &str, api_url: impl Into<String>, secret_key: Option<String>) -> Result<Self, AppError> {
        let decoding = DecodingKey::from_rsa_pem(pem.as_bytes())?;
        Ok(Self::build(reqwest::Client::new(), decoding, Algorithm::RS256, api_url.into(), secret_key))
    }

    /// HS256 verification with a shared secret.
    pub fn with_secret(secret: &str, api_url: impl Into<String>, secret_key: Option<String>) -> Self {
        Self::build(reqwest::Client::new(), DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256, api_url.into(), secret_key)
    }

    /// Prefers the PEM public key; env files often carry it with escaped `\\n` line breaks.
    pub fn from_config(cfg: &IdentityConfig, timeout: Duration, redis: Option<redis::Client>) -> Result<Self, AppError> {
        let (decoding, alg) = match (&cfg.jwt_public_key, &cfg.jwt_secret) {
            (Some(pem), _) => (DecodingKey::from_rsa_pem(pem.replace("\\n", "\n").as_bytes())?, Algorithm::RS256),
            (None, Some(secret)) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
            (None, None) => {
                return Err(AppError::Config("CLERK_JWT_PUBLIC_KEY or CLERK_JWT_SECRET is required".into()));
            }
        };
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::build(http, decoding, alg, cfg.api_url.clone(), cfg.secret_key.clone())
            .with_authorized_parties(cfg.authorized_parties.clone())
            .with_email_cache(redis, cfg.email_cache_ttl_secs))
    }

    pub fn with_authorized_parties(mut self, parties: Vec<String>) -> Self {
        self.authorized_parties = parties;
        self
    }

    pub fn with_email_cache(mut self, redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        self.redis = redis;
        self.cache_ttl_secs = ttl_secs;
        self
    }

    fn build(http: reqwest::Client, decoding: DecodingKey, alg: Algorithm, api_url: String, secret_key: Option<String>) -> Self {
        let mut validation = Validation::new(alg);
        validation.validate_exp = true;
        // Provider session tokens carry no audience.
        validation.validate_aud = false;
        Self {
            decoding,
            validation,
            authorized_parties: Vec::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            secret_key,
            http,
            redis: None,
            cache_ttl_secs: 0,
        }
    }

    async fn cached_email(&self, user_id: &str) -> Option<String> {
        let client = self.redis.as_ref()?;
        let mut conn = client.get_async_connection().await.ok()?;
        let email: Option<String> = conn.get(format!("identity:email:{}", user_id)).await.ok()?;
        email
    }

    async fn cache_email(&self, user_id: &str, email: &str) {
        let Some(client) = &self.redis else { return };
        if self.cache_ttl_secs == 0 { return; }
        let result: Result<(), redis::RedisError> = async {
            let mut conn = client.get_async_connection().await?;
            conn.set_ex(format!("identity:email:{}", user_id), email, self.cache_ttl_secs).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to cache user email");
        }
    }

    async fn fetch_email(&self, user_id: &str) -> Result<String, AppError> {
        let secret = self.secret_key.as_deref().ok_or_else(|| AppError::Config("CLERK_SECRET_KEY is required for user lookups".into()))?;
        let resp = self
            .http
            .get(format!("{}/v1/users/{}", self.api_url, user_id))
            .bearer_auth(secret)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!("identity provider returned {}: {}", status, body)));
        }
        let user: ProviderUser = resp.json().await?;
        user.primary_email().ok_or_else(|| AppError::Upstream(format!("user {} has no email address", user_id)))
    }
}

#[async_trait]
impl IdentityProvider for ClerkIdentityProvider {
    async fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        if !self.authorized_parties.is_empty() {
            let allowed = data.claims.azp.as_ref().map(|azp| self.authorized_parties.contains(azp)).unwrap_or(false);
            if !allowed {
                return Err(AppError::Unauthorized("token issued for an unknown party".into()));
            }
        }
        Ok(data.claims)
    }

    async fn primary_email(&self, user_id: &str) -> Result<String, AppError> {
        if let Some(email) = self.cached_email(user_id).await {
            return Ok(email);
        }
        let email = self.fetch_email(user_id).await?;
        self.cache_email(user_id, &email).await;
        Ok(email)
    }
}

/// Session token from `Authorization: Bearer ...`, falling back to the `__session` cookie.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);
    bearer.or_else(|| {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().strip_prefix("__session="))
            .map(|s| s.to_string())
            .next()
    })
    .filter(|t| !t.is_empty())
}
