//! # Identity
//!
//! Sessions are issued elsewhere. Requests reach us either through the
//! authenticating reverse proxy, which stamps a trusted user header, or straight
//! from the frontend with a bearer session token that we look up in Redis.
//!
//! Nothing touches storage before a gate has produced a [`UserId`].
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, header::AUTHORIZATION};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{error, info};

use crate::{
    config::Config,
    database::init_redis,
    engagement::UserId,
    error::{AppError, ConfigError, ServerError},
};

pub const SESSION_PREFIX: &str = "session:";

#[async_trait]
pub trait IdentityGate: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Result<UserId, AppError>;
}

/// Trusts a header set by the proxy in front of us. Never expose this directly.
pub struct TrustedHeaderGate {
    header: HeaderName,
}

impl TrustedHeaderGate {
    pub fn new(header: &str) -> Result<Self, ConfigError> {
        let header = HeaderName::try_from(header)
            .map_err(|_| ConfigError::IdentityHeader(header.to_string()))?;

        Ok(Self { header })
    }
}

#[async_trait]
impl IdentityGate for TrustedHeaderGate {
    async fn resolve(&self, headers: &HeaderMap) -> Result<UserId, AppError> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .and_then(UserId::parse)
            .ok_or(AppError::Unauthenticated)
    }
}

/// `Authorization: Bearer <token>` resolved through `session:<token>` in Redis.
pub struct RedisSessionGate {
    connection: ConnectionManager,
}

impl RedisSessionGate {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl IdentityGate for RedisSessionGate {
    async fn resolve(&self, headers: &HeaderMap) -> Result<UserId, AppError> {
        let token = bearer_token(headers).ok_or(AppError::Unauthenticated)?;

        let mut connection = self.connection.clone();
        let user: Option<String> = connection
            .get(format!("{SESSION_PREFIX}{token}"))
            .await
            .map_err(|e| {
                error!("Session lookup failed: {e}");
                AppError::InternalError
            })?;

        user.as_deref()
            .and_then(UserId::parse)
            .ok_or(AppError::Unauthenticated)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;

    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }

    Some(token)
}

pub async fn init_gate(config: &Config) -> Result<Arc<dyn IdentityGate>, ServerError> {
    match &config.redis_url {
        Some(redis_url) => {
            info!("Resolving callers through Redis sessions");
            let connection = init_redis(redis_url).await?;

            Ok(Arc::new(RedisSessionGate::new(connection)))
        }
        None => {
            info!("Resolving callers from trusted {} header", config.identity_header);

            Ok(Arc::new(TrustedHeaderGate::new(&config.identity_header)?))
        }
    }
}
