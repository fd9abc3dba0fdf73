use std::{future::Future, path::PathBuf};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{DestreamError, DestreamResult};

/// Tokens expiring sooner than this are treated as already expired.
const MIN_TOKEN_LIFETIME_SECS: i64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "AccessToken")]
    pub bearer_token: String,
    #[serde(rename = "ApiGatewayUri")]
    pub api_base: String,
    #[serde(rename = "ApiGatewayVersion", default)]
    pub api_version: Option<String>,
}

impl Session {
    pub fn new<T, B>(bearer_token: T, api_base: B) -> Self
    where
        T: Into<String>,
        B: Into<String>,
    {
        Self {
            bearer_token: bearer_token.into(),
            api_base: api_base.into(),
            api_version: None,
        }
    }

    pub fn with_api_version<S>(mut self, version: S) -> Self
    where
        S: Into<String>,
    {
        self.api_version = Some(version.into());
        self
    }

    /// Seconds until the bearer token expires, if it is a JWT carrying `exp`.
    pub fn expires_in(&self) -> Option<i64> {
        let payload = self.bearer_token.split('.').nth(1)?;
        let payload = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;
        let exp = claims.get("exp")?.as_i64()?;
        Some(exp - chrono::Utc::now().timestamp())
    }
}

pub trait SessionProvider {
    fn get_session(&self) -> impl Future<Output = DestreamResult<Session>> + Send;
}

/// A session handed over by the caller, e.g. from the command line.
#[derive(Debug, Clone)]
pub struct StaticSession(Option<Session>);

impl StaticSession {
    pub fn new(session: Option<Session>) -> Self {
        Self(session)
    }
}

impl SessionProvider for StaticSession {
    async fn get_session(&self) -> DestreamResult<Session> {
        self.0.clone().ok_or(DestreamError::NoSession)
    }
}

/// Session persisted as JSON by a previous login.
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { path: path.into() }
    }

    pub async fn read(&self) -> DestreamResult<Option<Session>> {
        if !self.path.exists() {
            tracing::warn!("{} not found.", self.path.display());
            return Ok(None);
        }

        let data = tokio::fs::read(&self.path).await?;
        let session: Session = serde_json::from_slice(&data)?;
        match session.expires_in() {
            Some(left) if left < MIN_TOKEN_LIFETIME_SECS => {
                tracing::warn!("Access token has expired.");
                Ok(None)
            }
            _ => {
                tracing::info!("Access token still good!");
                Ok(Some(session))
            }
        }
    }

    pub async fn write(&self, session: &Session) -> DestreamResult<()> {
        let data = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&self.path, data).await?;
        tracing::info!("Fresh access token dropped into {}", self.path.display());
        Ok(())
    }
}

impl SessionProvider for TokenCache {
    async fn get_session(&self) -> DestreamResult<Session> {
        self.read().await?.ok_or(DestreamError::NoSession)
    }
}
