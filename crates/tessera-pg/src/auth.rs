//! Connection authentication
//!
//! Static auth takes the credentials from the connection string as-is. Azure
//! auth replaces the password with an Azure AD access token for Azure Database
//! for PostgreSQL, fetched from the instance metadata service of the managed
//! identity the process runs as.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tessera_core::{Error, Result};
use tracing::debug;

use crate::config::AuthMode;

/// Token audience for Azure Database for PostgreSQL
pub const AZURE_POSTGRES_RESOURCE: &str = "https://ossrdbms-aad.database.windows.net";

/// Azure instance metadata token endpoint
pub const AZURE_IMDS_TOKEN_ENDPOINT: &str =
    "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";

/// Tokens are refreshed this many seconds before they expire
const REFRESH_MARGIN_SECS: i64 = 300;

/// Source of short-lived passwords
#[async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    /// A token valid for at least the next few minutes
    async fn token(&self) -> Result<String>;
}

/// How connections obtain their credentials
#[derive(Debug, Clone, Default)]
pub enum Authenticator {
    /// Use the connection string unchanged
    #[default]
    Static,
    /// Set the password from a token provider before each connect
    Token(Arc<dyn TokenProvider>),
}

impl Authenticator {
    /// Build the authenticator for `mode`
    pub fn for_mode(mode: AuthMode) -> Result<Self> {
        match mode {
            AuthMode::Static => Ok(Self::Static),
            AuthMode::Azure => Ok(Self::Token(Arc::new(AzureTokenProvider::new()?))),
        }
    }

    /// Apply credentials to a connection config
    pub async fn apply(&self, config: &mut tokio_postgres::Config) -> Result<()> {
        if let Self::Token(provider) = self {
            let token = provider.token().await?;
            config.password(token);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    /// Seconds since the epoch, sent as a string
    expires_on: String,
}

/// Azure AD token provider backed by the instance metadata service
#[derive(Debug)]
pub struct AzureTokenProvider {
    http_client: reqwest::Client,
    endpoint: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AzureTokenProvider {
    /// Create a provider for the default metadata endpoint
    pub fn new() -> Result<Self> {
        Self::with_endpoint(AZURE_IMDS_TOKEN_ENDPOINT)
    }

    /// Create a provider for a custom token endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal(format!("failed to create Azure HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let response = self
            .http_client
            .get(&self.endpoint)
            .query(&[
                ("api-version", IMDS_API_VERSION),
                ("resource", AZURE_POSTGRES_RESOURCE),
            ])
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| Error::connection_with_source("failed to request Azure AD token", e))?
            .error_for_status()
            .map_err(|e| Error::connection_with_source("Azure AD token request rejected", e))?;

        let body: ImdsTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::connection_with_source("invalid Azure AD token response", e))?;
        parse_token(body)
    }
}

fn parse_token(body: ImdsTokenResponse) -> Result<CachedToken> {
    let expires_on: i64 = body
        .expires_on
        .parse()
        .map_err(|_| Error::internal(format!("invalid token expiry {:?}", body.expires_on)))?;
    let expires_at = Utc
        .timestamp_opt(expires_on, 0)
        .single()
        .ok_or_else(|| Error::internal(format!("token expiry {} out of range", expires_on)))?;
    Ok(CachedToken {
        token: body.access_token,
        refresh_at: expires_at - Duration::seconds(REFRESH_MARGIN_SECS),
    })
}

#[async_trait]
impl TokenProvider for AzureTokenProvider {
    async fn token(&self) -> Result<String> {
        if let Some(cached) = self.cached.lock().as_ref() {
            if Utc::now() < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.fetch().await?;
        debug!(refresh_at = %fresh.refresh_at, "Fetched Azure AD token");
        let token = fresh.token.clone();
        *self.cached.lock() = Some(fresh);
        Ok(token)
    }
}
