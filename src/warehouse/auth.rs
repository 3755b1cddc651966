use crate::warehouse::WarehouseError;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use yup_oauth2::authenticator::DefaultAuthenticator;

pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read credentials file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to build authenticator: {0}")]
    Build(std::io::Error),
}

/// Source of bearer tokens for warehouse requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, WarehouseError>;
}

/// A fixed token, e.g. one minted by an outside process.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, WarehouseError> {
        Ok(self.0.clone())
    }
}

/// Tokens minted from a service-account key file. The authenticator caches
/// tokens and refreshes them before expiry.
pub struct ServiceAccountTokens {
    auth: DefaultAuthenticator,
}

impl ServiceAccountTokens {
    pub async fn from_file(path: &Path) -> Result<Self, CredentialsError> {
        let key = yup_oauth2::read_service_account_key(path)
            .await
            .map_err(|source| CredentialsError::Read {
                path: path.display().to_string(),
                source,
            })?;

        let auth = yup_oauth2::ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(CredentialsError::Build)?;

        Ok(Self { auth })
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokens {
    async fn token(&self) -> Result<String, WarehouseError> {
        let token = self.auth.token(&[BIGQUERY_SCOPE]).await.map_err(|e| match e {
            yup_oauth2::Error::HttpError(e) => WarehouseError::Transport(e.to_string()),
            yup_oauth2::Error::LowLevelError(e) => WarehouseError::Transport(e.to_string()),
            other => WarehouseError::Auth(other.to_string()),
        })?;

        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| WarehouseError::Auth("token response carried no access token".into()))
    }
}
