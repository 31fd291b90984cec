//! IAM API key to bearer token exchange.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::debug;

use super::client::classify;
use super::models::TokenResponse;
use crate::providers::BackendError;

/// Grant type for API key exchange.
const GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Default timeout for token requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges an API key for bearer tokens and caches them until shortly
/// before expiry.
pub struct IamAuthenticator {
    client: Client,
    endpoint: String,
    api_key: String,
    token: Mutex<Option<CachedToken>>,
}

impl IamAuthenticator {
    /// Create an authenticator for `api_key` against the IAM `endpoint`.
    ///
    /// # Errors
    /// Returns error if the key is empty or the HTTP client cannot be created.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(BackendError::Auth("API key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            token: Mutex::new(None),
        })
    }

    /// Current bearer token, fetching a new one when missing or about to
    /// expire.
    ///
    /// # Errors
    /// Returns [`BackendError::Auth`] if IAM rejects the key, or a transport
    /// error.
    pub async fn token(&self) -> Result<String, BackendError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() + chrono::Duration::seconds(REFRESH_MARGIN_SECS) < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/identity/token", self.endpoint);
        debug!(url = %url, "Requesting IAM token");

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .form(&[("grant_type", GRANT_TYPE), ("apikey", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(match classify(status, &text) {
                BackendError::Api { message, .. } => BackendError::Auth(message),
                other => other,
            });
        }

        let body: TokenResponse = serde_json::from_str(&text)?;
        let value = body.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        });
        Ok(value)
    }
}

impl std::fmt::Debug for IamAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamAuthenticator")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
