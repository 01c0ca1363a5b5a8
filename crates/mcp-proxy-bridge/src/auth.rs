//! Outbound HTTP authentication.
//!
//! Assembles the headers sent by the HTTP client transports: explicit
//! operator headers first, then an `API_ACCESS_TOKEN` bearer fallback, then
//! OAuth2 client-credentials tokens fetched on demand and refreshed once on
//! a 401.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

/// Deadline for a token-endpoint round trip.
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth2 client-credentials settings.
#[derive(Debug, Clone)]
pub struct OAuthClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Header state shared by one HTTP transport.
pub struct OutboundAuth {
    headers: HeaderMap,
    oauth: Option<OAuthClientCredentials>,
    token: RwLock<Option<String>>,
}

impl OutboundAuth {
    /// Build from explicit `(name, value)` headers plus the optional
    /// environment token. Explicit `Authorization` wins over
    /// `API_ACCESS_TOKEN`.
    pub fn new(
        explicit: &[(String, String)],
        oauth: Option<OAuthClientCredentials>,
        api_access_token: Option<String>,
    ) -> BridgeResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in explicit {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BridgeError::ConfigInvalid(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| BridgeError::ConfigInvalid(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        if !headers.contains_key(AUTHORIZATION) {
            if let Some(token) = api_access_token {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| BridgeError::ConfigInvalid(format!("invalid API_ACCESS_TOKEN: {e}")))?;
                headers.insert(AUTHORIZATION, value);
            }
        }

        Ok(Self {
            headers,
            oauth,
            token: RwLock::new(None),
        })
    }

    /// Static headers plus the current OAuth bearer, fetching the first
    /// token when needed.
    pub async fn headers(&self, client: &reqwest::Client) -> BridgeResult<HeaderMap> {
        let mut headers = self.headers.clone();
        if self.oauth.is_some() {
            let token = {
                let guard = self.token.read().await;
                guard.clone()
            };
            let token = match token {
                Some(token) => token,
                None => self.refresh(client).await?,
            };
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| BridgeError::AuthFailure(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Whether a 401 can be retried with a fresh token.
    pub fn can_refresh(&self) -> bool {
        self.oauth.is_some()
    }

    /// Fetch a fresh client-credentials token.
    pub async fn refresh(&self, client: &reqwest::Client) -> BridgeResult<String> {
        let Some(oauth) = &self.oauth else {
            return Err(BridgeError::AuthFailure(
                "no OAuth client credentials configured".to_string(),
            ));
        };

        debug!(token_url = %oauth.token_url, "Requesting OAuth client-credentials token");

        let response = client
            .post(&oauth.token_url)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| BridgeError::AuthFailure(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(status = %status, "Token endpoint rejected client credentials");
            return Err(BridgeError::AuthFailure(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::AuthFailure(format!("invalid token response: {e}")))?;

        *self.token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}
