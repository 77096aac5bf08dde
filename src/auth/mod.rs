//! Bearer token management for upstream targets.
//!
//! Each target authenticates with a signed-JWT client-credentials exchange:
//! a short-lived RS256 assertion is traded at the target's authorization URL
//! for a bearer token, which is cached until shortly before expiry.

pub mod jwt;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::credentials::Target;
use crate::error::{ProxyError, Result};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

/// Caching bearer-token source, keyed by target ID.
pub struct TokenManager {
    http: reqwest::Client,
    jwt_lifetime: Duration,
    refresh_margin: chrono::Duration,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, jwt_lifetime: Duration, refresh_margin: Duration) -> Self {
        Self {
            http,
            jwt_lifetime,
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get a bearer token for a target, minting a new one if the cached
    /// token is missing or within the refresh margin of expiry.
    pub async fn bearer_token(&self, target: &Target) -> Result<String> {
        if let Some(cached) = self.cached(&target.id) {
            return Ok(cached);
        }

        let token = self.exchange(target).await?;
        tracing::debug!(target_id = %target.id, "Minted bearer token");
        Ok(token)
    }

    /// Drop a target's cached token (on target removal).
    pub fn invalidate(&self, target_id: &str) {
        self.cache
            .lock()
            .expect("token cache poisoned")
            .remove(target_id);
    }

    fn cached(&self, target_id: &str) -> Option<String> {
        let cache = self.cache.lock().expect("token cache poisoned");
        let entry = cache.get(target_id)?;
        if Utc::now() >= entry.expires_at - self.refresh_margin {
            return None;
        }
        Some(entry.access_token.clone())
    }

    async fn exchange(&self, target: &Target) -> Result<String> {
        let assertion = jwt::mint(
            &target.rsa,
            &target.oauth.client_id,
            &target.oauth.authorization_url,
            self.jwt_lifetime,
        )?;

        let response = self
            .http
            .post(&target.oauth.authorization_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                ("client_assertion", &assertion),
            ])
            .send()
            .await
            .map_err(|e| ProxyError::OAuth {
                reason: format!("token request to {} failed: {}", target.oauth.authorization_url, e),
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::OAuth {
                reason: format!("HTTP {} from authorization endpoint: {}", status.as_u16(), body),
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| ProxyError::OAuth {
            reason: format!("unreadable token response: {}", e),
        })?;

        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in);
        self.cache.lock().expect("token cache poisoned").insert(
            target.id.clone(),
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at,
            },
        );

        Ok(token.access_token)
    }
}
