//! Upstream broker protocol client.
//!
//! One instance serves every target; per-call credentials come from the
//! target handed in. Session create self-heals 409 conflicts by deleting
//! the stale session the broker reports and retrying.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::auth::TokenManager;
use crate::config::ProxyConfig;
use crate::credentials::Target;
use crate::error::{ProxyError, Result};

/// Maximum session-create attempts before falling back to the background
/// retry schedule.
const MAX_CREATE_ATTEMPTS: u32 = 3;

/// Delay before retrying a create after a stale session was deleted.
const POST_DELETE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// HTTP client for one upstream broker conversation per target.
pub struct UpstreamClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    runner_version: String,
    os_label: String,
    arch_label: String,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig, http: reqwest::Client, tokens: Arc<TokenManager>) -> Self {
        Self {
            http,
            tokens,
            runner_version: config.runner_version.clone(),
            os_label: config.os_label.clone(),
            arch_label: config.arch_label.clone(),
        }
    }

    /// Create an upstream session for a target.
    ///
    /// On 409 the broker may report the stale session ID in its body; that
    /// session is deleted and the create retried after 1 s. Other failures
    /// back off 2 s, 4 s, 8 s across at most three attempts.
    pub async fn create_session(&self, target: &Target) -> Result<String> {
        let url = join_url(&target.runner.server_url_v2, "session");
        let mut last_error = ProxyError::Session {
            reason: "no attempts made".into(),
        };

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let token = self.tokens.bearer_token(target).await?;

            let response = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(&json!({}))
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    let body: serde_json::Value =
                        response.json().await.map_err(|e| ProxyError::Session {
                            reason: format!("unreadable session response: {}", e),
                        })?;
                    let session_id = body
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| ProxyError::Session {
                            reason: "session response missing sessionId".into(),
                        })?;
                    return Ok(session_id.to_string());
                }
                Ok(response) if response.status() == reqwest::StatusCode::CONFLICT => {
                    let body = response.text().await.unwrap_or_default();
                    let stale = serde_json::from_str::<serde_json::Value>(&body)
                        .ok()
                        .and_then(|v| {
                            v.get("sessionId")
                                .and_then(|s| s.as_str())
                                .map(str::to_string)
                        });

                    let delay = match stale {
                        Some(stale_id) => {
                            tracing::warn!(
                                target_id = %target.id,
                                stale_session = %stale_id,
                                "Session conflict; deleting stale upstream session"
                            );
                            self.delete_session(target, &stale_id).await;
                            POST_DELETE_RETRY_DELAY
                        }
                        None => {
                            tracing::warn!(
                                target_id = %target.id,
                                "Session conflict with no reported session ID"
                            );
                            backoff_delay(attempt)
                        }
                    };

                    last_error = ProxyError::SessionConflict {
                        target_id: target.id.clone(),
                    };
                    if attempt < MAX_CREATE_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                    }
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last_error = ProxyError::Session {
                        reason: format!("HTTP {} creating session: {}", status.as_u16(), body),
                    };
                    if attempt < MAX_CREATE_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
                Err(e) => {
                    last_error = ProxyError::Session {
                        reason: format!("session create request failed: {}", e),
                    };
                    if attempt < MAX_CREATE_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Delete an upstream session. Best-effort: errors are logged only.
    pub async fn delete_session(&self, target: &Target, session_id: &str) {
        let token = match self.tokens.bearer_token(target).await {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!(target_id = %target.id, "Skipping session delete, no token: {}", e);
                return;
            }
        };

        let url = join_url(&target.runner.server_url_v2, "session");
        let result = self
            .http
            .delete(&url)
            .query(&[("sessionId", session_id)])
            .bearer_auth(&token)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(target_id = %target.id, session_id = %session_id, "Deleted upstream session");
            }
            Ok(response) => {
                tracing::debug!(
                    target_id = %target.id,
                    status = response.status().as_u16(),
                    "Upstream session delete returned non-success"
                );
            }
            Err(e) => {
                tracing::debug!(target_id = %target.id, "Upstream session delete failed: {}", e);
            }
        }
    }

    /// Long-poll for the next message. `Ok(None)` means no message this
    /// round (202, empty body, or long-poll timeout).
    pub async fn poll_message(&self, target: &Target, session_id: &str) -> Result<Option<String>> {
        let token = self.tokens.bearer_token(target).await.map_err(|e| {
            ProxyError::Poll {
                reason: format!("token refresh failed: {}", e),
            }
        })?;

        let url = join_url(&target.runner.server_url_v2, "message");
        let result = self
            .http
            .get(&url)
            .query(&[
                ("sessionId", session_id),
                ("status", "Online"),
                ("runnerVersion", &self.runner_version),
                ("os", &self.os_label),
                ("architecture", &self.arch_label),
                ("disableUpdate", "true"),
            ])
            .bearer_auth(&token)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            // A quiet long-poll window; not an error.
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => {
                return Err(ProxyError::Poll {
                    reason: format!("message poll failed: {}", e),
                });
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            let body = response.text().await.map_err(|e| ProxyError::Poll {
                reason: format!("unreadable message body: {}", e),
            })?;
            if body.is_empty() {
                return Ok(None);
            }
            return Ok(Some(body));
        }
        if status.is_success() {
            return Ok(None);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::Poll {
            reason: format!("HTTP {} polling messages: {}", status.as_u16(), body),
        })
    }

    /// Claim a job at its run service so the broker stops redelivering it.
    ///
    /// Returns the raw acquire body on success, `None` otherwise; a failed
    /// acquire is logged and the job still offered to a worker, whose own
    /// acquire will then surface the failure.
    pub async fn acquire_job(
        &self,
        target: &Target,
        session_id: &str,
        run_service_url: &str,
        job_message_id: &str,
        billing_owner_id: Option<&str>,
    ) -> Option<String> {
        let token = match self.tokens.bearer_token(target).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(target_id = %target.id, job = %job_message_id, "Acquire skipped, no token: {}", e);
                return None;
            }
        };

        let mut body = json!({
            "jobMessageId": job_message_id,
            "runnerOS": "macOS",
        });
        if let Some(owner) = billing_owner_id {
            body["billingOwnerId"] = json!(owner);
        }

        let url = join_url(run_service_url, "acquirejob");
        let result = self
            .http
            .post(&url)
            .query(&[("sessionId", session_id)])
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                response.text().await.ok()
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let err = ProxyError::Acquire {
                    reason: format!("HTTP {}: {}", status.as_u16(), body),
                };
                tracing::warn!(target_id = %target.id, job = %job_message_id, "{}", err);
                None
            }
            Err(e) => {
                let err = ProxyError::Acquire {
                    reason: e.to_string(),
                };
                tracing::warn!(target_id = %target.id, job = %job_message_id, "{}", err);
                None
            }
        }
    }

    /// Acknowledge a message at the broker. Non-fatal on error.
    pub async fn acknowledge(&self, target: &Target, session_id: &str, message_id: &str) {
        let token = match self.tokens.bearer_token(target).await {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!(target_id = %target.id, "Acknowledge skipped, no token: {}", e);
                return;
            }
        };

        let url = join_url(&target.runner.server_url_v2, "acknowledge");
        let result = self
            .http
            .post(&url)
            .query(&[("sessionId", session_id)])
            .bearer_auth(&token)
            .json(&json!({ "messageId": message_id }))
            .send()
            .await;

        if let Err(e) = result {
            tracing::debug!(target_id = %target.id, message_id = %message_id, "Acknowledge failed: {}", e);
        }
    }

    /// Bearer token for a target (used by the forward path).
    pub async fn bearer_token(&self, target: &Target) -> Result<String> {
        self.tokens.bearer_token(target).await
    }
}

/// Exponential backoff for session creation: 2 s, 4 s, 8 s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// Join a base URL (with or without trailing slash) and a relative path.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}
