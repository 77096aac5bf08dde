//! Upstream message envelope handling.
//!
//! Only the outer envelope has a fixed shape (`messageType`, `messageId`,
//! `body`); the inner job payload is an attribute bag whose field names vary
//! (`jobId` vs `runner_request_id`, three spellings of the run-service URL),
//! so everything below works on `serde_json::Value`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{ProxyError, Result};

/// Inner-payload keys that may carry the job ID.
const JOB_ID_KEYS: &[&str] = &["jobId", "runner_request_id"];

/// Inner-payload keys that may carry the run-service URL.
const RUN_SERVICE_URL_KEYS: &[&str] = &["run_service_url", "runServiceUrl", "runnerServiceUrl"];

/// Body keys a worker lifecycle call may use to address its job.
const JOB_KEY_KEYS: &[&str] = &[
    "jobRequestId",
    "requestId",
    "runnerRequestId",
    "runner_request_id",
    "jobMessageId",
];

/// An upstream message split into envelope and inner payload.
#[derive(Debug)]
pub struct ParsedMessage {
    pub message_type: Option<String>,
    /// Extracted from the raw text, not the parsed tree: `messageId` can
    /// exceed 2^53 and must never round-trip through a float.
    pub message_id: Option<String>,
    pub outer: Value,
    /// Parsed contents of the stringified `body` field, when present.
    pub inner: Option<Value>,
}

/// Parse an upstream message. Fails only if the outer envelope is not JSON.
pub fn parse_message(raw: &str) -> Result<ParsedMessage> {
    let outer: Value = serde_json::from_str(raw).map_err(|e| ProxyError::Parse {
        reason: format!("outer envelope is not JSON: {}", e),
    })?;

    let message_type = outer
        .get("messageType")
        .and_then(Value::as_str)
        .map(str::to_string);
    let inner = outer
        .get("body")
        .and_then(Value::as_str)
        .and_then(|body| serde_json::from_str(body).ok());

    Ok(ParsedMessage {
        message_type,
        message_id: extract_message_id(raw),
        outer,
        inner,
    })
}

/// Pull the integer `messageId` out of the raw message text as a string.
pub fn extract_message_id(raw: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#""messageId"\s*:\s*(\d+)"#).expect("message ID regex")
    });
    re.captures(raw).map(|c| c[1].to_string())
}

/// Render a JSON scalar as a string (IDs arrive as either).
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_key(bag: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| bag.get(*key).and_then(value_to_string))
}

/// Job ID from an inner payload.
pub fn job_id(inner: &Value) -> Option<String> {
    first_key(inner, JOB_ID_KEYS)
}

/// Run-service URL from an inner payload.
pub fn run_service_url(inner: &Value) -> Option<String> {
    first_key(inner, RUN_SERVICE_URL_KEYS)
}

/// Billing owner from an inner payload.
pub fn billing_owner(inner: &Value) -> Option<String> {
    first_key(inner, &["billing_owner_id", "billingOwnerId"])
}

/// Job key from a worker request body (lifecycle calls).
pub fn job_key_from_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    first_key(&value, JOB_KEY_KEYS)
}

/// Job ID from a queued payload (outer envelope text), for delivery binding.
pub fn job_id_from_payload(payload: &str) -> Option<String> {
    let parsed = parse_message(payload).ok()?;
    parsed.inner.as_ref().and_then(job_id)
}

/// Point every run-service URL spelling present in `bag` at the proxy.
///
/// `run_service_url` is always set so downstream consumers find the proxy
/// address under the canonical name even if upstream used another spelling.
pub fn rewrite_run_service_url(bag: &mut Value, proxy_url: &str) {
    if let Some(map) = bag.as_object_mut() {
        for key in RUN_SERVICE_URL_KEYS {
            if map.contains_key(*key) {
                map.insert((*key).to_string(), Value::String(proxy_url.to_string()));
            }
        }
        map.insert(
            "run_service_url".to_string(),
            Value::String(proxy_url.to_string()),
        );
    }
}

/// Rewrite a stored acquire body so its service URLs point at the proxy.
///
/// Unparseable bodies are returned untouched; the worker sees exactly what
/// upstream sent.
pub fn rewrite_acquire_body(body: &str, proxy_url: &str) -> String {
    let mut value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return body.to_string(),
    };
    if let Some(map) = value.as_object_mut() {
        for key in RUN_SERVICE_URL_KEYS {
            if map.contains_key(*key) {
                map.insert((*key).to_string(), Value::String(proxy_url.to_string()));
            }
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_job_message() {
        let raw = r#"{"messageType":"PipelineAgentJobRequest","messageId":12345,"body":"{\"jobId\":\"J1\",\"run_service_url\":\"https://rs.example/\"}"}"#;
        let parsed = parse_message(raw).unwrap();

        assert_eq!(parsed.message_type.as_deref(), Some("PipelineAgentJobRequest"));
        assert_eq!(parsed.message_id.as_deref(), Some("12345"));
        let inner = parsed.inner.unwrap();
        assert_eq!(job_id(&inner).as_deref(), Some("J1"));
        assert_eq!(run_service_url(&inner).as_deref(), Some("https://rs.example/"));
    }

    #[test]
    fn test_message_id_survives_float_range() {
        // 2^53 + 1: indistinguishable from 2^53 after an f64 round-trip.
        let raw = r#"{"messageType":"x","messageId":9007199254740993,"body":"{}"}"#;
        assert_eq!(
            extract_message_id(raw).as_deref(),
            Some("9007199254740993")
        );
    }

    #[test]
    fn test_garbage_outer_is_parse_error() {
        assert!(matches!(
            parse_message("not json"),
            Err(ProxyError::Parse { .. })
        ));
    }

    #[test]
    fn test_unparseable_body_yields_no_inner() {
        let raw = r#"{"messageType":"x","messageId":1,"body":"not json"}"#;
        let parsed = parse_message(raw).unwrap();
        assert!(parsed.inner.is_none());
    }

    #[test]
    fn test_job_id_fallback_spelling() {
        let inner: Value = serde_json::from_str(r#"{"runner_request_id":9871}"#).unwrap();
        assert_eq!(job_id(&inner).as_deref(), Some("9871"));
    }

    #[test]
    fn test_rewrite_sets_all_present_spellings() {
        let mut bag: Value = serde_json::from_str(
            r#"{"runServiceUrl":"https://a/","run_service_url":"https://b/","jobId":"J1"}"#,
        )
        .unwrap();
        rewrite_run_service_url(&mut bag, "http://localhost:8787/");

        assert_eq!(bag["runServiceUrl"], "http://localhost:8787/");
        assert_eq!(bag["run_service_url"], "http://localhost:8787/");
        assert_eq!(bag["jobId"], "J1");
    }

    #[test]
    fn test_rewrite_acquire_body_preserves_other_fields() {
        let body = r#"{"runnerServiceUrl":"https://rs.example/","token":"abc"}"#;
        let rewritten = rewrite_acquire_body(body, "http://localhost:8787/");
        let value: Value = serde_json::from_str(&rewritten).unwrap();
        assert_eq!(value["runnerServiceUrl"], "http://localhost:8787/");
        assert_eq!(value["token"], "abc");
    }

    #[test]
    fn test_rewrite_acquire_body_passes_through_non_json() {
        assert_eq!(rewrite_acquire_body("plain", "http://x/"), "plain");
    }

    #[test]
    fn test_job_key_from_body_priority() {
        let body = br#"{"requestId":7,"jobMessageId":"J9"}"#;
        // jobRequestId absent; requestId wins over jobMessageId.
        assert_eq!(job_key_from_body(body).as_deref(), Some("7"));
    }

    #[test]
    fn test_job_id_from_payload() {
        let raw = r#"{"messageType":"PipelineAgentJobRequest","messageId":1,"body":"{\"jobId\":\"J1\"}"}"#;
        assert_eq!(job_id_from_payload(raw).as_deref(), Some("J1"));
    }
}
