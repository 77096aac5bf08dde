//! Observer interface for proxy lifecycle events.
//!
//! Consumers are in-process and synchronous; handlers must return quickly
//! and never block.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of one registered target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    #[serde(rename = "targetId")]
    pub target_id: String,
    pub registered: bool,
    #[serde(rename = "sessionActive")]
    pub session_active: bool,
    #[serde(rename = "lastPoll")]
    pub last_poll: Option<DateTime<Utc>>,
    #[serde(rename = "jobsAssigned")]
    pub jobs_assigned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receives proxy events. All handlers default to no-ops.
pub trait ProxyEvents: Send + Sync {
    fn status_update(&self, _statuses: &[TargetStatus]) {}
    fn job_received(&self, _target_id: &str, _job_id: &str) {}
    fn error(&self, _target_id: &str, _message: &str) {}
}

/// Default observer that drops every event.
pub struct NoopEvents;

impl ProxyEvents for NoopEvents {}

/// Decides whether the proxy may claim another job upstream.
pub trait AdmissionPolicy: Send + Sync {
    fn can_accept_job(&self) -> bool;
}

/// Default admission policy: always accept.
pub struct AcceptAll;

impl AdmissionPolicy for AcceptAll {
    fn can_accept_job(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_wire_names() {
        let status = TargetStatus {
            target_id: "t1".into(),
            registered: true,
            session_active: true,
            last_poll: None,
            jobs_assigned: 2,
            error: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["targetId"], "t1");
        assert_eq!(json["sessionActive"], true);
        assert_eq!(json["jobsAssigned"], 2);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.can_accept_job());
    }
}
