//! Registry of targets and their upstream session state.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::broker::events::TargetStatus;
use crate::credentials::Target;

/// Runtime state for one registered target.
#[derive(Debug)]
pub struct TargetState {
    pub target: Target,
    /// Active upstream session, at most one per target.
    pub session_id: Option<String>,
    pub session_created_at: Option<DateTime<Utc>>,
    pub last_poll: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// True while a session create is in flight for this target.
    creating: bool,
    /// Background session-retry task, if one is scheduled.
    retry: Option<JoinHandle<()>>,
}

/// Locked map of target runtime state with narrow accessors.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    inner: Mutex<HashMap<String, TargetState>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TargetState>> {
        self.inner.lock().expect("target registry poisoned")
    }

    /// Register a target. Re-registering replaces credentials and aborts any
    /// scheduled retry, but keeps nothing else.
    pub fn insert(&self, target: Target) {
        let mut inner = self.lock();
        if let Some(old) = inner.insert(
            target.id.clone(),
            TargetState {
                target,
                session_id: None,
                session_created_at: None,
                last_poll: None,
                error: None,
                creating: false,
                retry: None,
            },
        ) {
            if let Some(handle) = old.retry {
                handle.abort();
            }
        }
    }

    /// Remove a target, returning its credentials and any live session ID.
    pub fn remove(&self, target_id: &str) -> Option<(Target, Option<String>)> {
        let state = self.lock().remove(target_id)?;
        if let Some(handle) = state.retry {
            handle.abort();
        }
        Some((state.target, state.session_id))
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.lock().contains_key(target_id)
    }

    pub fn target(&self, target_id: &str) -> Option<Target> {
        self.lock().get(target_id).map(|s| s.target.clone())
    }

    pub fn session_id(&self, target_id: &str) -> Option<String> {
        self.lock().get(target_id)?.session_id.clone()
    }

    pub fn set_session(&self, target_id: &str, session_id: &str) {
        if let Some(state) = self.lock().get_mut(target_id) {
            state.session_id = Some(session_id.to_string());
            state.session_created_at = Some(Utc::now());
            state.error = None;
        }
    }

    /// Clear the in-memory session, returning the old ID if there was one.
    pub fn clear_session(&self, target_id: &str) -> Option<String> {
        self.lock().get_mut(target_id)?.session_id.take()
    }

    pub fn set_error(&self, target_id: &str, message: &str) {
        if let Some(state) = self.lock().get_mut(target_id) {
            state.error = Some(message.to_string());
        }
    }

    pub fn clear_error(&self, target_id: &str) {
        if let Some(state) = self.lock().get_mut(target_id) {
            state.error = None;
        }
    }

    pub fn touch_poll(&self, target_id: &str) {
        if let Some(state) = self.lock().get_mut(target_id) {
            state.last_poll = Some(Utc::now());
        }
    }

    /// Claim the right to create a session for a target. Returns false when
    /// the target is gone, already has a session, or another create is in
    /// flight. At most one upstream session per target hinges on this.
    pub fn begin_session_create(&self, target_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.get_mut(target_id) {
            Some(state) if state.session_id.is_none() && !state.creating => {
                state.creating = true;
                true
            }
            _ => false,
        }
    }

    pub fn end_session_create(&self, target_id: &str) {
        if let Some(state) = self.lock().get_mut(target_id) {
            state.creating = false;
        }
    }

    /// Install a background retry task, aborting any previous one.
    pub fn set_retry(&self, target_id: &str, handle: JoinHandle<()>) {
        let mut inner = self.lock();
        match inner.get_mut(target_id) {
            Some(state) => {
                if let Some(old) = state.retry.replace(handle) {
                    old.abort();
                }
            }
            // Target removed while the task was being spawned.
            None => handle.abort(),
        }
    }

    pub fn clear_retry(&self, target_id: &str) {
        if let Some(state) = self.lock().get_mut(target_id) {
            state.retry = None;
        }
    }

    pub fn abort_all_retries(&self) {
        for state in self.lock().values_mut() {
            if let Some(handle) = state.retry.take() {
                handle.abort();
            }
        }
    }

    /// Enabled targets that currently hold an upstream session.
    pub fn enabled_with_session(&self) -> Vec<(Target, String)> {
        self.lock()
            .values()
            .filter(|s| s.target.enabled)
            .filter_map(|s| {
                s.session_id
                    .as_ref()
                    .map(|sid| (s.target.clone(), sid.clone()))
            })
            .collect()
    }

    /// Enabled targets with no upstream session yet.
    pub fn enabled_without_session(&self) -> Vec<Target> {
        self.lock()
            .values()
            .filter(|s| s.target.enabled && s.session_id.is_none())
            .map(|s| s.target.clone())
            .collect()
    }

    /// Fallback target for worker requests that carry no session binding.
    pub fn first_enabled_with_session(&self) -> Option<(Target, String)> {
        let inner = self.lock();
        let mut candidates: Vec<_> = inner
            .values()
            .filter(|s| s.target.enabled && s.session_id.is_some())
            .collect();
        candidates.sort_by(|a, b| a.target.id.cmp(&b.target.id));
        candidates.first().map(|s| {
            (
                s.target.clone(),
                s.session_id.clone().unwrap_or_default(),
            )
        })
    }

    /// Take every live session for shutdown deletion.
    pub fn take_all_sessions(&self) -> Vec<(Target, String)> {
        self.lock()
            .values_mut()
            .filter_map(|s| {
                s.session_id
                    .take()
                    .map(|sid| (s.target.clone(), sid))
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Status snapshot; `jobs_assigned` is looked up per target.
    pub fn status(&self, jobs_assigned: impl Fn(&str) -> usize) -> Vec<TargetStatus> {
        let mut statuses: Vec<TargetStatus> = self
            .lock()
            .values()
            .map(|s| TargetStatus {
                target_id: s.target.id.clone(),
                registered: true,
                session_active: s.session_id.is_some(),
                last_poll: s.last_poll,
                jobs_assigned: jobs_assigned(&s.target.id),
                error: s.error.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{OAuthCredentials, RsaParameters, RunnerFile};

    pub(crate) fn target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            display_name: id.to_string(),
            enabled: true,
            runner: RunnerFile {
                server_url_v2: format!("https://broker.example/{}/", id),
                agent_id: 1,
                agent_name: "agent".into(),
            },
            oauth: OAuthCredentials {
                client_id: "client".into(),
                authorization_url: "https://auth.example/token".into(),
            },
            rsa: RsaParameters {
                d: vec![],
                p: vec![],
                q: vec![],
                dp: vec![],
                dq: vec![],
                inverse_q: vec![],
                modulus: vec![],
                exponent: vec![],
            },
        }
    }

    #[test]
    fn test_insert_and_session_lifecycle() {
        let registry = TargetRegistry::new();
        registry.insert(target("t1"));

        assert!(registry.contains("t1"));
        assert!(registry.session_id("t1").is_none());

        registry.set_session("t1", "up-1");
        assert_eq!(registry.session_id("t1").as_deref(), Some("up-1"));
        assert_eq!(registry.enabled_with_session().len(), 1);
        assert!(registry.enabled_without_session().is_empty());

        assert_eq!(registry.clear_session("t1").as_deref(), Some("up-1"));
        assert!(registry.session_id("t1").is_none());
    }

    #[test]
    fn test_remove_returns_session() {
        let registry = TargetRegistry::new();
        registry.insert(target("t1"));
        registry.set_session("t1", "up-1");

        let (removed, session) = registry.remove("t1").unwrap();
        assert_eq!(removed.id, "t1");
        assert_eq!(session.as_deref(), Some("up-1"));
        assert!(!registry.contains("t1"));
    }

    #[test]
    fn test_set_session_clears_error() {
        let registry = TargetRegistry::new();
        registry.insert(target("t1"));
        registry.set_error("t1", "boom");
        registry.set_session("t1", "up-1");

        let statuses = registry.status(|_| 0);
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].session_active);
        assert!(statuses[0].error.is_none());
    }

    #[test]
    fn test_first_enabled_with_session_is_stable() {
        let registry = TargetRegistry::new();
        registry.insert(target("b"));
        registry.insert(target("a"));
        registry.set_session("a", "up-a");
        registry.set_session("b", "up-b");

        let (chosen, _) = registry.first_enabled_with_session().unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[test]
    fn test_disabled_targets_excluded() {
        let registry = TargetRegistry::new();
        let mut disabled = target("t1");
        disabled.enabled = false;
        registry.insert(disabled);
        registry.set_session("t1", "up-1");

        assert!(registry.enabled_with_session().is_empty());
        assert!(registry.first_enabled_with_session().is_none());
    }

    #[test]
    fn test_session_create_guard_is_exclusive() {
        let registry = TargetRegistry::new();
        registry.insert(target("t1"));

        assert!(registry.begin_session_create("t1"));
        assert!(!registry.begin_session_create("t1"));

        registry.end_session_create("t1");
        assert!(registry.begin_session_create("t1"));

        registry.set_session("t1", "up-1");
        registry.end_session_create("t1");
        assert!(!registry.begin_session_create("t1"));

        assert!(!registry.begin_session_create("missing"));
    }

    #[test]
    fn test_take_all_sessions_drains() {
        let registry = TargetRegistry::new();
        registry.insert(target("t1"));
        registry.insert(target("t2"));
        registry.set_session("t1", "up-1");

        let sessions = registry.take_all_sessions();
        assert_eq!(sessions.len(), 1);
        assert!(registry.session_id("t1").is_none());
    }

    #[test]
    fn test_status_sorted_and_counted() {
        let registry = TargetRegistry::new();
        registry.insert(target("t2"));
        registry.insert(target("t1"));
        registry.set_session("t1", "up-1");
        registry.touch_poll("t1");

        let statuses = registry.status(|id| if id == "t1" { 3 } else { 0 });
        assert_eq!(statuses[0].target_id, "t1");
        assert_eq!(statuses[0].jobs_assigned, 3);
        assert!(statuses[0].last_poll.is_some());
        assert_eq!(statuses[1].target_id, "t2");
        assert!(!statuses[1].session_active);
    }
}
