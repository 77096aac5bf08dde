//! Shared mutable broker state.
//!
//! Local worker sessions, the pending-assignment queue, the per-target
//! message queues, the seen-ID set and the job tracker are all touched from
//! HTTP handlers and the polling loop, so they live behind one mutex with
//! narrow methods. None of these methods await; the lock is never held
//! across a suspension point.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::jobs::{JobAssignment, JobTracker};
use crate::broker::queue::{MessageQueue, SeenMessageIds};

/// A worker-facing session minted by the local server.
#[derive(Debug, Clone)]
pub struct LocalSession {
    pub created_at: DateTime<Utc>,
    /// Target this worker is reserved for; None if the worker was started
    /// preemptively with no pending assignment.
    pub target_id: Option<String>,
    /// Set when a job message is delivered. A session holding a job never
    /// receives another; workers execute one job then exit.
    pub current_job_id: Option<String>,
}

#[derive(Debug)]
struct Inner {
    local_sessions: HashMap<Uuid, LocalSession>,
    pending_assignments: VecDeque<String>,
    queues: MessageQueue,
    seen: SeenMessageIds,
    jobs: JobTracker,
}

/// Single owner of the shared maps, per the one-lock concurrency model.
#[derive(Debug)]
pub struct BrokerState {
    inner: Mutex<Inner>,
}

impl BrokerState {
    pub fn new(seen_cap: usize, seen_prune: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                local_sessions: HashMap::new(),
                pending_assignments: VecDeque::new(),
                queues: MessageQueue::new(),
                seen: SeenMessageIds::new(seen_cap, seen_prune),
                jobs: JobTracker::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("broker state poisoned")
    }

    // ---- local sessions ----------------------------------------------------

    /// Mint a local session, consuming the head of the pending-assignment
    /// queue as its target binding (if any).
    pub fn create_local_session(&self) -> (Uuid, Option<String>) {
        let mut inner = self.lock();
        let target_id = inner.pending_assignments.pop_front();
        let id = Uuid::new_v4();
        inner.local_sessions.insert(
            id,
            LocalSession {
                created_at: Utc::now(),
                target_id: target_id.clone(),
                current_job_id: None,
            },
        );
        (id, target_id)
    }

    pub fn local_session(&self, id: &Uuid) -> Option<LocalSession> {
        self.lock().local_sessions.get(id).cloned()
    }

    pub fn remove_local_session(&self, id: &Uuid) -> bool {
        self.lock().local_sessions.remove(id).is_some()
    }

    pub fn close_all_local_sessions(&self) {
        self.lock().local_sessions.clear();
    }

    /// Bind a delivered job to its worker session and record the worker on
    /// the assignment. The binding happens at most once per session.
    pub fn deliver_job(&self, session_id: &Uuid, job_id: &str) {
        let mut inner = self.lock();
        if let Some(session) = inner.local_sessions.get_mut(session_id) {
            if session.current_job_id.is_none() {
                session.current_job_id = Some(job_id.to_string());
            }
        }
        inner.jobs.assign_worker(job_id, &session_id.to_string());
    }

    // ---- pending assignments ----------------------------------------------

    pub fn push_pending_assignment(&self, target_id: &str) {
        self.lock()
            .pending_assignments
            .push_back(target_id.to_string());
    }

    pub fn pending_assignments(&self) -> usize {
        self.lock().pending_assignments.len()
    }

    // ---- message queues ----------------------------------------------------

    pub fn enqueue_message(&self, target_id: &str, payload: String) {
        self.lock().queues.enqueue(target_id, payload);
    }

    pub fn dequeue_message(&self, target_id: &str) -> Option<String> {
        self.lock().queues.dequeue(target_id)
    }

    pub fn has_queued_messages(&self) -> bool {
        self.lock().queues.any_pending()
    }

    /// First queued payload with its target, without consuming it.
    pub fn queued_job(&self) -> Option<(String, String)> {
        let inner = self.lock();
        inner
            .queues
            .first_pending()
            .map(|(target, payload)| (target.clone(), payload.clone()))
    }

    // ---- seen message IDs --------------------------------------------------

    pub fn seen_message(&self, message_id: &str) -> bool {
        self.lock().seen.contains(message_id)
    }

    pub fn mark_message_seen(&self, message_id: &str) {
        self.lock().seen.mark(message_id);
    }

    // ---- jobs ---------------------------------------------------------------

    pub fn job_tracked(&self, job_id: &str) -> bool {
        self.lock().jobs.has(job_id)
    }

    pub fn track_job(&self, assignment: JobAssignment) {
        self.lock().jobs.track(assignment);
    }

    pub fn remove_job(&self, key: &str) -> Option<JobAssignment> {
        self.lock().jobs.remove(key)
    }

    pub fn set_run_service_url(&self, key: &str, url: &str) {
        self.lock().jobs.set_run_service_url(key, url);
    }

    pub fn run_service_url(&self, key: &str) -> Option<String> {
        self.lock().jobs.run_service_url(key).cloned()
    }

    pub fn set_acquired_details(&self, key: &str, body: &str) {
        self.lock().jobs.set_acquired_details(key, body);
    }

    pub fn acquired_details(&self, key: &str) -> Option<String> {
        self.lock().jobs.acquired_details(key).cloned()
    }

    pub fn jobs_assigned(&self, target_id: &str) -> usize {
        self.lock().jobs.jobs_for_target(target_id).len()
    }

    pub fn tracked_job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Drop all queued messages, jobs and pending assignments for a target.
    pub fn clear_target(&self, target_id: &str) {
        let mut inner = self.lock();
        inner.queues.clear(target_id);
        inner.jobs.clear_target(target_id);
        inner.pending_assignments.retain(|t| t != target_id);
    }

    /// Drain all job state (clean shutdown).
    pub fn clear_jobs(&self) {
        self.lock().jobs.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BrokerState {
        BrokerState::new(100, 10)
    }

    #[test]
    fn test_session_consumes_one_pending_assignment() {
        let state = state();
        state.push_pending_assignment("t1");
        state.push_pending_assignment("t2");

        let (s1, target1) = state.create_local_session();
        let (s2, target2) = state.create_local_session();
        let (_s3, target3) = state.create_local_session();

        assert_eq!(target1.as_deref(), Some("t1"));
        assert_eq!(target2.as_deref(), Some("t2"));
        assert_eq!(target3, None);
        assert_ne!(s1, s2);
        assert_eq!(state.pending_assignments(), 0);
    }

    #[test]
    fn test_new_session_has_no_job() {
        let state = state();
        let (id, _) = state.create_local_session();
        let session = state.local_session(&id).unwrap();
        assert!(session.current_job_id.is_none());
    }

    #[test]
    fn test_deliver_job_binds_once() {
        let state = state();
        state.push_pending_assignment("t1");
        let (id, _) = state.create_local_session();

        state.deliver_job(&id, "j1");
        state.deliver_job(&id, "j2");

        let session = state.local_session(&id).unwrap();
        assert_eq!(session.current_job_id.as_deref(), Some("j1"));
    }

    #[test]
    fn test_clear_target_scrubs_everything() {
        let state = state();
        state.push_pending_assignment("t1");
        state.push_pending_assignment("t2");
        state.enqueue_message("t1", "payload".into());
        state.track_job(JobAssignment {
            job_id: "j1".into(),
            message_id: None,
            target_id: "t1".into(),
            session_id: "up".into(),
            worker_id: None,
            assigned_at: Utc::now(),
        });

        state.clear_target("t1");

        assert!(!state.has_queued_messages());
        assert!(!state.job_tracked("j1"));
        assert_eq!(state.pending_assignments(), 1);
    }

    #[test]
    fn test_remove_local_session() {
        let state = state();
        let (id, _) = state.create_local_session();
        assert!(state.remove_local_session(&id));
        assert!(!state.remove_local_session(&id));
        assert!(state.local_session(&id).is_none());
    }
}
