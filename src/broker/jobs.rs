//! Tracking of acquired jobs and their upstream service URLs.
//!
//! The worker's `acquirejob` addresses a job by its upstream message ID
//! while later lifecycle calls use the job ID from the job body, so the
//! URL and detail maps are double-keyed under both.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A job claimed upstream and owed to exactly one local worker.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub job_id: String,
    /// Upstream message ID the job arrived under (string: may exceed 2^53).
    pub message_id: Option<String>,
    pub target_id: String,
    /// Upstream session the job was polled on.
    pub session_id: String,
    /// Local session UUID of the worker the job was delivered to.
    pub worker_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

/// In-memory registry of acquired jobs.
#[derive(Debug, Default)]
pub struct JobTracker {
    assignments: HashMap<String, JobAssignment>,
    run_service_urls: HashMap<String, String>,
    acquired_details: HashMap<String, String>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, assignment: JobAssignment) {
        self.assignments
            .insert(assignment.job_id.clone(), assignment);
    }

    pub fn has(&self, job_id: &str) -> bool {
        self.assignments.contains_key(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<&JobAssignment> {
        self.assignments.get(job_id)
    }

    /// Record the worker a job was delivered to.
    pub fn assign_worker(&mut self, job_id: &str, worker_id: &str) {
        if let Some(assignment) = self.assignments.get_mut(job_id) {
            assignment.worker_id = Some(worker_id.to_string());
        }
    }

    /// Remove a job and both keys of its URL and detail entries.
    ///
    /// `key` may be either the job ID or the message ID.
    pub fn remove(&mut self, key: &str) -> Option<JobAssignment> {
        let job_id = if self.assignments.contains_key(key) {
            key.to_string()
        } else {
            self.assignments
                .values()
                .find(|a| a.message_id.as_deref() == Some(key))?
                .job_id
                .clone()
        };

        let assignment = self.assignments.remove(&job_id)?;
        self.run_service_urls.remove(&job_id);
        self.acquired_details.remove(&job_id);
        if let Some(message_id) = &assignment.message_id {
            self.run_service_urls.remove(message_id);
            self.acquired_details.remove(message_id);
        }
        Some(assignment)
    }

    pub fn set_run_service_url(&mut self, key: &str, url: &str) {
        self.run_service_urls.insert(key.to_string(), url.to_string());
    }

    pub fn run_service_url(&self, key: &str) -> Option<&String> {
        self.run_service_urls.get(key)
    }

    pub fn set_acquired_details(&mut self, key: &str, body: &str) {
        self.acquired_details.insert(key.to_string(), body.to_string());
    }

    pub fn acquired_details(&self, key: &str) -> Option<&String> {
        self.acquired_details.get(key)
    }

    pub fn jobs_for_target(&self, target_id: &str) -> Vec<&JobAssignment> {
        self.assignments
            .values()
            .filter(|a| a.target_id == target_id)
            .collect()
    }

    /// Drop every job and keyed entry belonging to a target.
    pub fn clear_target(&mut self, target_id: &str) {
        let job_ids: Vec<String> = self
            .assignments
            .values()
            .filter(|a| a.target_id == target_id)
            .map(|a| a.job_id.clone())
            .collect();
        for job_id in job_ids {
            self.remove(&job_id);
        }
    }

    pub fn clear_all(&mut self) {
        self.assignments.clear();
        self.run_service_urls.clear();
        self.acquired_details.clear();
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(job_id: &str, message_id: &str, target_id: &str) -> JobAssignment {
        JobAssignment {
            job_id: job_id.to_string(),
            message_id: Some(message_id.to_string()),
            target_id: target_id.to_string(),
            session_id: "up-1".to_string(),
            worker_id: None,
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn test_track_and_lookup() {
        let mut tracker = JobTracker::new();
        tracker.track(assignment("j1", "m1", "t1"));

        assert!(tracker.has("j1"));
        assert!(!tracker.has("j2"));
        assert_eq!(tracker.get("j1").unwrap().target_id, "t1");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_double_keyed_url_and_details() {
        let mut tracker = JobTracker::new();
        tracker.track(assignment("j1", "m1", "t1"));
        tracker.set_run_service_url("j1", "https://rs.example/");
        tracker.set_run_service_url("m1", "https://rs.example/");
        tracker.set_acquired_details("j1", "{\"ok\":true}");
        tracker.set_acquired_details("m1", "{\"ok\":true}");

        assert_eq!(
            tracker.run_service_url("j1").map(String::as_str),
            Some("https://rs.example/")
        );
        assert_eq!(
            tracker.run_service_url("m1").map(String::as_str),
            Some("https://rs.example/")
        );
        assert!(tracker.acquired_details("m1").is_some());
    }

    #[test]
    fn test_remove_clears_both_keys() {
        let mut tracker = JobTracker::new();
        tracker.track(assignment("j1", "m1", "t1"));
        tracker.set_run_service_url("j1", "u");
        tracker.set_run_service_url("m1", "u");
        tracker.set_acquired_details("j1", "d");
        tracker.set_acquired_details("m1", "d");

        let removed = tracker.remove("j1").unwrap();
        assert_eq!(removed.job_id, "j1");
        assert!(tracker.run_service_url("j1").is_none());
        assert!(tracker.run_service_url("m1").is_none());
        assert!(tracker.acquired_details("m1").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_remove_by_message_id() {
        let mut tracker = JobTracker::new();
        tracker.track(assignment("j1", "m1", "t1"));
        assert_eq!(tracker.remove("m1").unwrap().job_id, "j1");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_clear_target_is_scoped() {
        let mut tracker = JobTracker::new();
        tracker.track(assignment("j1", "m1", "t1"));
        tracker.track(assignment("j2", "m2", "t2"));
        tracker.set_run_service_url("j1", "u1");

        tracker.clear_target("t1");
        assert!(!tracker.has("j1"));
        assert!(tracker.run_service_url("j1").is_none());
        assert!(tracker.has("j2"));
        assert_eq!(tracker.jobs_for_target("t2").len(), 1);
    }

    #[test]
    fn test_assign_worker() {
        let mut tracker = JobTracker::new();
        tracker.track(assignment("j1", "m1", "t1"));
        tracker.assign_worker("j1", "local-session-uuid");
        assert_eq!(
            tracker.get("j1").unwrap().worker_id.as_deref(),
            Some("local-session-uuid")
        );
    }
}
