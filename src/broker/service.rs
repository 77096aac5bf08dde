//! Broker proxy service orchestration.
//!
//! Owns the shared state, the worker-facing server, the upstream polling
//! loop and the target lifecycle. The polling pipeline claims every new job
//! upstream before a worker can see it, so the provider stops redelivering
//! the moment the proxy commits to running it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use chrono::Utc;
use serde_json::Value;

use crate::auth::TokenManager;
use crate::broker::events::{AcceptAll, AdmissionPolicy, NoopEvents, ProxyEvents, TargetStatus};
use crate::broker::jobs::JobAssignment;
use crate::broker::payload;
use crate::broker::server::LocalServer;
use crate::broker::session_store::SessionStore;
use crate::broker::state::BrokerState;
use crate::broker::targets::TargetRegistry;
use crate::broker::upstream::UpstreamClient;
use crate::config::ProxyConfig;
use crate::credentials::Target;
use crate::error::Result;

/// Instance key written to the session store. Carried opaquely; this proxy
/// runs one upstream session per target.
const SESSION_INSTANCE: &str = "0";

/// Everything the server handlers, poll loop and retry tasks share.
pub struct ProxyShared {
    pub config: ProxyConfig,
    pub http: reqwest::Client,
    pub state: BrokerState,
    pub targets: TargetRegistry,
    pub tokens: Arc<TokenManager>,
    pub upstream: UpstreamClient,
    pub session_store: SessionStore,
    events: std::sync::RwLock<Arc<dyn ProxyEvents>>,
    admission: std::sync::RwLock<Arc<dyn AdmissionPolicy>>,
    shutting_down: AtomicBool,
    bound_port: AtomicU16,
}

impl ProxyShared {
    fn new(config: ProxyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;
        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            config.jwt_lifetime,
            config.token_refresh_margin,
        ));
        let upstream = UpstreamClient::new(&config, http.clone(), tokens.clone());
        let session_store = SessionStore::new(&config.runner_dir);
        let state = BrokerState::new(config.seen_cap, config.seen_prune);

        Ok(Self {
            config,
            http,
            state,
            targets: TargetRegistry::new(),
            tokens,
            upstream,
            session_store,
            events: std::sync::RwLock::new(Arc::new(NoopEvents)),
            admission: std::sync::RwLock::new(Arc::new(AcceptAll)),
            shutting_down: AtomicBool::new(false),
            bound_port: AtomicU16::new(0),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn set_bound_port(&self, port: u16) {
        self.bound_port.store(port, Ordering::SeqCst);
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    /// Loopback base URL rewritten into every outbound job payload.
    pub fn proxy_base_url(&self) -> String {
        format!("http://localhost:{}/", self.bound_port())
    }

    pub(crate) fn events(&self) -> Arc<dyn ProxyEvents> {
        self.events.read().expect("events lock poisoned").clone()
    }

    pub(crate) fn admission(&self) -> Arc<dyn AdmissionPolicy> {
        self.admission.read().expect("admission lock poisoned").clone()
    }

    /// Status snapshot for every registered target.
    pub fn status(&self) -> Vec<TargetStatus> {
        self.targets.status(|target_id| self.state.jobs_assigned(target_id))
    }

    pub(crate) fn emit_status(&self) {
        let statuses = self.status();
        self.events().status_update(&statuses);
    }
}

/// The multi-target broker proxy.
pub struct BrokerProxyService {
    shared: Arc<ProxyShared>,
    server: LocalServer,
    running: AtomicBool,
    poll_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    is_polling: Arc<AtomicBool>,
}

impl BrokerProxyService {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(ProxyShared::new(config)?),
            server: LocalServer::new(),
            running: AtomicBool::new(false),
            poll_task: std::sync::Mutex::new(None),
            is_polling: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Install an event observer (replaces the default no-op).
    pub fn set_events(&self, events: Arc<dyn ProxyEvents>) {
        *self.shared.events.write().expect("events lock poisoned") = events;
    }

    /// Install a capacity admission policy (replaces accept-all).
    pub fn set_admission(&self, admission: Arc<dyn AdmissionPolicy>) {
        *self
            .shared
            .admission
            .write()
            .expect("admission lock poisoned") = admission;
    }

    /// Register a target. If the service is running and the target is
    /// enabled, an upstream session is created in the background.
    pub fn add_target(&self, target: Target) {
        tracing::info!(target_id = %target.id, name = %target.display_name, "Target registered");
        let enabled = target.enabled;
        let target_id = target.id.clone();
        self.shared.targets.insert(target);

        if enabled && self.is_running() && !self.shared.is_shutting_down() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Some(target) = shared.targets.target(&target_id) {
                    ensure_session(&shared, &target).await;
                }
            });
        }
    }

    /// Remove a target: best-effort upstream session delete, then drop all
    /// in-memory state for it.
    pub fn remove_target(&self, target_id: &str) {
        let Some((target, session_id)) = self.shared.targets.remove(target_id) else {
            return;
        };
        tracing::info!(target_id = %target.id, "Target removed");

        if let Some(session_id) = session_id {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.upstream.delete_session(&target, &session_id).await;
                shared.session_store.remove(&target.id, SESSION_INSTANCE);
            });
        } else {
            self.shared.session_store.remove(target_id, SESSION_INSTANCE);
        }

        self.shared.state.clear_target(target_id);
        self.shared.tokens.invalidate(target_id);
        self.shared.emit_status();
    }

    /// Boot the listener, reclaim stale upstream sessions, create sessions
    /// for all enabled targets, then launch the polling loop. Idempotent
    /// while running.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.shutting_down.store(false, Ordering::SeqCst);

        if let Err(e) = self.server.start(self.shared.clone()).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        cleanup_stale_sessions(&self.shared).await;

        let mut creates = tokio::task::JoinSet::new();
        for target in self.shared.targets.enabled_without_session() {
            let shared = self.shared.clone();
            creates.spawn(async move { ensure_session(&shared, &target).await });
        }
        while creates.join_next().await.is_some() {}

        *self.poll_task.lock().expect("poll task lock poisoned") = Some(self.spawn_poll_loop());
        self.shared.emit_status();
        tracing::info!(port = self.shared.bound_port(), "Broker proxy started");
        Ok(())
    }

    /// Stop the service: break worker long-polls, cancel retries, stop
    /// polling, fire-and-forget upstream session deletes, close the server.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.targets.abort_all_retries();

        if let Some(handle) = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .take()
        {
            handle.abort();
        }

        for (target, session_id) in self.shared.targets.take_all_sessions() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.upstream.delete_session(&target, &session_id).await;
                shared.session_store.remove(&target.id, SESSION_INSTANCE);
            });
        }

        self.shared.state.clear_jobs();
        self.shared.state.close_all_local_sessions();
        self.server.stop().await;
        tracing::info!("Broker proxy stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound listener port (0 before start).
    pub fn port(&self) -> u16 {
        self.shared.bound_port()
    }

    pub fn status(&self) -> Vec<TargetStatus> {
        self.shared.status()
    }

    pub fn has_queued_jobs(&self) -> bool {
        self.shared.state.has_queued_messages()
    }

    /// First queued payload with its target, without consuming it.
    pub fn queued_job(&self) -> Option<(String, String)> {
        self.shared.state.queued_job()
    }

    /// Shared handle for tests and embedders.
    pub fn shared(&self) -> Arc<ProxyShared> {
        self.shared.clone()
    }

    fn spawn_poll_loop(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        let is_polling = self.is_polling.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if shared.is_shutting_down() {
                    break;
                }
                // A slow sweep skips the next tick rather than overlapping it.
                if is_polling.swap(true, Ordering::SeqCst) {
                    continue;
                }

                let shared = shared.clone();
                let is_polling = is_polling.clone();
                tokio::spawn(async move {
                    poll_all_targets(&shared).await;
                    is_polling.store(false, Ordering::SeqCst);
                });
            }
        })
    }
}

/// Poll every enabled, sessioned target concurrently and run each returned
/// message through the acquisition pipeline.
async fn poll_all_targets(shared: &Arc<ProxyShared>) {
    let targets = shared.targets.enabled_with_session();
    if targets.is_empty() {
        return;
    }

    let mut polls = tokio::task::JoinSet::new();
    for (target, session_id) in targets {
        let shared = shared.clone();
        polls.spawn(async move {
            let result = shared.upstream.poll_message(&target, &session_id).await;
            (target, session_id, result)
        });
    }

    while let Some(joined) = polls.join_next().await {
        let Ok((target, session_id, result)) = joined else {
            continue;
        };
        shared.targets.touch_poll(&target.id);

        match result {
            Ok(Some(body)) => {
                shared.targets.clear_error(&target.id);
                process_message(shared, &target, &session_id, &body).await;
            }
            Ok(None) => {
                shared.targets.clear_error(&target.id);
            }
            Err(e) => {
                if !shared.is_shutting_down() {
                    tracing::warn!(target_id = %target.id, "Poll failed: {}", e);
                    shared.targets.set_error(&target.id, &e.to_string());
                    shared.events().error(&target.id, &e.to_string());
                }
            }
        }
    }

    shared.emit_status();
}

/// Run one upstream message through dedup, admission, acquisition, rewrite
/// and enqueue.
async fn process_message(shared: &Arc<ProxyShared>, target: &Target, session_id: &str, raw: &str) {
    let parsed = match payload::parse_message(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(target_id = %target.id, "Discarding unreadable message: {}", e);
            return;
        }
    };

    if let Some(message_id) = &parsed.message_id {
        if shared.state.seen_message(message_id) {
            tracing::debug!(target_id = %target.id, message_id = %message_id, "Duplicate message ignored");
            return;
        }
    }

    let Some(inner) = parsed.inner else {
        tracing::warn!(
            target_id = %target.id,
            message_type = parsed.message_type.as_deref().unwrap_or("?"),
            "Discarding message with unreadable body"
        );
        return;
    };

    match payload::job_id(&inner) {
        Some(job_id) => {
            if shared.state.job_tracked(&job_id) {
                tracing::debug!(target_id = %target.id, job = %job_id, "Job already tracked; ignoring redelivery");
                if let Some(message_id) = &parsed.message_id {
                    shared.state.mark_message_seen(message_id);
                }
                return;
            }
            // At capacity: leave the message unacknowledged and unseen so
            // the broker redelivers once there is room.
            if !shared.admission().can_accept_job() {
                tracing::debug!(target_id = %target.id, job = %job_id, "At capacity; leaving job for redelivery");
                return;
            }

            handle_job_message(shared, target, session_id, &parsed.message_id, job_id, inner, parsed.outer)
                .await;
        }
        None => {
            tracing::debug!(
                target_id = %target.id,
                message_type = parsed.message_type.as_deref().unwrap_or("?"),
                "Relaying control message"
            );
            shared.state.enqueue_message(&target.id, raw.to_string());
        }
    }

    if let Some(message_id) = &parsed.message_id {
        shared.upstream.acknowledge(target, session_id, message_id).await;
        shared.state.mark_message_seen(message_id);
    }
}

/// Claim a job upstream, rewrite its payload at the proxy and queue it for
/// a worker. Acquisition strictly precedes enqueue so a worker never sees a
/// job the proxy has not claimed.
async fn handle_job_message(
    shared: &Arc<ProxyShared>,
    target: &Target,
    session_id: &str,
    message_id: &Option<String>,
    job_id: String,
    mut inner: Value,
    mut outer: Value,
) {
    let run_service_url = payload::run_service_url(&inner);
    let billing_owner = payload::billing_owner(&inner);

    if let Some(url) = &run_service_url {
        shared.state.set_run_service_url(&job_id, url);
        if let Some(message_id) = message_id {
            shared.state.set_run_service_url(message_id, url);
        }

        match shared
            .upstream
            .acquire_job(target, session_id, url, &job_id, billing_owner.as_deref())
            .await
        {
            Some(body) => {
                shared.state.set_acquired_details(&job_id, &body);
                if let Some(message_id) = message_id {
                    shared.state.set_acquired_details(message_id, &body);
                }
            }
            // The job is still offered; the worker's own acquire will 404
            // and fail the job gracefully.
            None => tracing::warn!(target_id = %target.id, job = %job_id, "Upstream acquire yielded no body"),
        }
    } else {
        tracing::warn!(target_id = %target.id, job = %job_id, "Job message carries no run service URL");
    }

    payload::rewrite_run_service_url(&mut inner, &shared.proxy_base_url());
    if let Some(map) = outer.as_object_mut() {
        map.insert("body".to_string(), Value::String(inner.to_string()));
    }

    shared.state.enqueue_message(&target.id, outer.to_string());
    shared.state.push_pending_assignment(&target.id);
    shared.state.track_job(JobAssignment {
        job_id: job_id.clone(),
        message_id: message_id.clone(),
        target_id: target.id.clone(),
        session_id: session_id.to_string(),
        worker_id: None,
        assigned_at: Utc::now(),
    });

    tracing::info!(target_id = %target.id, job = %job_id, "Job acquired and queued");
    shared.events().job_received(&target.id, &job_id);
}

/// Create upstream sessions for every enabled target that lacks one.
pub(crate) async fn ensure_sessions(shared: &Arc<ProxyShared>) {
    for target in shared.targets.enabled_without_session() {
        ensure_session(shared, &target).await;
    }
}

/// Make sure a target has an upstream session, scheduling the background
/// retry cadence on failure. Returns whether a session exists afterwards.
pub(crate) async fn ensure_session(shared: &Arc<ProxyShared>, target: &Target) -> bool {
    if shared.is_shutting_down() {
        return false;
    }
    if create_session_guarded(shared, target).await {
        return true;
    }
    if shared.targets.contains(&target.id) && !shared.is_shutting_down() {
        schedule_session_retry(shared.clone(), target.clone());
    }
    false
}

/// One guarded create attempt. Returns whether the target holds a session
/// afterwards (created here or by a concurrent flow).
async fn create_session_guarded(shared: &Arc<ProxyShared>, target: &Target) -> bool {
    if !shared.targets.begin_session_create(&target.id) {
        return shared.targets.session_id(&target.id).is_some();
    }

    let created = match shared.upstream.create_session(target).await {
        Ok(session_id) => {
            shared.targets.set_session(&target.id, &session_id);
            shared
                .session_store
                .save(&target.id, SESSION_INSTANCE, &session_id);
            tracing::info!(target_id = %target.id, session_id = %session_id, "Upstream session created");
            shared.emit_status();
            true
        }
        Err(e) => {
            if !shared.is_shutting_down() {
                tracing::error!(target_id = %target.id, "Failed to create upstream session: {}", e);
                shared.targets.set_error(&target.id, &e.to_string());
                shared.events().error(&target.id, &e.to_string());
                shared.emit_status();
            }
            false
        }
    };

    shared.targets.end_session_create(&target.id);
    created
}

/// Retry session creation on a fixed cadence until it sticks, the target
/// disappears, or the service shuts down.
fn schedule_session_retry(shared: Arc<ProxyShared>, target: Target) {
    let target_id = target.id.clone();
    let task_shared = shared.clone();

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(task_shared.config.session_retry_interval).await;
            if task_shared.is_shutting_down() || !task_shared.targets.contains(&target.id) {
                break;
            }
            if task_shared.targets.session_id(&target.id).is_some() {
                break;
            }
            tracing::debug!(target_id = %target.id, "Retrying upstream session create");
            if create_session_guarded(&task_shared, &target).await {
                break;
            }
        }
        task_shared.targets.clear_retry(&target.id);
    });

    shared.targets.set_retry(&target_id, handle);
}

/// Delete sessions left behind by a previous run, as recorded on disk.
async fn cleanup_stale_sessions(shared: &Arc<ProxyShared>) {
    let doc = shared.session_store.load();
    for (target_id, instances) in doc {
        let Some(target) = shared.targets.target(&target_id) else {
            continue;
        };
        for (instance, session_id) in instances {
            tracing::info!(
                target_id = %target_id,
                session_id = %session_id,
                "Reclaiming stale upstream session from previous run"
            );
            shared.upstream.delete_session(&target, &session_id).await;
            shared.session_store.remove(&target_id, &instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{OAuthCredentials, RsaParameters, RunnerFile};

    fn target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            display_name: id.to_string(),
            enabled: true,
            runner: RunnerFile {
                server_url_v2: "https://broker.example/".into(),
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

    fn service() -> BrokerProxyService {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::default()
            .with_port(0)
            .with_runner_dir(dir.keep());
        BrokerProxyService::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_remove_leaves_no_residual_state() {
        let service = service();
        service.add_target(target("t1"));
        assert_eq!(service.status().len(), 1);

        service.remove_target("t1");
        assert!(service.status().is_empty());
        assert!(!service.has_queued_jobs());
        assert_eq!(service.shared.state.tracked_job_count(), 0);
        assert_eq!(service.shared.state.pending_assignments(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_target_is_noop() {
        let service = service();
        service.remove_target("ghost");
        assert!(service.status().is_empty());
    }

    #[tokio::test]
    async fn test_queued_job_accessors() {
        let service = service();
        assert!(!service.has_queued_jobs());
        assert!(service.queued_job().is_none());

        service.shared.state.enqueue_message("t1", "payload".into());
        assert!(service.has_queued_jobs());
        let (target_id, payload) = service.queued_job().unwrap();
        assert_eq!(target_id, "t1");
        assert_eq!(payload, "payload");
        // Peeking does not consume.
        assert!(service.has_queued_jobs());
    }

    #[tokio::test]
    async fn test_status_reflects_sessions_and_errors() {
        let service = service();
        service.add_target(target("t1"));
        service.shared.targets.set_session("t1", "up-1");
        service.shared.targets.set_error("t1", "poll blew up");

        let statuses = service.status();
        let status = &statuses[0];
        assert!(status.registered);
        assert!(status.session_active);
        assert_eq!(status.error.as_deref(), Some("poll blew up"));
        assert_eq!(status.jobs_assigned, 0);
    }

    #[test]
    fn test_port_zero_before_start() {
        let service = service();
        assert_eq!(service.port(), 0);
        assert!(!service.is_running());
    }
}
