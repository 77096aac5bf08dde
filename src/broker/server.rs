//! Worker-facing HTTP server.
//!
//! Listens on loopback and speaks the single-target runner-broker protocol
//! to local workers:
//!
//! ```text
//! Worker ──► http://127.0.0.1:PORT ──► This server ──► Upstream brokers
//!                                          │
//!                                          ├─► /session     mint local session
//!                                          ├─► /message     long-poll queue
//!                                          ├─► /acquirejob  replay stored body
//!                                          ├─► /acknowledge local no-op
//!                                          └─► *            forward per-job
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broker::payload;
use crate::broker::service::{ProxyShared, ensure_sessions};
use crate::broker::upstream::join_url;
use crate::error::{ProxyError, Result};

/// Paths whose upstream base is the per-job run-service URL when known.
const JOB_ROUTES: &[&str] = &["/acquirejob", "/renewjob", "/finishjob", "/jobrequest"];

/// Worker-facing HTTP server.
pub struct LocalServer {
    addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: RwLock<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl LocalServer {
    pub fn new() -> Self {
        Self {
            addr: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Start listening on `127.0.0.1:<config.port>` (0 for auto-assign).
    pub async fn start(&self, shared: Arc<ProxyShared>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", shared.config.port))
            .await
            .map_err(|e| ProxyError::Server {
                reason: format!("failed to bind: {}", e),
            })?;

        let addr = listener.local_addr().map_err(|e| ProxyError::Server {
            reason: format!("failed to get local addr: {}", e),
        })?;

        *self.addr.write().await = Some(addr);
        shared.set_bound_port(addr.port());

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        tokio::spawn(async move {
            tracing::info!("Broker proxy listening on {}", addr);

            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let shared = shared.clone();

                                tokio::spawn(async move {
                                    let service = service_fn(move |req| {
                                        let shared = shared.clone();
                                        async move { handle_request(req, shared).await }
                                    });

                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        tracing::debug!("Worker connection error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Broker proxy server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Stop accepting connections.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        *self.addr.write().await = None;
    }

    /// Address the server is bound to, if running.
    pub async fn addr(&self) -> Option<SocketAddr> {
        *self.addr.read().await
    }
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new()
    }
}

type HandlerResponse = std::result::Result<Response<BoxBody<Bytes, Infallible>>, Infallible>;

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    shared: Arc<ProxyShared>,
) -> HandlerResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::POST, "/session") => create_session(&shared).await,
        (Method::GET, "/message") => poll_message(req, &shared).await,
        (Method::DELETE, "/session") => delete_session(req, &shared),
        (Method::POST, "/acquirejob") => replay_acquire(req, &shared).await,
        (Method::POST, "/acknowledge") => json_response(StatusCode::OK, "{}"),
        _ => forward(req, &shared).await,
    };

    Ok(response)
}

/// POST /session: mint a local session bound to the next pending target.
async fn create_session(shared: &Arc<ProxyShared>) -> Response<BoxBody<Bytes, Infallible>> {
    let (session_id, target_id) = shared.state.create_local_session();

    match &target_id {
        Some(target_id) => {
            tracing::info!(session = %session_id, target_id = %target_id, "Worker session bound")
        }
        None => tracing::info!(session = %session_id, "Worker session created with no pending assignment"),
    }

    // A worker showing up is a good moment to repair missing upstream
    // sessions for other targets.
    let shared = shared.clone();
    tokio::spawn(async move { ensure_sessions(&shared).await });

    let body = serde_json::json!({
        "sessionId": session_id,
        "ownerName": "",
        "assignmentQueued": false,
        "orchestrationId": "",
    });
    json_response(StatusCode::CREATED, &body.to_string())
}

/// GET /message: deliver the next queued payload for the session's target,
/// long-polling with exponential backoff until the budget expires.
async fn poll_message(
    req: Request<hyper::body::Incoming>,
    shared: &Arc<ProxyShared>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let Some(session_id) = query_param(req.uri(), "sessionId").and_then(|s| Uuid::parse_str(&s).ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "missing or invalid sessionId");
    };
    let Some(session) = shared.state.local_session(&session_id) else {
        return error_response(StatusCode::BAD_REQUEST, "unknown session");
    };

    // One job per worker: a session already holding a job gets nothing more.
    if session.current_job_id.is_some() {
        return empty_accepted();
    }

    let config = &shared.config;
    let deadline = tokio::time::Instant::now() + config.long_poll_budget;
    let mut interval = config.long_poll_initial;

    loop {
        if shared.is_shutting_down() {
            return empty_accepted();
        }

        // A session with no bound target never dequeues; it must not steal
        // from target-specific queues.
        if let Some(target_id) = &session.target_id {
            if let Some(payload) = shared.state.dequeue_message(target_id) {
                if let Some(job_id) = payload::job_id_from_payload(&payload) {
                    shared.state.deliver_job(&session_id, &job_id);
                    tracing::info!(session = %session_id, job = %job_id, "Delivered job to worker");
                }
                return json_response(StatusCode::OK, &payload);
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return empty_accepted();
        }

        tokio::time::sleep(interval).await;
        interval = std::cmp::min(
            interval.mul_f64(config.long_poll_backoff),
            config.long_poll_max,
        );
    }
}

/// DELETE /session: close a local session.
fn delete_session(
    req: Request<hyper::body::Incoming>,
    shared: &Arc<ProxyShared>,
) -> Response<BoxBody<Bytes, Infallible>> {
    if let Some(session_id) =
        query_param(req.uri(), "sessionId").and_then(|s| Uuid::parse_str(&s).ok())
    {
        shared.state.remove_local_session(&session_id);
        tracing::debug!(session = %session_id, "Worker session closed");
    }
    Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap()
}

/// POST /acquirejob: replay the acquire body stored at poll time.
async fn replay_acquire(
    req: Request<hyper::body::Incoming>,
    shared: &Arc<ProxyShared>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to read acquirejob body: {}", e),
            );
        }
    };

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("unreadable acquirejob body: {}", e),
            );
        }
    };

    let key = ["jobMessageId", "jobRequestId", "requestId"]
        .iter()
        .find_map(|k| value.get(*k).and_then(payload::value_to_string));

    let Some(key) = key else {
        return error_response(StatusCode::NOT_FOUND, "no job message ID in acquire request");
    };

    match shared.state.acquired_details(&key) {
        Some(stored) => {
            let rewritten = payload::rewrite_acquire_body(&stored, &shared.proxy_base_url());
            json_response(StatusCode::OK, &rewritten)
        }
        None => {
            tracing::warn!(job = %key, "No stored acquire body; upstream acquire likely failed");
            error_response(StatusCode::NOT_FOUND, "job not acquired")
        }
    }
}

/// Catch-all: forward a worker request to the correct upstream base.
async fn forward(
    req: Request<hyper::body::Incoming>,
    shared: &Arc<ProxyShared>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to read request body: {}", e),
            );
        }
    };

    // Resolve the target: the local session's binding when the request
    // carries one, otherwise the first enabled target with a session.
    let bound_target = query_param(&uri, "sessionId")
        .and_then(|s| Uuid::parse_str(&s).ok())
        .and_then(|id| shared.state.local_session(&id))
        .and_then(|session| session.target_id);

    let resolved = match &bound_target {
        Some(target_id) => shared
            .targets
            .target(target_id)
            .and_then(|target| {
                shared
                    .targets
                    .session_id(target_id)
                    .map(|session| (target, session))
            }),
        None => {
            let fallback = shared.targets.first_enabled_with_session();
            if let Some((target, _)) = &fallback {
                tracing::warn!(
                    path = %path,
                    target_id = %target.id,
                    "Forward request had no target binding; falling back to first \
                     enabled target. This may indicate a worker-to-target binding bug."
                );
            }
            fallback
        }
    };

    let Some((target, upstream_session)) = resolved else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no active upstream session");
    };

    // Job-lifecycle paths go to the job's run service when we know it.
    let job_key = if JOB_ROUTES.contains(&path.as_str()) {
        payload::job_key_from_body(&body_bytes)
    } else {
        None
    };
    let base = job_key
        .as_ref()
        .and_then(|key| shared.state.run_service_url(key))
        .unwrap_or_else(|| target.runner.server_url_v2.clone());

    let url = join_url(&base, path.trim_start_matches('/'));

    // Carry the original query through with the local session ID swapped
    // for the upstream one.
    let mut query: Vec<(String, String)> = uri
        .query()
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default();
    match query.iter_mut().find(|(k, _)| k == "sessionId") {
        Some((_, v)) => *v = upstream_session.clone(),
        None => query.push(("sessionId".to_string(), upstream_session.clone())),
    }

    let token = match shared.upstream.bearer_token(&target).await {
        Ok(token) => token,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("upstream auth failed: {}", e),
            );
        }
    };

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = shared
        .http
        .request(reqwest_method, &url)
        .query(&query)
        .bearer_auth(&token)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json");
    if !body_bytes.is_empty() {
        builder = builder.body(body_bytes.to_vec());
    }

    tracing::debug!(path = %path, url = %url, target_id = %target.id, "Forwarding worker request");

    match builder.send().await {
        Ok(response) => {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();

            // A finished job releases all tracked state.
            if path == "/finishjob" && status.is_success() {
                if let Some(key) = &job_key {
                    if let Some(assignment) = shared.state.remove_job(key) {
                        tracing::info!(
                            job = %assignment.job_id,
                            target_id = %assignment.target_id,
                            "Job finished; assignment released"
                        );
                    }
                }
            }

            Response::builder()
                .status(status.as_u16())
                .header("Content-Type", "application/json")
                .body(full_body(body))
                .unwrap()
        }
        Err(e) => {
            let err = ProxyError::Forward {
                reason: e.to_string(),
            };
            tracing::error!(path = %path, "{}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

/// Extract a query parameter from a request URI.
fn query_param(uri: &hyper::Uri, name: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

fn empty_accepted() -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(empty_body())
        .unwrap()
}

fn json_response(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(message.to_string())))
        .unwrap()
}

fn empty_body() -> BoxBody<Bytes, Infallible> {
    Empty::<Bytes>::new().map_err(|_| unreachable!()).boxed()
}

fn full_body(bytes: Bytes) -> BoxBody<Bytes, Infallible> {
    Full::new(bytes).map_err(|_| unreachable!()).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_extraction() {
        let uri: hyper::Uri = "http://127.0.0.1/message?sessionId=abc&status=Online"
            .parse()
            .unwrap();
        assert_eq!(query_param(&uri, "sessionId").as_deref(), Some("abc"));
        assert_eq!(query_param(&uri, "status").as_deref(), Some("Online"));
        assert_eq!(query_param(&uri, "missing"), None);
    }

    #[test]
    fn test_query_param_without_query() {
        let uri: hyper::Uri = "http://127.0.0.1/session".parse().unwrap();
        assert_eq!(query_param(&uri, "sessionId"), None);
    }

    #[test]
    fn test_job_routes_cover_lifecycle_paths() {
        for path in ["/acquirejob", "/renewjob", "/finishjob", "/jobrequest"] {
            assert!(JOB_ROUTES.contains(&path));
        }
        assert!(!JOB_ROUTES.contains(&"/somethingelse"));
    }
}
