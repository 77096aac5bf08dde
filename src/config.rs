//! Proxy configuration.
//!
//! All timing and capacity knobs live here so tests can shrink the
//! long-poll and polling cadences to milliseconds.

use std::path::PathBuf;
use std::time::Duration;

/// Default port the worker-facing server listens on.
pub const DEFAULT_PORT: u16 = 8787;

/// How often upstream brokers are polled for new messages.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of background session-create retries after a failure.
pub const DEFAULT_SESSION_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Total wall-clock budget for a worker message long-poll.
pub const DEFAULT_LONG_POLL_BUDGET: Duration = Duration::from_secs(50);

/// First queue-check interval inside a worker long-poll.
pub const DEFAULT_LONG_POLL_INITIAL: Duration = Duration::from_millis(100);

/// Upper bound on the queue-check interval.
pub const DEFAULT_LONG_POLL_MAX: Duration = Duration::from_secs(5);

/// Lifetime of a minted client-assertion JWT.
pub const DEFAULT_JWT_LIFETIME: Duration = Duration::from_secs(60);

/// Bearer tokens are refreshed this long before their expiry.
pub const DEFAULT_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Read timeout for upstream HTTPS calls.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Seen-message-ID set capacity before pruning kicks in.
pub const DEFAULT_SEEN_CAP: usize = 10_000;

/// Number of oldest seen IDs dropped per prune.
pub const DEFAULT_SEEN_PRUNE: usize = 1_000;

/// Configuration for the broker proxy service.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Loopback port for the worker-facing server. 0 picks an ephemeral port.
    pub port: u16,
    /// Directory holding `broker-sessions.json`.
    pub runner_dir: PathBuf,
    /// Upstream poll cadence.
    pub poll_interval: Duration,
    /// Background session-retry cadence.
    pub session_retry_interval: Duration,
    /// Worker long-poll budget.
    pub long_poll_budget: Duration,
    /// Initial worker long-poll check interval.
    pub long_poll_initial: Duration,
    /// Maximum worker long-poll check interval.
    pub long_poll_max: Duration,
    /// Multiplier applied to the check interval each tick.
    pub long_poll_backoff: f64,
    /// Client-assertion JWT lifetime.
    pub jwt_lifetime: Duration,
    /// Bearer token refresh margin.
    pub token_refresh_margin: Duration,
    /// Upstream HTTPS read timeout.
    pub upstream_timeout: Duration,
    /// Seen-message-ID cap.
    pub seen_cap: usize,
    /// Seen-message-ID prune batch size.
    pub seen_prune: usize,
    /// Runner version reported on message polls.
    pub runner_version: String,
    /// OS label reported on message polls.
    pub os_label: String,
    /// Architecture label reported on message polls.
    pub arch_label: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            runner_dir: default_runner_dir(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            session_retry_interval: DEFAULT_SESSION_RETRY_INTERVAL,
            long_poll_budget: DEFAULT_LONG_POLL_BUDGET,
            long_poll_initial: DEFAULT_LONG_POLL_INITIAL,
            long_poll_max: DEFAULT_LONG_POLL_MAX,
            long_poll_backoff: 1.5,
            jwt_lifetime: DEFAULT_JWT_LIFETIME,
            token_refresh_margin: DEFAULT_TOKEN_REFRESH_MARGIN,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            seen_cap: DEFAULT_SEEN_CAP,
            seen_prune: DEFAULT_SEEN_PRUNE,
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
            os_label: std::env::consts::OS.to_string(),
            arch_label: std::env::consts::ARCH.to_string(),
        }
    }
}

impl ProxyConfig {
    /// Create a config with defaults, applying environment overrides.
    ///
    /// Recognized variables: `SWITCHYARD_PORT`, `SWITCHYARD_RUNNER_DIR`,
    /// `SWITCHYARD_POLL_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("SWITCHYARD_PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!("Ignoring invalid SWITCHYARD_PORT: {}", port),
            }
        }
        if let Ok(dir) = std::env::var("SWITCHYARD_RUNNER_DIR") {
            config.runner_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("SWITCHYARD_POLL_SECS") {
            match secs.parse() {
                Ok(secs) => config.poll_interval = Duration::from_secs(secs),
                Err(_) => tracing::warn!("Ignoring invalid SWITCHYARD_POLL_SECS: {}", secs),
            }
        }

        config
    }

    /// Set the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the runner directory.
    pub fn with_runner_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runner_dir = dir.into();
        self
    }

    /// Set the upstream poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the worker long-poll budget.
    pub fn with_long_poll_budget(mut self, budget: Duration) -> Self {
        self.long_poll_budget = budget;
        self
    }

    /// Set the initial worker long-poll check interval.
    pub fn with_long_poll_initial(mut self, initial: Duration) -> Self {
        self.long_poll_initial = initial;
        self
    }

    /// Set the background session-retry interval.
    pub fn with_session_retry_interval(mut self, interval: Duration) -> Self {
        self.session_retry_interval = interval;
        self
    }
}

/// Default runner directory under the platform data dir.
fn default_runner_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8787);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.session_retry_interval, Duration::from_secs(30));
        assert_eq!(config.long_poll_budget, Duration::from_secs(50));
        assert_eq!(config.long_poll_initial, Duration::from_millis(100));
        assert_eq!(config.long_poll_max, Duration::from_secs(5));
        assert_eq!(config.seen_cap, 10_000);
        assert_eq!(config.seen_prune, 1_000);
    }

    #[test]
    fn test_builders() {
        let config = ProxyConfig::default()
            .with_port(0)
            .with_poll_interval(Duration::from_millis(50))
            .with_long_poll_budget(Duration::from_millis(200));

        assert_eq!(config.port, 0);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.long_poll_budget, Duration::from_millis(200));
    }
}
