//! switchyard: a multi-target job broker proxy for self-hosted CI runners.
//!
//! A pool of one-shot CI workers on this host speaks the single-target
//! runner-broker protocol against a loopback HTTP server. The proxy fans
//! those conversations out across every registered upstream target, claims
//! each job the moment it appears so the provider stops redelivering it,
//! rewrites the job payload so all later lifecycle calls flow back through
//! the proxy, and hands the job to exactly one worker.

pub mod auth;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod error;

pub use broker::BrokerProxyService;
pub use config::ProxyConfig;
pub use credentials::Target;
pub use error::{ProxyError, Result};
