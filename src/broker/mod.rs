//! Multi-target broker proxy core.
//!
//! One proxy instance serves many upstream job brokers, one per registered
//! target, and presents them to local workers as a single broker:
//!
//! ```text
//! Worker ──► Local server ──► Queues / job tracker ◄── Poll loop
//!                 │                                        │
//!                 └───────── forward per-job ─────────► Upstream brokers
//!                                                          ▲
//!              Token manager ── Session store ─────────────┘
//! ```

pub mod events;
pub mod jobs;
pub mod payload;
pub mod queue;
pub mod server;
pub mod service;
pub mod session_store;
pub mod state;
pub mod targets;
pub mod upstream;

pub use events::{AcceptAll, AdmissionPolicy, NoopEvents, ProxyEvents, TargetStatus};
pub use jobs::{JobAssignment, JobTracker};
pub use queue::{MessageQueue, SeenMessageIds};
pub use server::LocalServer;
pub use service::{BrokerProxyService, ProxyShared};
pub use session_store::{SessionDocument, SessionStore};
pub use state::{BrokerState, LocalSession};
pub use targets::TargetRegistry;
pub use upstream::UpstreamClient;
