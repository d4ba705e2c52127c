//! Online stage: non-blocking TLS probes multiplexed with `poll(2)`, one
//! worker thread per address shard.

pub mod capability;
pub mod connection;
pub mod orchestrator;
pub mod poller;
pub mod progress;
pub mod socket;
pub mod worker;

pub use capability::{probe_client_config, HandshakeCapability, HandshakeError, HandshakeFactory, Progress, RustlsFactory, RustlsHandshake};
pub use connection::{Action, ConnectionState, Event, Phase};
pub use orchestrator::{Orchestrator, ScanConfig, ScanSummary};
pub use progress::{ProgressSnapshot, ScanProgress};
pub use worker::{ScanWorker, WorkerConfig, WorkerReport};
