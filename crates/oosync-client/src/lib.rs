//! Client half of the oosync replication engine.
//!
//! Local mutations are captured by SQLite triggers into a durable outbox;
//! the engine drains the outbox to the edge endpoint and merges the
//! returned pages back into the local database under trigger suppression.
//! The service facade owns scheduling, the single-flight mutex, and the
//! realtime manager.

pub mod apply;
pub mod engine;
pub mod error;
pub mod host;
pub mod outbox;
pub mod realtime;
pub mod service;
pub mod transport;
pub mod triggers;

pub use apply::{apply_remote_changes, apply_with_deferred_retries, ApplyOutcome};
pub use engine::{SyncEngine, SyncEngineOptions, SyncMode, SyncReport};
pub use error::{ClientError, Result};
pub use host::{HostHooks, OutboxBackup, OutboxBackupItem};
pub use outbox::{Outbox, OutboxItem, OutboxStats, OutboxStatus};
pub use realtime::{RealtimeManager, RealtimeState, SignalSource, TableSignal};
pub use service::{SyncService, SyncServiceOptions};
pub use transport::{
    HttpWorkerClient, SyncTransport, TransportError, TransportErrorKind,
};
