//! Realtime manager: turns user-scoped change notifications into sync
//! triggers. The payload of a notification is ignored (every event is
//! just a signal that something changed) and signals across all channels
//! are debounced into a single sync call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use oosync_core::SchemaRegistry;

/// Debounce window between the last signal and the triggered sync.
const DEBOUNCE: Duration = Duration::from_secs(2);

// ============================================================================
// Signal source
// ============================================================================

/// One event from a table channel. `error` marks a channel-level failure;
/// sibling channels keep delivering.
#[derive(Debug, Clone)]
pub struct TableSignal {
    pub table: String,
    pub error: Option<String>,
}

/// Host-provided subscription to the edge's change-notification stream:
/// one channel per syncable table, filtered by user id.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn subscribe(
        &self,
        tables: &[String],
        user_id: &str,
        tx: mpsc::UnboundedSender<TableSignal>,
    ) -> Result<()>;

    async fn unsubscribe(&self) -> Result<()>;
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Fired when the debounce window closes. Must not block: the service's
/// trigger spawns the sync and drops the signal if one is already running.
pub type SyncTrigger = Arc<dyn Fn() + Send + Sync>;

pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct RealtimeManager {
    source: Arc<dyn SignalSource>,
    registry: Arc<SchemaRegistry>,
    user_id: String,
    on_sync: SyncTrigger,
    on_error: Option<ErrorCallback>,
    debounce: Duration,
    state: Arc<Mutex<RealtimeState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeManager {
    pub fn new(
        source: Arc<dyn SignalSource>,
        registry: Arc<SchemaRegistry>,
        user_id: impl Into<String>,
        on_sync: SyncTrigger,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            source,
            registry,
            user_id: user_id.into(),
            on_sync,
            on_error,
            debounce: DEBOUNCE,
            state: Arc::new(Mutex::new(RealtimeState::Disconnected)),
            task: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn state(&self) -> RealtimeState {
        *self.state.lock()
    }

    pub async fn start(&self) -> Result<()> {
        *self.state.lock() = RealtimeState::Connecting;

        let (tx, rx) = mpsc::unbounded_channel();
        let tables: Vec<String> = self.registry.syncable_tables().to_vec();
        if let Err(e) = self.source.subscribe(&tables, &self.user_id, tx).await {
            *self.state.lock() = RealtimeState::Error;
            return Err(e);
        }
        *self.state.lock() = RealtimeState::Connected;

        let handle = tokio::spawn(debounce_loop(
            rx,
            self.debounce,
            Arc::clone(&self.on_sync),
            self.on_error.clone(),
            Arc::clone(&self.state),
        ));
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    pub async fn stop(&self) {
        if let Err(e) = self.source.unsubscribe().await {
            warn!(error = %e, "realtime unsubscribe failed");
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        *self.state.lock() = RealtimeState::Disconnected;
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }
}

/// Collapse bursts of signals into one trigger, fired `debounce` after the
/// last event. Channel errors flip the state but leave the loop running.
async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<TableSignal>,
    debounce: Duration,
    on_sync: SyncTrigger,
    on_error: Option<ErrorCallback>,
    state: Arc<Mutex<RealtimeState>>,
) {
    let mut pending = false;
    let mut deadline = tokio::time::Instant::now();

    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Some(signal) => {
                    if let Some(error) = signal.error {
                        warn!(table = %signal.table, error = %error, "realtime channel error");
                        *state.lock() = RealtimeState::Error;
                        if let Some(cb) = &on_error {
                            cb(&error);
                        }
                    } else {
                        debug!(table = %signal.table, "realtime change signal");
                        pending = true;
                        deadline = tokio::time::Instant::now() + debounce;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if pending => {
                pending = false;
                (on_sync)();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use oosync_core::{PrimaryKey, TableSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        tx: Mutex<Option<mpsc::UnboundedSender<TableSignal>>>,
    }

    #[async_trait]
    impl SignalSource for StubSource {
        async fn subscribe(
            &self,
            _tables: &[String],
            _user_id: &str,
            tx: mpsc::UnboundedSender<TableSignal>,
        ) -> Result<()> {
            *self.tx.lock() = Some(tx);
            Ok(())
        }
        async fn unsubscribe(&self) -> Result<()> {
            *self.tx.lock() = None;
            Ok(())
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::new(vec![TableSchema {
            name: "tune".to_string(),
            primary_key: PrimaryKey::Single("id".to_string()),
            conflict_keys: None,
            boolean_columns: vec![],
            timestamp_columns: vec![],
            last_modified_column: Some("last_modified_at".to_string()),
            device_column: None,
            soft_delete: false,
            rank: 0,
            adopt_server_id: false,
        }]))
    }

    fn signal(table: &str) -> TableSignal {
        TableSignal {
            table: table.to_string(),
            error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_signals_triggers_exactly_one_sync() {
        let source = Arc::new(StubSource {
            tx: Mutex::new(None),
        });
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let manager = RealtimeManager::new(
            source.clone(),
            registry(),
            "user-1",
            Arc::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        manager.start().await.unwrap();
        assert_eq!(manager.state(), RealtimeState::Connected);

        let tx = source.tx.lock().clone().unwrap();
        for i in 0..12 {
            tx.send(signal(["tune", "playlist", "practice", "genre"][i % 4]))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "one trigger per burst");

        // A later signal opens a fresh window.
        tx.send(signal("tune")).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        manager.stop().await;
        assert_eq!(manager.state(), RealtimeState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_marks_state_without_stopping_siblings() {
        let source = Arc::new(StubSource {
            tx: Mutex::new(None),
        });
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        let manager = RealtimeManager::new(
            source.clone(),
            registry(),
            "user-1",
            Arc::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Some(Arc::new(move |_msg: &str| {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .with_debounce(Duration::from_millis(100));
        manager.start().await.unwrap();

        let tx = source.tx.lock().clone().unwrap();
        tx.send(TableSignal {
            table: "tune".to_string(),
            error: Some("channel closed by server".to_string()),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), RealtimeState::Error);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Signals still flow after the error.
        tx.send(signal("tune")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Reconnect restores the connected state.
        manager.reconnect().await.unwrap();
        assert_eq!(manager.state(), RealtimeState::Connected);
    }
}
