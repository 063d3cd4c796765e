//! Sync service: the public facade and the only long-lived object. Owns
//! the single-flight mutex, the startup/periodic schedulers, and the
//! realtime manager. All state lives on the instance; nothing hangs off
//! module scope.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{SyncEngine, SyncMode, SyncReport};
use crate::error::{ClientError, Result};
use crate::host::HostHooks;
use crate::realtime::{RealtimeManager, SignalSource, SyncTrigger};

/// Failure counts at which a push error is surfaced to the user.
const TOAST_FAILURE_COUNTS: [u32; 3] = [1, 5, 10];

/// Completed/failed outbox rows older than this are swept opportunistically.
const OUTBOX_SWEEP_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

// ============================================================================
// Options
// ============================================================================

pub type ToastCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct SyncServiceOptions {
    /// Disables every push path; periodic pull still runs.
    pub pull_only: bool,
    pub push_interval: Duration,
    pub pull_interval: Duration,
    pub startup_retries: u32,
    /// User-visible error surface (throttled). Absent ⇒ log only.
    pub on_error_toast: Option<ToastCallback>,
}

impl Default for SyncServiceOptions {
    fn default() -> Self {
        Self {
            pull_only: false,
            push_interval: Duration::from_secs(30),
            pull_interval: Duration::from_secs(120),
            startup_retries: 3,
            on_error_toast: None,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct SyncService {
    engine: Arc<SyncEngine>,
    hooks: Arc<dyn HostHooks>,
    options: SyncServiceOptions,
    is_syncing: AtomicBool,
    push_failures: AtomicU32,
    last_sync_down: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    realtime: Mutex<Option<Arc<RealtimeManager>>>,
}

/// RAII permit for the single-flight mutex.
struct SyncPermit<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncPermit<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl SyncService {
    pub fn new(
        engine: Arc<SyncEngine>,
        hooks: Arc<dyn HostHooks>,
        options: SyncServiceOptions,
    ) -> Self {
        Self {
            engine,
            hooks,
            options,
            is_syncing: AtomicBool::new(false),
            push_failures: AtomicU32::new(0),
            last_sync_down: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            realtime: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<SyncPermit<'_>> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClientError::SyncInProgress);
        }
        Ok(SyncPermit {
            flag: &self.is_syncing,
        })
    }

    // -----------------------------------------------------------------------
    // Public sync operations
    // -----------------------------------------------------------------------

    /// Push + pull.
    pub async fn sync(&self) -> Result<SyncReport> {
        if self.options.pull_only {
            return self.sync_down().await;
        }
        let _permit = self.acquire()?;
        let report = self.engine.sync().await;
        self.after_push(&report).await;
        if report.is_ok() {
            self.note_sync_down_success().await;
        }
        report
    }

    /// Push only. Rejected in pull-only mode.
    pub async fn sync_up(&self, allow_deletes: bool) -> Result<SyncReport> {
        if self.options.pull_only {
            return Err(ClientError::PushDisabled);
        }
        let _permit = self.acquire()?;
        let report = self.engine.sync_up_from_outbox(allow_deletes).await;
        self.after_push(&report).await;
        report
    }

    /// Pull only, guarded: pending local changes are pushed first, and a
    /// failed push aborts the pull so remote state cannot resurrect rows
    /// the user already deleted.
    pub async fn sync_down(&self) -> Result<SyncReport> {
        let _permit = self.acquire()?;
        self.guarded_pull(None).await
    }

    /// Pull only, restricted to the given tables. Same guard as
    /// [`SyncService::sync_down`].
    pub async fn sync_down_tables(&self, tables: &[String]) -> Result<SyncReport> {
        let _permit = self.acquire()?;
        self.guarded_pull(Some(tables)).await
    }

    /// Clear the watermark, then pull everything.
    pub async fn force_full_sync_down(&self) -> Result<SyncReport> {
        self.engine.clear_watermark()?;
        self.sync_down().await
    }

    async fn guarded_pull(&self, tables: Option<&[String]>) -> Result<SyncReport> {
        let stats = self.engine.get_outbox_stats()?;
        if stats.pending + stats.in_progress > 0 {
            if self.options.pull_only {
                // No push path exists; a pull-only deployment should never
                // accumulate outbox rows in the first place.
                warn!(pending = stats.pending, "outbox rows present in pull-only mode");
            } else {
                info!(
                    pending = stats.pending,
                    "outbox not empty before pull; pushing first"
                );
                if let Err(e) = self.engine.sync_up_from_outbox(true).await {
                    warn!(error = %e, "pre-pull push failed; aborting pull");
                    self.after_push::<SyncReport>(&Err(e)).await;
                    return Err(ClientError::PendingChanges);
                }
            }
        }

        let report = match tables {
            Some(tables) => self.engine.sync_down_tables(tables).await,
            None => self.engine.sync_down().await,
        }?;

        self.note_sync_down_success().await;
        Ok(report)
    }

    /// Persistence coupling after a successful pull, plus opportunistic
    /// outbox sweeping.
    async fn note_sync_down_success(&self) {
        *self.last_sync_down.lock() =
            Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        if let Err(e) = self.hooks.persist_db().await {
            warn!(error = %e, "persist_db after sync down failed");
        }
        if let Err(e) = self.engine.clear_outbox_older_than(OUTBOX_SWEEP_AGE_MS) {
            debug!(error = %e, "outbox sweep failed");
        }
    }

    /// Shared push aftermath: persist on failure (the outbox must survive
    /// a refresh) and throttle user-visible errors.
    async fn after_push<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.push_failures.store(0, Ordering::SeqCst);
            }
            Err(e) if e.is_network() => {
                // Offline is not an error worth announcing.
                debug!(error = %e, "push failed offline; will retry silently");
            }
            Err(e) => {
                if let Err(pe) = self.hooks.persist_db().await {
                    warn!(error = %pe, "persist_db after failed push");
                }
                let count = self.push_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if TOAST_FAILURE_COUNTS.contains(&count) {
                    if let Some(toast) = &self.options.on_error_toast {
                        toast(&format!("Sync failed: {e}"));
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    pub fn get_last_sync_down_timestamp(&self) -> Option<String> {
        self.last_sync_down.lock().clone()
    }

    pub fn get_last_sync_mode(&self) -> Option<SyncMode> {
        self.engine.last_sync_mode()
    }

    // -----------------------------------------------------------------------
    // Auto-sync
    // -----------------------------------------------------------------------

    /// Start the startup pull and the periodic push/pull timers. The
    /// service is shared behind an `Arc`; cloning the handle is cheap.
    pub fn start_auto_sync(self: Arc<Self>) {
        let mut tasks = self.tasks.lock();

        // Startup pull with bounded retries and small backoff. Offline
        // defers to the host's one-shot online event; a sync already in
        // flight does not count as a failure.
        let svc = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            if !svc.hooks.is_online() {
                svc.hooks.wait_online().await;
            }
            let mut failures = 0;
            while failures < svc.options.startup_retries {
                match svc.sync_down().await {
                    Ok(_) => return,
                    Err(ClientError::SyncInProgress) => {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(attempt = failures, error = %e, "startup sync failed");
                        tokio::time::sleep(Duration::from_millis(u64::from(failures) * 500))
                            .await;
                    }
                }
            }
        }));

        // Periodic push.
        if !self.options.pull_only {
            let svc = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(svc.options.push_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !svc.hooks.is_online() {
                        continue;
                    }
                    match svc.engine.get_outbox_stats() {
                        Ok(stats) if stats.pending == 0 => continue,
                        Err(e) => {
                            debug!(error = %e, "outbox stats unavailable");
                            continue;
                        }
                        _ => {}
                    }
                    match svc.sync_up(true).await {
                        Ok(_) | Err(ClientError::SyncInProgress) => {}
                        Err(e) => debug!(error = %e, "periodic push failed"),
                    }
                }
            }));
        }

        // Periodic pull.
        let svc = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(svc.options.pull_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !svc.hooks.is_online() {
                    continue;
                }
                match svc.sync_down().await {
                    Ok(_) | Err(ClientError::SyncInProgress) => {}
                    Err(e) => debug!(error = %e, "periodic pull failed"),
                }
            }
        }));
    }

    pub fn stop_auto_sync(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Realtime
    // -----------------------------------------------------------------------

    /// Subscribe to live change signals; each debounced signal runs one
    /// `sync()`, dropped when a sync is already in flight.
    pub async fn start_realtime(self: Arc<Self>, source: Arc<dyn SignalSource>) -> Result<()> {
        let weak = Arc::downgrade(&self);
        let trigger: SyncTrigger = Arc::new(move || {
            let Some(svc) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                match svc.sync().await {
                    Ok(_) => {}
                    Err(ClientError::SyncInProgress) => {
                        debug!("realtime signal dropped; sync already in flight");
                    }
                    Err(e) => debug!(error = %e, "realtime-triggered sync failed"),
                }
            });
        });

        let manager = Arc::new(RealtimeManager::new(
            source,
            self.engine.registry(),
            self.engine.user_id(),
            trigger,
            None,
        ));
        manager.start().await?;
        if let Some(old) = self.realtime.lock().replace(manager) {
            old.stop().await;
        }
        Ok(())
    }

    pub async fn stop_realtime(&self) {
        let manager = self.realtime.lock().take();
        if let Some(manager) = manager {
            manager.stop().await;
        }
    }

    pub async fn destroy(&self) {
        self.stop_auto_sync();
        self.stop_realtime().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptedTransport, SyncEngineOptions};
    use crate::outbox::Outbox;
    use crate::transport::TransportError;
    use crate::triggers;
    use oosync_core::{Op, PrimaryKey, SchemaRegistry, SyncResponse, TableSchema};
    use parking_lot::Mutex as PMutex;
    use rusqlite::Connection;
    use std::sync::atomic::AtomicUsize;

    struct TestHooks {
        conn: Arc<PMutex<Connection>>,
        persists: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl HostHooks for TestHooks {
        fn sqlite(&self) -> Arc<PMutex<Connection>> {
            Arc::clone(&self.conn)
        }
        fn enable_sync_triggers(&self, conn: &Connection) -> Result<()> {
            triggers::enable(conn)
        }
        fn suppress_sync_triggers(&self, conn: &Connection) -> Result<()> {
            triggers::suppress(conn)
        }
        async fn persist_db(&self) -> Result<()> {
            self.persists.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::new(vec![TableSchema {
            name: "tune".to_string(),
            primary_key: PrimaryKey::Single("id".to_string()),
            conflict_keys: None,
            boolean_columns: vec![],
            timestamp_columns: vec!["last_modified_at".to_string()],
            last_modified_column: Some("last_modified_at".to_string()),
            device_column: Some("device_id".to_string()),
            soft_delete: false,
            rank: 0,
            adopt_server_id: false,
        }]))
    }

    fn setup_conn() -> Arc<PMutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE tune (
                 id TEXT PRIMARY KEY,
                 title TEXT,
                 last_modified_at TEXT,
                 device_id TEXT
             );",
        )
        .unwrap();
        Outbox::ensure_table(&conn).unwrap();
        triggers::install_sync_triggers(&conn, &registry()).unwrap();
        Arc::new(PMutex::new(conn))
    }

    fn ok_page() -> SyncResponse {
        SyncResponse {
            synced_at: "2026-02-01T12:00:00Z".to_string(),
            sync_started_at: Some("2026-02-01T11:59:00Z".to_string()),
            ..Default::default()
        }
    }

    fn service(
        conn: Arc<PMutex<Connection>>,
        responses: Vec<std::result::Result<SyncResponse, TransportError>>,
        options: SyncServiceOptions,
    ) -> Arc<SyncService> {
        service_with_persists(conn, responses, options).0
    }

    fn service_with_persists(
        conn: Arc<PMutex<Connection>>,
        responses: Vec<std::result::Result<SyncResponse, TransportError>>,
        options: SyncServiceOptions,
    ) -> (Arc<SyncService>, Arc<AtomicUsize>) {
        let persists = Arc::new(AtomicUsize::new(0));
        let hooks: Arc<dyn HostHooks> = Arc::new(TestHooks {
            conn: Arc::clone(&conn),
            persists: Arc::clone(&persists),
        });
        let mut engine_options = SyncEngineOptions::new("user-1");
        engine_options.device_id = Some("dev-a".to_string());
        let engine = Arc::new(SyncEngine::new(
            registry(),
            Arc::new(ScriptedTransport::new(responses)),
            Arc::clone(&hooks),
            engine_options,
        ));
        (Arc::new(SyncService::new(engine, hooks, options)), persists)
    }

    #[tokio::test]
    async fn second_entrant_gets_sync_in_progress() {
        let svc = service(setup_conn(), vec![Ok(ok_page())], Default::default());
        let _permit = svc.acquire().unwrap();
        let err = svc.sync().await.unwrap_err();
        assert!(matches!(err, ClientError::SyncInProgress));
    }

    #[tokio::test]
    async fn permit_releases_after_sync() {
        let svc = service(
            setup_conn(),
            vec![Ok(ok_page()), Ok(ok_page())],
            Default::default(),
        );
        svc.sync().await.unwrap();
        assert!(!svc.is_syncing());
        svc.sync().await.unwrap();
    }

    #[tokio::test]
    async fn sync_down_aborts_when_pre_pull_push_fails() {
        let conn = setup_conn();
        {
            let guard = conn.lock();
            // A pending DELETE that the edge keeps rejecting.
            Outbox::new(&guard)
                .enqueue("tune", "x", Op::Delete, "2026-01-01T00:00:00Z", None)
                .unwrap();
        }
        let svc = service(
            Arc::clone(&conn),
            vec![Err(TransportError::from_status(500, "insert failed"))],
            Default::default(),
        );

        let err = svc.sync_down().await.unwrap_err();
        assert!(matches!(err, ClientError::PendingChanges));

        // The DELETE stays queued; nothing was pulled over it.
        let guard = conn.lock();
        let items = Outbox::new(&guard).get_pending(10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].op, Op::Delete);
    }

    #[tokio::test]
    async fn sync_down_pushes_pending_items_first_then_pulls() {
        let conn = setup_conn();
        {
            let guard = conn.lock();
            guard
                .execute(
                    "INSERT INTO tune (id, title, last_modified_at, device_id)
                     VALUES ('t1', 'A', '2026-01-01T00:00:00Z', 'dev-a')",
                    [],
                )
                .unwrap();
        }
        // One response for the pre-pull push, one for the pull itself.
        let svc = service(
            Arc::clone(&conn),
            vec![Ok(ok_page()), Ok(ok_page())],
            Default::default(),
        );

        svc.sync_down().await.unwrap();
        let guard = conn.lock();
        assert_eq!(Outbox::new(&guard).stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn pull_only_mode_rejects_push() {
        let options = SyncServiceOptions {
            pull_only: true,
            ..Default::default()
        };
        let svc = service(setup_conn(), vec![Ok(ok_page())], options);
        let err = svc.sync_up(true).await.unwrap_err();
        assert!(matches!(err, ClientError::PushDisabled));
    }

    #[tokio::test]
    async fn toast_fires_on_first_fifth_and_tenth_failure() {
        let conn = setup_conn();
        {
            let guard = conn.lock();
            guard
                .execute(
                    "INSERT INTO tune (id, title, last_modified_at, device_id)
                     VALUES ('t1', 'A', '2026-01-01T00:00:00Z', 'dev-a')",
                    [],
                )
                .unwrap();
        }
        let toasts = Arc::new(AtomicUsize::new(0));
        let toasts_clone = Arc::clone(&toasts);
        let options = SyncServiceOptions {
            on_error_toast: Some(Arc::new(move |_msg: &str| {
                toasts_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let responses = (0..10)
            .map(|_| Err(TransportError::from_status(500, "boom")))
            .collect();
        let svc = service(Arc::clone(&conn), responses, options);

        for _ in 0..10 {
            let _ = svc.sync_up(true).await;
        }
        assert_eq!(toasts.load(Ordering::SeqCst), 3, "toasts at counts 1, 5, 10");
    }

    #[tokio::test]
    async fn network_failures_are_silent() {
        let conn = setup_conn();
        {
            let guard = conn.lock();
            guard
                .execute(
                    "INSERT INTO tune (id, title, last_modified_at, device_id)
                     VALUES ('t1', 'A', '2026-01-01T00:00:00Z', 'dev-a')",
                    [],
                )
                .unwrap();
        }
        let toasts = Arc::new(AtomicUsize::new(0));
        let toasts_clone = Arc::clone(&toasts);
        let options = SyncServiceOptions {
            on_error_toast: Some(Arc::new(move |_msg: &str| {
                toasts_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let svc = service(
            Arc::clone(&conn),
            vec![Err(TransportError::network("Failed to fetch"))],
            options,
        );

        let _ = svc.sync_up(true).await;
        assert_eq!(toasts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn last_sync_down_timestamp_is_recorded() {
        let svc = service(setup_conn(), vec![Ok(ok_page())], Default::default());
        assert!(svc.get_last_sync_down_timestamp().is_none());
        svc.sync_down().await.unwrap();
        assert!(svc.get_last_sync_down_timestamp().is_some());
    }

    #[tokio::test]
    async fn persist_runs_after_pull_success_and_push_failure() {
        let conn = setup_conn();
        let (svc, persists) =
            service_with_persists(Arc::clone(&conn), vec![Ok(ok_page())], Default::default());
        svc.sync_down().await.unwrap();
        assert_eq!(persists.load(Ordering::SeqCst), 1, "persist after clean pull");

        {
            let guard = conn.lock();
            guard
                .execute(
                    "INSERT INTO tune (id, title, last_modified_at, device_id)
                     VALUES ('t1', 'A', '2026-01-01T00:00:00Z', 'dev-a')",
                    [],
                )
                .unwrap();
        }
        let (svc, persists) = service_with_persists(
            Arc::clone(&conn),
            vec![Err(TransportError::from_status(500, "boom"))],
            Default::default(),
        );
        let _ = svc.sync_up(true).await;
        assert!(
            persists.load(Ordering::SeqCst) >= 1,
            "persist after failed push protects the outbox"
        );
    }
}
