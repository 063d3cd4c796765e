//! Sync engine: one logical exchange with the edge. Drain the outbox,
//! push, apply the returned page, page through an initial sync, retry
//! deferred foreign keys, and advance the per-user watermark only when
//! everything applied cleanly.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::apply::{self, ApplyOutcome};
use crate::error::Result;
use crate::host::HostHooks;
use crate::outbox::{parse_row_id, Outbox, OutboxItem, OutboxStats};
use crate::transport::SyncTransport;
use oosync_core::{normalize, ChangeRow, Op, SchemaRegistry, SyncRequest, SyncResponse};

const META_DDL: &str = "
CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

// ============================================================================
// Options and results
// ============================================================================

pub struct SyncEngineOptions {
    pub user_id: String,
    /// Stable identifier for this installation. Generated when absent.
    pub device_id: Option<String>,
    pub schema_version: i64,
    /// Outbox items drained per exchange.
    pub batch_size: usize,
    /// Pull page-size hint sent to the edge.
    pub page_size: i64,
}

impl SyncEngineOptions {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
            schema_version: 1,
            batch_size: 200,
            page_size: oosync_core::DEFAULT_PAGE_SIZE,
        }
    }
}

/// Which kind of pull the last successful sync performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    Full,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub pushed: usize,
    /// INSERT/UPDATE items dropped because their local row no longer exists.
    pub pruned: usize,
    pub applied: usize,
    pub failed: usize,
    pub pages: usize,
    pub initial: bool,
    pub synced_at: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Clone, Copy)]
struct RunOptions<'a> {
    push: bool,
    pull: bool,
    allow_deletes: bool,
    pull_tables: Option<&'a [String]>,
}

// ============================================================================
// SyncEngine
// ============================================================================

pub struct SyncEngine {
    registry: Arc<SchemaRegistry>,
    transport: Arc<dyn SyncTransport>,
    hooks: Arc<dyn HostHooks>,
    user_id: String,
    device_id: String,
    schema_version: i64,
    batch_size: usize,
    page_size: i64,
    last_mode: Mutex<Option<SyncMode>>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        transport: Arc<dyn SyncTransport>,
        hooks: Arc<dyn HostHooks>,
        options: SyncEngineOptions,
    ) -> Self {
        Self {
            registry,
            transport,
            hooks,
            user_id: options.user_id,
            device_id: options
                .device_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            schema_version: options.schema_version,
            batch_size: options.batch_size,
            page_size: options.page_size,
            last_mode: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn registry(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.registry)
    }

    /// Sweep terminal outbox rows older than the given age.
    pub fn clear_outbox_older_than(&self, max_age_ms: i64) -> Result<usize> {
        let conn = self.hooks.sqlite();
        let conn = conn.lock();
        Outbox::new(&conn).clear_older_than(max_age_ms)
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Push + paged pull.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.run(RunOptions {
            push: true,
            pull: true,
            allow_deletes: true,
            pull_tables: None,
        })
        .await
    }

    /// Push only. With `allow_deletes` off, DELETE items stay pending.
    pub async fn sync_up_from_outbox(&self, allow_deletes: bool) -> Result<SyncReport> {
        self.run(RunOptions {
            push: true,
            pull: false,
            allow_deletes,
            pull_tables: None,
        })
        .await
    }

    /// Pull only.
    pub async fn sync_down(&self) -> Result<SyncReport> {
        self.run(RunOptions {
            push: false,
            pull: true,
            allow_deletes: true,
            pull_tables: None,
        })
        .await
    }

    /// Pull only, restricted to the given tables.
    pub async fn sync_down_tables(&self, tables: &[String]) -> Result<SyncReport> {
        self.run(RunOptions {
            push: false,
            pull: true,
            allow_deletes: true,
            pull_tables: Some(tables),
        })
        .await
    }

    /// Clear the watermark and pull from scratch.
    pub async fn force_full_sync_down(&self) -> Result<SyncReport> {
        self.clear_watermark()?;
        self.sync_down().await
    }

    pub fn get_outbox_stats(&self) -> Result<OutboxStats> {
        let conn = self.hooks.sqlite();
        let conn = conn.lock();
        Outbox::new(&conn).stats()
    }

    pub fn get_last_sync_timestamp(&self) -> Result<Option<String>> {
        let conn = self.hooks.sqlite();
        let conn = conn.lock();
        self.get_watermark(&conn)
    }

    pub fn was_last_sync_incremental(&self) -> Option<bool> {
        self.last_mode.lock().map(|m| m == SyncMode::Incremental)
    }

    pub fn last_sync_mode(&self) -> Option<SyncMode> {
        *self.last_mode.lock()
    }

    pub fn clear_watermark(&self) -> Result<()> {
        let conn = self.hooks.sqlite();
        let conn = conn.lock();
        conn.execute_batch(META_DDL)?;
        conn.execute(
            "DELETE FROM sync_meta WHERE key = ?1",
            [self.watermark_key()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // The exchange
    // -----------------------------------------------------------------------

    async fn run(&self, opts: RunOptions<'_>) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        // Watermark + cold-start detection.
        let watermark = {
            let conn = self.hooks.sqlite();
            let conn = conn.lock();
            let mark = self.get_watermark(&conn)?;
            match mark {
                Some(_) if self.all_syncable_tables_empty(&conn)? => {
                    // Durable storage was cleared underneath us; the
                    // watermark is a lie. Start over.
                    warn!(user = %self.user_id, "local tables empty despite watermark; forcing initial sync");
                    conn.execute(
                        "DELETE FROM sync_meta WHERE key = ?1",
                        [self.watermark_key()],
                    )?;
                    None
                }
                other => other,
            }
        };
        let is_initial = watermark.is_none();
        report.initial = is_initial;

        // Drain the outbox.
        let (changes, pushed_ids, pruned) = if opts.push {
            let conn = self.hooks.sqlite();
            let conn = conn.lock();
            self.drain_outbox(&conn, opts.allow_deletes)?
        } else {
            (Vec::new(), Vec::new(), 0)
        };
        report.pruned = pruned;

        // A pull-less run still goes to the edge (the push must land), but
        // asks for no tables so the response page is empty.
        let empty_allowlist: Vec<String> = Vec::new();
        let pull_tables: Option<Vec<String>> = if opts.pull {
            opts.pull_tables.map(|t| t.to_vec())
        } else {
            Some(empty_allowlist)
        };

        let request = SyncRequest {
            changes,
            last_sync_at: watermark.clone(),
            schema_version: self.schema_version,
            page_size: Some(self.page_size),
            pull_tables: pull_tables.clone(),
            ..Default::default()
        };

        let response = match self.transport.sync(&request).await {
            Ok(r) => r,
            Err(e) => {
                self.fail_pushed_items(&pushed_ids, &e.to_string());
                if !pushed_ids.is_empty() {
                    // Keep the queued work safe across a refresh.
                    if let Err(pe) = self.hooks.persist_db().await {
                        warn!(error = %pe, "persist_db after failed push");
                    }
                }
                return Err(e.into());
            }
        };

        // The edge accepted the batch; the pushed items are done.
        {
            let conn = self.hooks.sqlite();
            let conn = conn.lock();
            let outbox = Outbox::new(&conn);
            for id in &pushed_ids {
                outbox.mark_completed(id)?;
            }
        }
        report.pushed = pushed_ids.len();

        // Apply the first page, then walk the cursor on initial sync.
        let sync_started_at = response.sync_started_at.clone();
        let mut synced_at = response.synced_at.clone();
        let mut next_cursor = response.next_cursor.clone();
        let mut total = ApplyOutcome::default();
        self.apply_page(&response, &mut total)?;
        report.pages = 1;

        while is_initial && next_cursor.is_some() {
            let page_request = SyncRequest {
                changes: Vec::new(),
                last_sync_at: None,
                schema_version: self.schema_version,
                pull_cursor: next_cursor.clone(),
                sync_started_at: sync_started_at.clone(),
                page_size: Some(self.page_size),
                pull_tables: pull_tables.clone(),
                ..Default::default()
            };
            let page = self.transport.sync(&page_request).await?;
            synced_at = page.synced_at.clone();
            next_cursor = page.next_cursor.clone();
            self.apply_page(&page, &mut total)?;
            report.pages += 1;
        }

        // Deferred foreign keys get their bounded retry across everything
        // that arrived this exchange.
        {
            let conn = self.hooks.sqlite();
            let conn = conn.lock();
            apply::retry_deferred(&conn, &self.registry, self.hooks.as_ref(), &mut total, &self.device_id)?;
        }

        // One-shot outbox-backup replay after a completed initial pull.
        if is_initial && opts.pull {
            self.replay_outbox_backup();
        }

        report.applied = total.applied;
        report.failed = total.failed;
        report.errors = total.errors;

        // Watermark only moves on a clean pull.
        if opts.pull && report.failed == 0 {
            let new_mark = if is_initial {
                sync_started_at.clone().unwrap_or_else(|| synced_at.clone())
            } else {
                synced_at.clone()
            };
            let conn = self.hooks.sqlite();
            let conn = conn.lock();
            self.set_watermark(&conn, &new_mark)?;
            *self.last_mode.lock() = Some(if is_initial {
                SyncMode::Full
            } else {
                SyncMode::Incremental
            });
            info!(user = %self.user_id, watermark = %new_mark, pages = report.pages, "sync completed");
        } else if report.failed > 0 {
            warn!(failed = report.failed, "sync finished with apply failures; watermark unchanged");
        }

        report.synced_at = Some(synced_at);
        Ok(report)
    }

    fn apply_page(&self, response: &SyncResponse, total: &mut ApplyOutcome) -> Result<()> {
        if response.changes.is_empty() {
            return Ok(());
        }
        let conn = self.hooks.sqlite();
        let conn = conn.lock();
        let page = apply::apply_remote_changes(
            &conn,
            &self.registry,
            self.hooks.as_ref(),
            &response.changes,
            &self.device_id,
        )?;
        total.applied += page.applied;
        total.failed += page.failed;
        total.skipped += page.skipped;
        total.errors.extend(page.errors);
        for table in page.affected_tables {
            if !total.affected_tables.contains(&table) {
                total.affected_tables.push(table);
            }
        }
        total.deferred.extend(page.deferred);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outbox drain
    // -----------------------------------------------------------------------

    fn drain_outbox(
        &self,
        conn: &Connection,
        allow_deletes: bool,
    ) -> Result<(Vec<ChangeRow>, Vec<String>, usize)> {
        Outbox::ensure_table(conn)?;
        let outbox = Outbox::new(conn);
        let pending = outbox.get_pending(self.batch_size)?;

        let mut changes = Vec::new();
        let mut pushed_ids = Vec::new();
        let mut pruned = 0;

        for item in pending {
            match item.op {
                Op::Delete => {
                    if !allow_deletes {
                        continue;
                    }
                    changes.push(ChangeRow {
                        table: item.table.clone(),
                        row_id: item.row_id.clone(),
                        data: Value::Object(parse_row_id(&item.row_id)),
                        deleted: true,
                        last_modified_at: Some(item.changed_at.clone()),
                    });
                    outbox.mark_in_progress(&item.id)?;
                    pushed_ids.push(item.id);
                }
                Op::Insert | Op::Update => match self.load_local_row(conn, &item)? {
                    Some(row) => {
                        let last_modified = row
                            .get("lastModifiedAt")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| item.changed_at.clone());
                        changes.push(ChangeRow {
                            table: item.table.clone(),
                            row_id: item.row_id.clone(),
                            data: Value::Object(row),
                            deleted: false,
                            last_modified_at: Some(last_modified),
                        });
                        outbox.mark_in_progress(&item.id)?;
                        pushed_ids.push(item.id);
                    }
                    None => {
                        // The row vanished before we could push it; the
                        // mutation is a logical no-op.
                        debug!(table = %item.table, row = %item.row_id, "pruning outbox item with no local row");
                        outbox.mark_completed(&item.id)?;
                        pruned += 1;
                    }
                },
            }
        }
        Ok((changes, pushed_ids, pruned))
    }

    /// Current local row as a camelCase JSON object, or None when gone.
    fn load_local_row(
        &self,
        conn: &Connection,
        item: &OutboxItem,
    ) -> Result<Option<Map<String, Value>>> {
        let schema = match self.registry.table(&item.table) {
            Some(s) => s,
            None => return Ok(None),
        };
        let key = parse_row_id(&item.row_id);
        let pk_cols = schema.primary_key.columns();

        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(pk_cols.len());
        for col in &pk_cols {
            let camel = self.registry.snake_to_camel(col);
            match key.get(&camel).or_else(|| key.get(*col)) {
                Some(Value::String(s)) => values.push(rusqlite::types::Value::Text(s.clone())),
                Some(Value::Number(n)) if n.is_i64() => {
                    values.push(rusqlite::types::Value::Integer(n.as_i64().unwrap_or(0)))
                }
                _ => return Ok(None),
            }
        }

        let predicate = pk_cols
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("SELECT * FROM {} WHERE {predicate}", item.table);
        let mut stmt = conn.prepare(&sql)?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let row = stmt
            .query_row(rusqlite::params_from_iter(values), |row| {
                let mut map = Map::new();
                for (i, name) in column_names.iter().enumerate() {
                    let v: rusqlite::types::Value = row.get(i)?;
                    map.insert(name.clone(), sql_value_to_json(v));
                }
                Ok(map)
            })
            .optional()?;
        Ok(row.map(|m| normalize::row_to_camel(m, &self.registry)))
    }

    fn fail_pushed_items(&self, ids: &[String], error: &str) {
        if ids.is_empty() {
            return;
        }
        let conn = self.hooks.sqlite();
        let conn = conn.lock();
        let outbox = Outbox::new(&conn);
        for id in ids {
            if let Err(e) = outbox.mark_failed(id, error) {
                warn!(error = %e, "failed to reset outbox item after push failure");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outbox backup
    // -----------------------------------------------------------------------

    /// Replay the host's one-shot outbox backup: items are re-enqueued as
    /// pending and pushed by the next drain. Best effort; the blob is
    /// cleared regardless of outcome.
    fn replay_outbox_backup(&self) {
        let backup = match self.hooks.load_outbox_backup(&self.user_id) {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not load outbox backup");
                return;
            }
        };
        info!(items = backup.items.len(), "replaying outbox backup");
        {
            let conn = self.hooks.sqlite();
            let conn = conn.lock();
            let outbox = Outbox::new(&conn);
            for item in &backup.items {
                let result = outbox.enqueue(
                    &item.table,
                    &item.row_id,
                    item.op,
                    &item.changed_at,
                    Some(&self.device_id),
                );
                if let Err(e) = result {
                    warn!(table = %item.table, error = %e, "backup item could not be re-enqueued");
                }
            }
        }
        if let Err(e) = self.hooks.clear_outbox_backup(&self.user_id) {
            warn!(error = %e, "could not clear outbox backup");
        }
    }

    // -----------------------------------------------------------------------
    // Watermark
    // -----------------------------------------------------------------------

    fn watermark_key(&self) -> String {
        format!("LAST_SYNC_TIMESTAMP_{}", self.user_id)
    }

    fn get_watermark(&self, conn: &Connection) -> Result<Option<String>> {
        conn.execute_batch(META_DDL)?;
        let mark = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                [self.watermark_key()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(mark)
    }

    fn set_watermark(&self, conn: &Connection, value: &str) -> Result<()> {
        conn.execute_batch(META_DDL)?;
        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [self.watermark_key(), value.to_string()],
        )?;
        Ok(())
    }

    /// True when every syncable table has no rows (or does not exist yet).
    fn all_syncable_tables_empty(&self, conn: &Connection) -> Result<bool> {
        for table in self.registry.syncable_tables() {
            let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} LIMIT 1)");
            match conn.query_row(&sql, [], |row| row.get::<_, i64>(0)) {
                Ok(1) => return Ok(false),
                Ok(_) => {}
                Err(_) => {
                    // Missing table counts as empty.
                }
            }
        }
        Ok(true)
    }
}

fn sql_value_to_json(v: rusqlite::types::Value) -> Value {
    match v {
        rusqlite::types::Value::Null => Value::Null,
        rusqlite::types::Value::Integer(i) => Value::from(i),
        rusqlite::types::Value::Real(f) => Value::from(f),
        rusqlite::types::Value::Text(s) => Value::String(s),
        rusqlite::types::Value::Blob(_) => Value::Null,
    }
}

// ============================================================================
// Scripted transport (test support)
// ============================================================================

/// In-memory transport that answers from a scripted queue and records
/// every request. Shared by engine and service tests.
#[cfg(any(test, feature = "test-support"))]
pub struct ScriptedTransport {
    responses:
        Mutex<std::collections::VecDeque<std::result::Result<SyncResponse, crate::transport::TransportError>>>,
    pub requests: Mutex<Vec<SyncRequest>>,
}

#[cfg(any(test, feature = "test-support"))]
impl ScriptedTransport {
    pub fn new(
        responses: Vec<std::result::Result<SyncResponse, crate::transport::TransportError>>,
    ) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait::async_trait]
impl SyncTransport for ScriptedTransport {
    async fn sync(
        &self,
        request: &SyncRequest,
    ) -> std::result::Result<SyncResponse, crate::transport::TransportError> {
        self.requests.lock().push(request.clone());
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(SyncResponse {
                synced_at: "2026-02-01T00:00:00Z".to_string(),
                ..Default::default()
            })
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::triggers;
    use oosync_core::{PrimaryKey, TableSchema};
    use serde_json::json;

    struct TestHooks {
        conn: Arc<Mutex<Connection>>,
    }

    impl HostHooks for TestHooks {
        fn sqlite(&self) -> Arc<Mutex<Connection>> {
            Arc::clone(&self.conn)
        }
        fn enable_sync_triggers(&self, conn: &Connection) -> Result<()> {
            triggers::enable(conn)
        }
        fn suppress_sync_triggers(&self, conn: &Connection) -> Result<()> {
            triggers::suppress(conn)
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::new(vec![
            TableSchema {
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
            },
            TableSchema {
                name: "practice_record".to_string(),
                primary_key: PrimaryKey::Single("id".to_string()),
                conflict_keys: None,
                boolean_columns: vec![],
                timestamp_columns: vec!["last_modified_at".to_string()],
                last_modified_column: Some("last_modified_at".to_string()),
                device_column: None,
                soft_delete: false,
                rank: 1,
                adopt_server_id: false,
            },
        ]))
    }

    fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE tune (
                 id TEXT PRIMARY KEY,
                 title TEXT,
                 last_modified_at TEXT,
                 device_id TEXT
             );
             CREATE TABLE practice_record (
                 id TEXT PRIMARY KEY,
                 tune_ref TEXT,
                 quality INTEGER,
                 last_modified_at TEXT
             );",
        )
        .unwrap();
        Outbox::ensure_table(&conn).unwrap();
        triggers::install_sync_triggers(&conn, &registry()).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn engine_with(
        conn: Arc<Mutex<Connection>>,
        transport: Arc<ScriptedTransport>,
    ) -> SyncEngine {
        let mut options = SyncEngineOptions::new("user-1");
        options.device_id = Some("dev-a".to_string());
        SyncEngine::new(
            registry(),
            transport,
            Arc::new(TestHooks { conn }),
            options,
        )
    }

    fn page(changes: Vec<ChangeRow>, next: Option<&str>, started: &str) -> SyncResponse {
        SyncResponse {
            changes,
            synced_at: "2026-02-01T12:00:00Z".to_string(),
            next_cursor: next.map(str::to_string),
            sync_started_at: Some(started.to_string()),
            ..Default::default()
        }
    }

    fn tune_row(id: &str, title: &str) -> ChangeRow {
        ChangeRow {
            table: "tune".to_string(),
            row_id: id.to_string(),
            data: json!({"id": id, "title": title, "lastModifiedAt": "2026-02-01T10:00:00Z"}),
            deleted: false,
            last_modified_at: Some("2026-02-01T10:00:00Z".to_string()),
        }
    }

    #[tokio::test]
    async fn initial_sync_pages_through_cursor_and_freezes_snapshot() {
        let conn = setup();
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(page(vec![tune_row("t1", "A"), tune_row("t2", "B")], Some("cursor-1"), "T0")),
            Ok(page(vec![tune_row("t3", "C")], None, "T0")),
        ]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));

        let report = engine.sync().await.unwrap();
        assert!(report.initial);
        assert_eq!(report.pages, 2);
        assert_eq!(report.applied, 3);
        assert_eq!(report.failed, 0);

        // Continuation echoes the cursor and snapshot, and pushes nothing.
        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].pull_cursor.is_none());
        assert_eq!(requests[1].pull_cursor.as_deref(), Some("cursor-1"));
        assert_eq!(requests[1].sync_started_at.as_deref(), Some("T0"));
        assert!(requests[1].changes.is_empty());

        // Watermark froze at the snapshot start.
        assert_eq!(
            engine.get_last_sync_timestamp().unwrap().as_deref(),
            Some("T0")
        );
        assert_eq!(engine.last_sync_mode(), Some(SyncMode::Full));

        let n: i64 = conn
            .lock()
            .query_row("SELECT COUNT(*) FROM tune", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn incremental_sync_advances_watermark_to_synced_at() {
        let conn = setup();
        // Seed a row so the cold-start heuristic stays quiet.
        conn.lock()
            .execute("INSERT INTO tune (id, title) VALUES ('seed', 'x')", [])
            .unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(page(
            vec![tune_row("t9", "Z")],
            None,
            "ignored",
        ))]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));
        {
            let guard = conn.lock();
            engine.set_watermark(&guard, "2026-01-31T00:00:00Z").unwrap();
        }

        let report = engine.sync().await.unwrap();
        assert!(!report.initial);
        assert_eq!(
            transport.requests.lock()[0].last_sync_at.as_deref(),
            Some("2026-01-31T00:00:00Z")
        );
        assert_eq!(
            engine.get_last_sync_timestamp().unwrap().as_deref(),
            Some("2026-02-01T12:00:00Z")
        );
        assert_eq!(engine.last_sync_mode(), Some(SyncMode::Incremental));
    }

    #[tokio::test]
    async fn watermark_cleared_when_tables_empty_despite_watermark() {
        let conn = setup();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(page(vec![], None, "T0"))]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));
        {
            let guard = conn.lock();
            engine.set_watermark(&guard, "2026-01-31T00:00:00Z").unwrap();
        }

        let report = engine.sync().await.unwrap();
        assert!(report.initial, "empty local tables force an initial sync");
        assert!(transport.requests.lock()[0].last_sync_at.is_none());
    }

    #[tokio::test]
    async fn missing_local_row_is_pruned_not_pushed() {
        let conn = setup();
        {
            let guard = conn.lock();
            Outbox::new(&guard)
                .enqueue("tune", "ghost", Op::Update, "2026-01-01T00:00:00Z", None)
                .unwrap();
        }
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(page(vec![], None, "T0"))]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));

        let report = engine.sync().await.unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(report.pushed, 0);
        assert!(transport.requests.lock()[0].changes.is_empty());
        assert_eq!(engine.get_outbox_stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn push_failure_resets_items_and_keeps_watermark() {
        let conn = setup();
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
        let transport = Arc::new(ScriptedTransport::new(vec![Err(
            crate::transport::TransportError::from_status(500, "insert failed"),
        )]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));

        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));

        let guard = conn.lock();
        let items = Outbox::new(&guard).get_pending(10).unwrap();
        assert_eq!(items.len(), 1, "item returns to pending");
        assert_eq!(items[0].attempts, 1);
        drop(guard);
        assert!(engine.get_last_sync_timestamp().unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_failure_blocks_watermark_advance() {
        let conn = setup();
        let bad = ChangeRow {
            table: "practice_record".to_string(),
            row_id: "p1".to_string(),
            // Not an object: the row cannot be applied.
            data: json!("garbage"),
            deleted: false,
            last_modified_at: None,
        };
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(page(vec![bad], None, "T0"))]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));

        let report = engine.sync().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(engine.get_last_sync_timestamp().unwrap().is_none());
    }

    #[tokio::test]
    async fn deletes_excluded_when_not_allowed_but_stay_pending() {
        let conn = setup();
        {
            let guard = conn.lock();
            Outbox::new(&guard)
                .enqueue("tune", "t1", Op::Delete, "2026-01-01T00:00:00Z", None)
                .unwrap();
        }
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(page(vec![], None, "T0"))]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));

        let report = engine.sync_up_from_outbox(false).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(engine.get_outbox_stats().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn push_only_run_requests_no_tables_and_keeps_watermark() {
        let conn = setup();
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
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(page(vec![], None, "T0"))]));
        let engine = engine_with(Arc::clone(&conn), Arc::clone(&transport));

        let report = engine.sync_up_from_outbox(true).await.unwrap();
        assert_eq!(report.pushed, 1);
        let requests = transport.requests.lock();
        assert_eq!(requests[0].pull_tables.as_deref(), Some(&[][..]));
        drop(requests);
        assert!(
            engine.get_last_sync_timestamp().unwrap().is_none(),
            "a push-only run must not advance the watermark"
        );
    }

    #[tokio::test]
    async fn backup_replay_is_one_shot() {
        struct BackupHooks {
            conn: Arc<Mutex<Connection>>,
            cleared: std::sync::atomic::AtomicBool,
        }
        impl HostHooks for BackupHooks {
            fn sqlite(&self) -> Arc<Mutex<Connection>> {
                Arc::clone(&self.conn)
            }
            fn enable_sync_triggers(&self, conn: &Connection) -> Result<()> {
                triggers::enable(conn)
            }
            fn suppress_sync_triggers(&self, conn: &Connection) -> Result<()> {
                triggers::suppress(conn)
            }
            fn load_outbox_backup(&self, _user: &str) -> Result<Option<crate::host::OutboxBackup>> {
                if self.cleared.load(std::sync::atomic::Ordering::SeqCst) {
                    return Ok(None);
                }
                Ok(Some(crate::host::OutboxBackup {
                    version: 1,
                    created_at: "2026-01-01T00:00:00Z".to_string(),
                    items: vec![crate::host::OutboxBackupItem {
                        table: "tune".to_string(),
                        row_id: "t1".to_string(),
                        op: Op::Update,
                        changed_at: "2026-01-01T00:00:00Z".to_string(),
                        row_data: None,
                    }],
                }))
            }
            fn clear_outbox_backup(&self, _user: &str) -> Result<()> {
                self.cleared.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let conn = setup();
        let hooks = Arc::new(BackupHooks {
            conn: Arc::clone(&conn),
            cleared: std::sync::atomic::AtomicBool::new(false),
        });
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(page(vec![], None, "T0"))]));
        let mut options = SyncEngineOptions::new("user-1");
        options.device_id = Some("dev-a".to_string());
        let engine = SyncEngine::new(registry(), transport, hooks.clone(), options);

        engine.sync().await.unwrap();
        assert_eq!(
            engine.get_outbox_stats().unwrap().pending,
            1,
            "backup item re-enqueued"
        );
        assert!(hooks.cleared.load(std::sync::atomic::Ordering::SeqCst));
    }
}
