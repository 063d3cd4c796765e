//! End-to-end client flows against a scripted transport: a full local
//! schema with capture triggers, the engine, and the service facade.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::json;

use oosync_client::{
    triggers, HostHooks, Outbox, SyncEngine, SyncEngineOptions, SyncTransport, TransportError,
};
use oosync_core::{
    ChangeRow, Op, PrimaryKey, SchemaRegistry, SyncRequest, SyncResponse, TableSchema,
};

// ============================================================================
// Fixtures
// ============================================================================

struct Script {
    responses: Mutex<VecDeque<Result<SyncResponse, TransportError>>>,
    requests: Mutex<Vec<SyncRequest>>,
}

#[async_trait]
impl SyncTransport for Script {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        self.requests.lock().push(request.clone());
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(SyncResponse {
                synced_at: "2026-02-01T00:00:00Z".to_string(),
                ..Default::default()
            })
        })
    }
}

impl Script {
    fn new(responses: Vec<Result<SyncResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

struct Hooks {
    conn: Arc<Mutex<Connection>>,
}

impl HostHooks for Hooks {
    fn sqlite(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
    fn enable_sync_triggers(&self, conn: &Connection) -> oosync_client::Result<()> {
        triggers::enable(conn)
    }
    fn suppress_sync_triggers(&self, conn: &Connection) -> oosync_client::Result<()> {
        triggers::suppress(conn)
    }
}

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::new(vec![TableSchema {
        name: "tune".to_string(),
        primary_key: PrimaryKey::Single("id".to_string()),
        conflict_keys: None,
        boolean_columns: vec!["favorite".to_string()],
        timestamp_columns: vec!["last_modified_at".to_string()],
        last_modified_column: Some("last_modified_at".to_string()),
        device_column: Some("device_id".to_string()),
        soft_delete: false,
        rank: 0,
        adopt_server_id: false,
    }]))
}

fn new_conn() -> Arc<Mutex<Connection>> {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE tune (
            id TEXT PRIMARY KEY,
            title TEXT,
            favorite INTEGER NOT NULL DEFAULT 0,
            last_modified_at TEXT,
            device_id TEXT
        );",
    )
    .unwrap();
    Outbox::ensure_table(&conn).unwrap();
    triggers::install_sync_triggers(&conn, &registry()).unwrap();
    Arc::new(Mutex::new(conn))
}

fn engine(conn: &Arc<Mutex<Connection>>, transport: Arc<Script>) -> SyncEngine {
    let mut options = SyncEngineOptions::new("user-1");
    options.device_id = Some("dev-a".to_string());
    SyncEngine::new(
        registry(),
        transport,
        Arc::new(Hooks {
            conn: Arc::clone(conn),
        }),
        options,
    )
}

fn page(changes: Vec<ChangeRow>, next: Option<&str>) -> SyncResponse {
    SyncResponse {
        changes,
        synced_at: "2026-02-01T12:00:00Z".to_string(),
        next_cursor: next.map(str::to_string),
        sync_started_at: Some("2026-02-01T11:00:00Z".to_string()),
        ..Default::default()
    }
}

fn remote_tune(id: &str, title: &str) -> ChangeRow {
    ChangeRow {
        table: "tune".to_string(),
        row_id: id.to_string(),
        data: json!({"id": id, "title": title, "favorite": true, "lastModifiedAt": "2026-02-01T10:00:00Z"}),
        deleted: false,
        last_modified_at: Some("2026-02-01T10:00:00Z".to_string()),
    }
}

fn tune_titles(conn: &Connection) -> Vec<(String, String)> {
    let mut stmt = conn
        .prepare("SELECT id, title FROM tune ORDER BY id")
        .unwrap();
    stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

// ============================================================================
// Flows
// ============================================================================

/// A write made while triggers are suppressed is recovered by the backfill
/// scan and pushed by the next exchange.
#[tokio::test]
async fn suppression_window_write_is_recovered_and_pushed() {
    let conn = new_conn();
    {
        let guard = conn.lock();
        // Simulate the apply pipeline's window: triggers off, user writes.
        triggers::suppress(&guard).unwrap();
        guard
            .execute(
                "INSERT INTO tune (id, title, last_modified_at, device_id)
                 VALUES ('r1', 'Humours of Tulla', '2026-02-01T10:00:05Z', 'dev-a')",
                [],
            )
            .unwrap();
        triggers::enable(&guard).unwrap();
        assert_eq!(
            Outbox::new(&guard).stats().unwrap().pending,
            0,
            "suppressed write left no outbox entry"
        );

        let recovered = Outbox::new(&guard)
            .backfill_since(&registry(), "2026-02-01T10:00:00Z", None, Some("dev-a"))
            .unwrap();
        assert_eq!(recovered, 1);
    }

    let transport = Script::new(vec![Ok(page(vec![], None))]);
    let report = engine(&conn, Arc::clone(&transport))
        .sync()
        .await
        .unwrap();
    assert_eq!(report.pushed, 1);

    let requests = transport.requests.lock();
    assert_eq!(requests[0].changes.len(), 1);
    assert_eq!(requests[0].changes[0].table, "tune");
    assert_eq!(requests[0].changes[0].row_id, "r1");
}

/// An initial sync aborted mid-pagination converges to the same state once
/// a later sync replays the snapshot from the start.
#[tokio::test]
async fn interrupted_initial_sync_converges_on_retry() {
    // Reference run: both pages arrive.
    let reference_conn = new_conn();
    let transport = Script::new(vec![
        Ok(page(vec![remote_tune("t1", "A"), remote_tune("t2", "B")], Some("c1"))),
        Ok(page(vec![remote_tune("t3", "C")], None)),
    ]);
    engine(&reference_conn, transport).sync().await.unwrap();

    // Interrupted run: the continuation request dies, then a later sync
    // starts the initial snapshot over.
    let conn = new_conn();
    let transport = Script::new(vec![
        Ok(page(vec![remote_tune("t1", "A"), remote_tune("t2", "B")], Some("c1"))),
        Err(TransportError::network("connection reset")),
        Ok(page(vec![remote_tune("t1", "A"), remote_tune("t2", "B")], Some("c1"))),
        Ok(page(vec![remote_tune("t3", "C")], None)),
    ]);
    let eng = engine(&conn, Arc::clone(&transport));
    assert!(eng.sync().await.is_err(), "first attempt aborts mid-pagination");
    assert!(
        eng.get_last_sync_timestamp().unwrap().is_none(),
        "watermark must not advance on an aborted initial sync"
    );
    eng.sync().await.unwrap();

    assert_eq!(
        tune_titles(&reference_conn.lock()),
        tune_titles(&conn.lock()),
        "retried sync converges to the uninterrupted state"
    );
    assert_eq!(
        eng.get_last_sync_timestamp().unwrap().as_deref(),
        Some("2026-02-01T11:00:00Z")
    );
}

/// Remote pages applied through the engine leave no feedback in the outbox,
/// and a subsequent local edit still enqueues normally.
#[tokio::test]
async fn outbox_stays_quiet_for_remote_rows_but_captures_local_edits() {
    let conn = new_conn();
    let transport = Script::new(vec![Ok(page(vec![remote_tune("t1", "A")], None))]);
    let eng = engine(&conn, Arc::clone(&transport));
    eng.sync().await.unwrap();

    let guard = conn.lock();
    assert_eq!(Outbox::new(&guard).stats().unwrap().pending, 0);

    guard
        .execute(
            "UPDATE tune SET title = 'A (set)', last_modified_at = '2026-02-01T13:00:00Z' WHERE id = 't1'",
            [],
        )
        .unwrap();
    let pending = Outbox::new(&guard).get_pending(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].op, Op::Update);
    assert_eq!(pending[0].row_id, "t1");
}
