//! Asynchronous SQLite sink. One dedicated writer task owns the write connection (WAL mode,
//! `synchronous=NORMAL`, matching `VaultDb::new`); producers enqueue through a bounded
//! `mpsc::channel` with `try_send` so a full queue drops the event instead of blocking the
//! producer (spec §4.2, §5). A second, read-only connection serves `filter`/`query`/`recent`
//! concurrently with the writer under WAL.

use super::envelope::{SystemEvent, TruthState};
use crate::config::EventStoreConfig;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

enum WriterMsg {
    Append(SystemEvent),
    Close(oneshot::Sender<()>),
}

pub struct SqliteBackend {
    tx: mpsc::Sender<WriterMsg>,
    read_conn: Arc<Mutex<Connection>>,
    dropped_events: Arc<AtomicU64>,
    queue_max: usize,
}

fn open_conn(path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            event_id INTEGER PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            ts REAL NOT NULL,
            subsystem TEXT NOT NULL,
            event_type TEXT NOT NULL,
            truth_state TEXT NOT NULL,
            reason TEXT NOT NULL,
            payload TEXT NOT NULL,
            session_id TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts ASC)", [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_subsystem ON events(subsystem, ts ASC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, ts ASC)",
        [],
    )?;
    Ok(conn)
}

fn truth_state_str(t: TruthState) -> &'static str {
    match t {
        TruthState::Ok => "OK",
        TruthState::NoData => "NO_DATA",
        TruthState::Fallback => "FALLBACK",
    }
}

fn truth_state_from_str(s: &str) -> TruthState {
    match s {
        "NO_DATA" => TruthState::NoData,
        "FALLBACK" => TruthState::Fallback,
        _ => TruthState::Ok,
    }
}

fn insert_event(conn: &Connection, event: &SystemEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO events
            (event_id, schema_version, ts, subsystem, event_type, truth_state, reason, payload, session_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.event_id as i64,
            event.schema_version,
            event.ts,
            event.subsystem,
            event.event_type,
            truth_state_str(event.truth_state),
            event.reason,
            event.payload.to_string(),
            event.session_id,
        ],
    )?;
    Ok(())
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<SystemEvent> {
    let payload_raw: String = row.get(7)?;
    Ok(SystemEvent {
        event_id: row.get::<_, i64>(0)? as u64,
        schema_version: row.get(1)?,
        ts: row.get(2)?,
        subsystem: row.get(3)?,
        event_type: row.get(4)?,
        truth_state: truth_state_from_str(&row.get::<_, String>(5)?),
        reason: row.get(6)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        session_id: row.get(8)?,
    })
}

fn apply_retention(conn: &Connection, cfg: &EventStoreConfig, now_ts: f64) -> rusqlite::Result<()> {
    let cutoff = now_ts - cfg.retention_hours * 3600.0;
    conn.execute("DELETE FROM events WHERE ts < ?1", params![cutoff])?;

    if cfg.db_path != ":memory:" {
        if let Ok(meta) = std::fs::metadata(&cfg.db_path) {
            let size_mb = meta.len() as f64 / (1024.0 * 1024.0);
            if size_mb > cfg.max_db_mb {
                // Evict the oldest 10% of rows to bring the file back under budget.
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
                let evict = (total / 10).max(1);
                conn.execute(
                    "DELETE FROM events WHERE event_id IN (SELECT event_id FROM events ORDER BY event_id ASC LIMIT ?1)",
                    params![evict],
                )?;
            }
        }
    }
    Ok(())
}

impl SqliteBackend {
    pub fn open(cfg: EventStoreConfig, now_ts: f64) -> rusqlite::Result<Self> {
        let write_conn = open_conn(&cfg.db_path)?;
        let read_conn = Arc::new(Mutex::new(open_conn(&cfg.db_path)?));
        let dropped_events = Arc::new(AtomicU64::new(0));
        let queue_max = cfg.queue_max.max(1);
        let (tx, rx) = mpsc::channel(queue_max);

        tokio::spawn(writer_task(write_conn, rx, cfg, now_ts));

        Ok(Self {
            tx,
            read_conn,
            dropped_events,
            queue_max,
        })
    }

    /// Number of events currently enqueued but not yet flushed to disk, sampled for the Health
    /// Monitor's `sqlite_queue_depth` metric.
    pub fn queue_depth(&self) -> u64 {
        (self.queue_max.saturating_sub(self.tx.capacity())) as u64
    }

    /// Returns `true` if the event was enqueued, `false` if the queue was full and the event
    /// was dropped (counter incremented either way the caller can inspect via `dropped_events`).
    pub fn try_append(&self, event: SystemEvent) -> bool {
        match self.tx.try_send(WriterMsg::Append(event)) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                warn!("event store sqlite queue full, dropping event");
                false
            }
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Close(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn recent(&self, n: usize) -> Vec<SystemEvent> {
        let conn = self.read_conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT event_id, schema_version, ts, subsystem, event_type, truth_state, reason, payload, session_id
             FROM events ORDER BY event_id DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map(params![n as i64], row_to_event);
        let mut out: Vec<SystemEvent> = rows
            .map(|r| r.filter_map(|x| x.ok()).collect())
            .unwrap_or_default();
        out.reverse();
        out
    }

    pub fn filter(
        &self,
        subsystem: Option<&str>,
        event_type: Option<&str>,
        truth_state: Option<TruthState>,
    ) -> Vec<SystemEvent> {
        let conn = self.read_conn.lock();
        let mut sql = String::from(
            "SELECT event_id, schema_version, ts, subsystem, event_type, truth_state, reason, payload, session_id FROM events WHERE 1=1",
        );
        if subsystem.is_some() {
            sql.push_str(" AND subsystem = ?1");
        }
        if event_type.is_some() {
            sql.push_str(" AND event_type = ?2");
        }
        if truth_state.is_some() {
            sql.push_str(" AND truth_state = ?3");
        }
        sql.push_str(" ORDER BY event_id ASC");

        let sub = subsystem.unwrap_or_default();
        let ty = event_type.unwrap_or_default();
        let ts = truth_state.map(truth_state_str).unwrap_or_default();

        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![sub, ty, ts], row_to_event)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn query(
        &self,
        from_ts: f64,
        to_ts: f64,
        types: Option<&[String]>,
        subsystems: Option<&[String]>,
        limit: Option<usize>,
    ) -> Vec<SystemEvent> {
        let conn = self.read_conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT event_id, schema_version, ts, subsystem, event_type, truth_state, reason, payload, session_id
             FROM events WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts ASC, event_id ASC",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let mut out: Vec<SystemEvent> = stmt
            .query_map(params![from_ts, to_ts], row_to_event)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default();
        if let Some(types) = types {
            out.retain(|e| types.iter().any(|t| t == &e.event_type));
        }
        if let Some(subsystems) = subsystems {
            out.retain(|e| subsystems.iter().any(|s| s == &e.subsystem));
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    pub fn snapshot(&self) -> Vec<SystemEvent> {
        self.query(f64::MIN, f64::MAX, None, None, None)
    }
}

async fn writer_task(
    conn: Connection,
    mut rx: mpsc::Receiver<WriterMsg>,
    cfg: EventStoreConfig,
    mut last_retention_ts: f64,
) {
    let mut pending: Vec<SystemEvent> = Vec::with_capacity(cfg.batch_size);
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(cfg.flush_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(WriterMsg::Append(event)) => {
                        last_retention_ts = event.ts.max(last_retention_ts);
                        pending.push(event);
                        if pending.len() >= cfg.batch_size {
                            flush(&conn, &mut pending, &cfg, last_retention_ts);
                        }
                    }
                    Some(WriterMsg::Close(done)) => {
                        flush(&conn, &mut pending, &cfg, last_retention_ts);
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        flush(&conn, &mut pending, &cfg, last_retention_ts);
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush(&conn, &mut pending, &cfg, last_retention_ts);
                }
            }
        }
    }
}

fn flush(conn: &Connection, pending: &mut Vec<SystemEvent>, cfg: &EventStoreConfig, now_ts: f64) {
    if pending.is_empty() {
        return;
    }
    let result: rusqlite::Result<()> = (|| {
        let tx = conn.unchecked_transaction()?;
        for event in pending.iter() {
            insert_event(&tx, event)?;
        }
        apply_retention(&tx, cfg, now_ts)?;
        tx.commit()
    })();
    if let Err(err) = result {
        error!(error = %err, "event store sqlite writer batch failed");
    }
    pending.clear();
}
