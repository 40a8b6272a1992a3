//! The single chronological record of the core's decisions (spec §4.2).
//!
//! `EventStore` wraps one of two backends behind a uniform API: `MemoryBackend` (a bounded ring
//! buffer) or `SqliteBackend` (a bounded channel feeding a dedicated writer task, grounded in
//! `vault/vault_db.rs`'s `Arc<Mutex<Connection>>` shape). `event_id` is a single `AtomicU64`
//! shared across both so ids stay comparable regardless of backend.

pub mod envelope;
mod memory;
mod sqlite;

pub use envelope::{SystemEvent, TruthState, WireEvent, SCHEMA_VERSION};
use memory::MemoryBackend;
use sqlite::SqliteBackend;

use crate::clock::Clock;
use crate::config::{EventStoreBackend, EventStoreConfig};
use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

enum Backend {
    Memory(MemoryBackend),
    Sqlite(SqliteBackend),
}

pub struct EventStore {
    backend: Backend,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    session_id: String,
    strict_mode: bool,
    dropped_events: AtomicU64,
    /// Small in-memory side log for writer faults, so an operator sees them even on the
    /// SQLite backend where the primary sink may itself be failing (spec §4.2 "Failure
    /// semantics").
    fault_log: MemoryBackend,
}

impl EventStore {
    pub fn memory(maxlen: usize, clock: Arc<dyn Clock>, session_id: impl Into<String>) -> Self {
        Self {
            backend: Backend::Memory(MemoryBackend::new(maxlen)),
            clock,
            next_id: AtomicU64::new(1),
            session_id: session_id.into(),
            strict_mode: false,
            dropped_events: AtomicU64::new(0),
            fault_log: MemoryBackend::new(64),
        }
    }

    pub fn open(
        cfg: &EventStoreConfig,
        strict_mode: bool,
        clock: Arc<dyn Clock>,
        session_id: impl Into<String>,
    ) -> CoreResult<Self> {
        let now_ts = clock.now();
        let backend = match cfg.backend {
            EventStoreBackend::Memory => Backend::Memory(MemoryBackend::new(cfg.memory_maxlen)),
            EventStoreBackend::Sqlite => Backend::Sqlite(
                SqliteBackend::open(cfg.clone(), now_ts)
                    .map_err(|e| CoreError::WriterIo(e.to_string()))?,
            ),
        };
        Ok(Self {
            backend,
            clock,
            next_id: AtomicU64::new(1),
            session_id: session_id.into(),
            strict_mode,
            dropped_events: AtomicU64::new(0),
            fault_log: MemoryBackend::new(64),
        })
    }

    /// Append a new event. `ts` defaults to `Clock.now()`; callers (replay) may supply an
    /// explicit timestamp. Never blocks: a full SQLite queue drops the event and increments a
    /// counter, promoted to `Err(QueueFull)` only in strict mode.
    pub fn append(
        &self,
        subsystem: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        truth_state: TruthState,
        reason: impl Into<String>,
        ts: Option<f64>,
    ) -> CoreResult<u64> {
        let event_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = SystemEvent {
            schema_version: SCHEMA_VERSION,
            event_id,
            ts: ts.unwrap_or_else(|| self.clock.now()),
            subsystem: subsystem.into(),
            event_type: event_type.into(),
            truth_state,
            reason: reason.into(),
            payload,
            session_id: self.session_id.clone(),
        };
        if let Err(msg) = event.validate() {
            return Err(CoreError::InvalidPayload(msg));
        }

        match &self.backend {
            Backend::Memory(mem) => {
                debug!(event_type = %event.event_type, subsystem = %event.subsystem, "event appended");
                mem.append(event);
            }
            Backend::Sqlite(sql) => {
                let event_type = event.event_type.clone();
                if !sql.try_append(event) {
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                    self.record_fault("EVENTSTORE_WRITE_FAILED", "QUEUE_FULL");
                    if self.strict_mode {
                        return Err(CoreError::QueueFull);
                    }
                } else {
                    debug!(event_type = %event_type, "event enqueued to sqlite writer");
                }
            }
        }
        Ok(event_id)
    }

    fn record_fault(&self, event_type: &str, reason: &str) {
        warn!(event_type, reason, "event store write failure recorded");
        let fault = SystemEvent {
            schema_version: SCHEMA_VERSION,
            event_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            ts: self.clock.now(),
            subsystem: "EVENTSTORE".into(),
            event_type: event_type.into(),
            truth_state: TruthState::NoData,
            reason: reason.into(),
            payload: serde_json::json!({}),
            session_id: self.session_id.clone(),
        };
        self.fault_log.append(fault);
    }

    pub fn recent(&self, n: usize) -> Vec<SystemEvent> {
        match &self.backend {
            Backend::Memory(mem) => mem.recent(n),
            Backend::Sqlite(sql) => sql.recent(n),
        }
    }

    pub fn filter(
        &self,
        subsystem: Option<&str>,
        event_type: Option<&str>,
        truth_state: Option<TruthState>,
    ) -> Vec<SystemEvent> {
        let mut out = match &self.backend {
            Backend::Memory(mem) => mem.filter(subsystem, event_type, truth_state),
            Backend::Sqlite(sql) => sql.filter(subsystem, event_type, truth_state),
        };
        out.extend(
            self.fault_log
                .filter(subsystem, event_type, truth_state)
                .into_iter(),
        );
        out.sort_by_key(|e| e.event_id);
        out
    }

    pub fn query(
        &self,
        from_ts: f64,
        to_ts: f64,
        types: Option<&[String]>,
        subsystems: Option<&[String]>,
        limit: Option<usize>,
    ) -> Vec<SystemEvent> {
        match &self.backend {
            Backend::Memory(mem) => mem.query(from_ts, to_ts, types, subsystems, limit),
            Backend::Sqlite(sql) => sql.query(from_ts, to_ts, types, subsystems, limit),
        }
    }

    pub fn snapshot(&self) -> Vec<SystemEvent> {
        match &self.backend {
            Backend::Memory(mem) => mem.snapshot(),
            Backend::Sqlite(sql) => sql.snapshot(),
        }
    }

    pub fn dropped_events(&self) -> u64 {
        let backend_dropped = match &self.backend {
            Backend::Memory(_) => 0,
            Backend::Sqlite(sql) => sql.dropped_events(),
        };
        backend_dropped.max(self.dropped_events.load(Ordering::Relaxed))
    }

    /// `None` for the memory backend, which has no queue to drain.
    pub fn queue_depth(&self) -> Option<u64> {
        match &self.backend {
            Backend::Memory(_) => None,
            Backend::Sqlite(sql) => Some(sql.queue_depth()),
        }
    }

    /// Writes the current contents as JSONL (spec §6 envelope): exactly the eight frozen wire
    /// keys per line, via `WireEvent`, never the internal `event_id`. Synchronous snapshot
    /// export; the async, filtered variant lives in `trace_export`.
    pub fn export_jsonl(&self, path: &std::path::Path) -> CoreResult<usize> {
        use std::io::Write;
        let events = self.snapshot();
        let mut file = std::fs::File::create(path)
            .map_err(|e| CoreError::WriterIo(format!("create {path:?}: {e}")))?;
        for event in &events {
            let wire = WireEvent::from(event);
            let line = serde_json::to_string(&wire)
                .map_err(|e| CoreError::InvalidPayload(e.to_string()))?;
            writeln!(file, "{line}").map_err(|e| CoreError::WriterIo(e.to_string()))?;
        }
        Ok(events.len())
    }

    /// Flushes all queued events synchronously before returning (spec §4.2, §5).
    pub async fn close(&self) {
        if let Backend::Sqlite(sql) = &self.backend {
            sql.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store(maxlen: usize) -> EventStore {
        EventStore::memory(maxlen, Arc::new(SystemClock::new()), "test-session")
    }

    #[test]
    fn append_and_recent_preserve_order() {
        let store = store(10);
        store
            .append("FSM", "E1", serde_json::json!({"i": 1}), TruthState::Ok, "ok", None)
            .unwrap();
        store
            .append("FSM", "E2", serde_json::json!({"i": 2}), TruthState::Ok, "ok", None)
            .unwrap();
        let recent = store.recent(2);
        assert_eq!(
            recent.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["E1", "E2"]
        );
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let store = store(2);
        for name in ["A", "B", "C"] {
            store
                .append("FSM", name, serde_json::json!({}), TruthState::Ok, "ok", None)
                .unwrap();
        }
        let recent = store.recent(10);
        assert_eq!(
            recent.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["B", "C"]
        );
    }

    #[test]
    fn event_ids_are_strictly_increasing() {
        let store = store(10);
        let a = store
            .append("FSM", "A", serde_json::json!({}), TruthState::Ok, "ok", None)
            .unwrap();
        let b = store
            .append("FSM", "B", serde_json::json!({}), TruthState::Ok, "ok", None)
            .unwrap();
        assert!(a < b);
    }

    #[test]
    fn export_jsonl_writes_one_line_per_event() {
        let store = store(10);
        store
            .append(
                "ACTUATORS",
                "ACTUATION_RECEIPT",
                serde_json::json!({"status": "accepted"}),
                TruthState::Ok,
                "COMMAND_ACCEPTED_NO_EXECUTION_ACK",
                None,
            )
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let written = store.export_jsonl(&path).unwrap();
        assert_eq!(written, 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.trim().lines().collect();
        assert_eq!(lines.len(), 1);
        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["subsystem"], "ACTUATORS");
        assert_eq!(row["event_type"], "ACTUATION_RECEIPT");
        assert_eq!(row.as_object().unwrap().len(), 8, "wire envelope must carry exactly 8 keys");
        assert!(!row.as_object().unwrap().contains_key("event_id"));
    }

    #[test]
    fn reason_must_be_non_empty() {
        let store = store(10);
        let result = store.append("FSM", "E", serde_json::json!({}), TruthState::Ok, "", None);
        assert!(result.is_err());
    }
}
