//! Ring-buffer backend: `VecDeque<SystemEvent>` behind a `parking_lot::Mutex` with short
//! critical sections, generalized from the `Arc<Mutex<Connection>>` ownership shape the teacher
//! uses for `VaultDb` (here there's no connection, just the deque itself).

use super::envelope::SystemEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct MemoryBackend {
    maxlen: usize,
    events: Mutex<VecDeque<SystemEvent>>,
}

impl MemoryBackend {
    pub fn new(maxlen: usize) -> Self {
        Self {
            maxlen: maxlen.max(1),
            events: Mutex::new(VecDeque::with_capacity(maxlen.min(1024))),
        }
    }

    pub fn append(&self, event: SystemEvent) {
        let mut guard = self.events.lock();
        if guard.len() >= self.maxlen {
            guard.pop_front();
        }
        guard.push_back(event);
    }

    pub fn recent(&self, n: usize) -> Vec<SystemEvent> {
        let guard = self.events.lock();
        let len = guard.len();
        let start = len.saturating_sub(n);
        guard.iter().skip(start).cloned().collect()
    }

    pub fn filter(
        &self,
        subsystem: Option<&str>,
        event_type: Option<&str>,
        truth_state: Option<super::envelope::TruthState>,
    ) -> Vec<SystemEvent> {
        let guard = self.events.lock();
        guard
            .iter()
            .filter(|e| subsystem.map_or(true, |s| e.subsystem == s))
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| truth_state.map_or(true, |t| e.truth_state == t))
            .cloned()
            .collect()
    }

    pub fn query(
        &self,
        from_ts: f64,
        to_ts: f64,
        types: Option<&[String]>,
        subsystems: Option<&[String]>,
        limit: Option<usize>,
    ) -> Vec<SystemEvent> {
        let guard = self.events.lock();
        let mut out: Vec<SystemEvent> = guard
            .iter()
            .filter(|e| e.ts >= from_ts && e.ts <= to_ts)
            .filter(|e| types.map_or(true, |t| t.iter().any(|ty| ty == &e.event_type)))
            .filter(|e| subsystems.map_or(true, |s| s.iter().any(|sub| sub == &e.subsystem)))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    pub fn snapshot(&self) -> Vec<SystemEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::envelope::TruthState;

    fn ev(id: u64, event_type: &str) -> SystemEvent {
        SystemEvent {
            schema_version: 1,
            event_id: id,
            ts: id as f64,
            subsystem: "FSM".into(),
            event_type: event_type.into(),
            truth_state: TruthState::Ok,
            reason: "ok".into(),
            payload: serde_json::json!({}),
            session_id: "s1".into(),
        }
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let backend = MemoryBackend::new(2);
        backend.append(ev(1, "A"));
        backend.append(ev(2, "B"));
        backend.append(ev(3, "C"));
        let recent = backend.recent(10);
        assert_eq!(
            recent.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["B", "C"]
        );
    }

    #[test]
    fn recent_preserves_insertion_order() {
        let backend = MemoryBackend::new(10);
        backend.append(ev(1, "E1"));
        backend.append(ev(2, "E2"));
        let recent = backend.recent(2);
        assert_eq!(
            recent.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["E1", "E2"]
        );
    }
}
