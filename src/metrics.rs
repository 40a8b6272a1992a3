//! Ambient rolling-window sampling feeding the Health Monitor, generalized from
//! `performance/metrics.rs`'s per-tick snapshot collection (here there is one window per metric
//! instead of one struct per subsystem, since the core has far fewer dimensions to track).

use std::collections::VecDeque;

/// Fixed-capacity window of recent samples with p95/mean helpers. Oldest sample is evicted once
/// `capacity` is reached, same ring-buffer shape as `event_store::memory::MemoryBackend`.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Nearest-rank p95. Linear scan + sort is fine at the window sizes the core uses
    /// (hundreds of samples, sampled once per tick).
    pub fn p95(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[idx.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().cloned().fold(None, |acc, v| {
            Some(acc.map_or(v, |a: f64| a.max(v)))
        })
    }
}

/// Per-tick frame timing and throughput counters sampled by the pipeline and consumed by the
/// Health Monitor (spec §4.8).
#[derive(Debug)]
pub struct FrameMetrics {
    pub frame_ms: RollingWindow,
    pub ticks_processed: u64,
    pub ticks_degraded: u64,
}

impl FrameMetrics {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            frame_ms: RollingWindow::new(window_capacity),
            ticks_processed: 0,
            ticks_degraded: 0,
        }
    }

    pub fn record_tick(&mut self, frame_ms: f64, degraded: bool) {
        self.frame_ms.push(frame_ms);
        self.ticks_processed += 1;
        if degraded {
            self.ticks_degraded += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_oldest_past_capacity() {
        let mut w = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.max(), Some(4.0));
    }

    #[test]
    fn p95_of_uniform_samples_is_near_max() {
        let mut w = RollingWindow::new(100);
        for i in 1..=100 {
            w.push(i as f64);
        }
        assert_eq!(w.p95(), Some(95.0));
    }

    #[test]
    fn empty_window_reports_none() {
        let w = RollingWindow::new(10);
        assert_eq!(w.mean(), None);
        assert_eq!(w.p95(), None);
    }
}
