//! Runtime load counters.
//!
//! Storage engines record raw byte and operation counts; a sampler (driven
//! by the server once per second) folds them into per-second rates. The
//! whole thing is lock-free: handlers and engines only touch atomics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared load counters for one process.
///
/// One instance is created at startup and handed to every storage engine, so
/// tiers sharing an engine also share accounting.
#[derive(Debug, Default)]
pub struct LoadStats {
    // Raw counters, reset by each sample() call.
    key_bytes_read: AtomicU64,
    key_bytes_written: AtomicU64,
    value_bytes_read: AtomicU64,
    value_bytes_written: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,

    // Per-second rates, replaced wholesale by sample().
    key_bytes_read_sec: AtomicU64,
    key_bytes_written_sec: AtomicU64,
    value_bytes_read_sec: AtomicU64,
    value_bytes_written_sec: AtomicU64,
    gets_sec: AtomicU64,
    puts_sec: AtomicU64,

    // Gauges.
    active_handlers: AtomicUsize,
    tasks: AtomicUsize,
}

impl LoadStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Upper bound used to express `active_handlers` as a percentage.
    pub fn max_chunk_handlers() -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    pub fn record_get(&self, key_len: usize, value_len: usize) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.key_bytes_read
            .fetch_add(key_len as u64, Ordering::Relaxed);
        self.value_bytes_read
            .fetch_add(value_len as u64, Ordering::Relaxed);
    }

    pub fn record_put(&self, key_len: usize, value_len: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.key_bytes_written
            .fetch_add(key_len as u64, Ordering::Relaxed);
        self.value_bytes_written
            .fetch_add(value_len as u64, Ordering::Relaxed);
    }

    /// Fold the raw counters into per-second rates. Call once per second.
    pub fn sample(&self) {
        self.key_bytes_read_sec
            .store(self.key_bytes_read.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.key_bytes_written_sec.store(
            self.key_bytes_written.swap(0, Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.value_bytes_read_sec.store(
            self.value_bytes_read.swap(0, Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.value_bytes_written_sec.store(
            self.value_bytes_written.swap(0, Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.gets_sec
            .store(self.gets.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.puts_sec
            .store(self.puts.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }

    /// RAII guard counting an active data handler.
    pub fn handler_guard(self: &Arc<Self>) -> GaugeGuard {
        self.active_handlers.fetch_add(1, Ordering::Relaxed);
        GaugeGuard {
            stats: self.clone(),
            handler: true,
        }
    }

    /// RAII guard counting an in-flight request.
    pub fn task_guard(self: &Arc<Self>) -> GaugeGuard {
        self.tasks.fetch_add(1, Ordering::Relaxed);
        GaugeGuard {
            stats: self.clone(),
            handler: false,
        }
    }

    pub fn active_handlers(&self) -> usize {
        self.active_handlers.load(Ordering::Relaxed)
    }

    pub fn tasks(&self) -> usize {
        self.tasks.load(Ordering::Relaxed)
    }

    /// The flat counter map served by `GET /api/load`.
    pub fn report(&self) -> serde_json::Value {
        let max_handlers = Self::max_chunk_handlers();
        serde_json::json!({
            "key bytes read": self.key_bytes_read_sec.load(Ordering::Relaxed),
            "key bytes written": self.key_bytes_written_sec.load(Ordering::Relaxed),
            "value bytes read": self.value_bytes_read_sec.load(Ordering::Relaxed),
            "value bytes written": self.value_bytes_written_sec.load(Ordering::Relaxed),
            "GET requests": self.gets_sec.load(Ordering::Relaxed),
            "PUT requests": self.puts_sec.load(Ordering::Relaxed),
            "handlers active": 100 * self.active_handlers() / max_handlers,
            "tasks": self.tasks(),
        })
    }
}

/// Decrements its gauge on drop, so panicking handlers still release their
/// slot.
pub struct GaugeGuard {
    stats: Arc<LoadStats>,
    handler: bool,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        let gauge = if self.handler {
            &self.stats.active_handlers
        } else {
            &self.stats.tasks
        };
        gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_resets_raw_counters() {
        let stats = LoadStats::new();
        stats.record_get(16, 100);
        stats.record_put(16, 0);
        stats.sample();

        let report = stats.report();
        assert_eq!(report["key bytes read"], 16);
        assert_eq!(report["value bytes read"], 100);
        assert_eq!(report["GET requests"], 1);
        assert_eq!(report["PUT requests"], 1);

        // A second sample with no traffic zeroes the rates.
        stats.sample();
        assert_eq!(stats.report()["GET requests"], 0);
    }

    #[test]
    fn gauges_release_on_drop() {
        let stats = LoadStats::new();
        {
            let _h = stats.handler_guard();
            let _t = stats.task_guard();
            assert_eq!(stats.active_handlers(), 1);
            assert_eq!(stats.tasks(), 1);
        }
        assert_eq!(stats.active_handlers(), 0);
        assert_eq!(stats.tasks(), 0);
    }
}
