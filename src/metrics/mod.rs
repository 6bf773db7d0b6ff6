use crate::types::OpKind;
use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Session counters and submit-to-completion latencies
pub struct Metrics {
    operation_latencies: Mutex<HashMap<String, Histogram<u64>>>,
    submitted: AtomicU64,
    completed: AtomicU64,
    callbacks: AtomicU64,
    callback_panics: AtomicU64,
    pool_exhausted: AtomicU64,
    queue_full: AtomicU64,
    invalid_argument: AtomicU64,
    duplicate_completions: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operation_latencies: Mutex::new(HashMap::new()),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            invalid_argument: AtomicU64::new(0),
            duplicate_completions: AtomicU64::new(0),
        }
    }

    pub fn record_latency(&self, op: OpKind, duration: Duration) {
        let mut latencies = self
            .operation_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let histogram = latencies
            .entry(op.as_str().to_string())
            .or_insert_with(|| Histogram::<u64>::new(3).expect("3 significant figures is valid"));

        let micros = duration.as_micros() as u64;
        let _ = histogram.record(micros);
    }

    pub fn increment_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_callbacks(&self) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_callback_panics(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalid_argument(&self) {
        self.invalid_argument.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_duplicate_completions(&self) {
        self.duplicate_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_percentiles(&self, op: OpKind) -> (f64, f64, f64) {
        let latencies = self
            .operation_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(histogram) = latencies.get(op.as_str()) {
            let p50 = histogram.value_at_quantile(0.50) as f64;
            let p95 = histogram.value_at_quantile(0.95) as f64;
            let p99 = histogram.value_at_quantile(0.99) as f64;
            (p50, p95, p99)
        } else {
            (0.0, 0.0, 0.0)
        }
    }

    pub fn get_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> MetricsReport {
        let mut operation_latencies = HashMap::new();
        let latencies = self
            .operation_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for (op, histogram) in latencies.iter() {
            let p50 = histogram.value_at_quantile(0.50) as f64;
            let p95 = histogram.value_at_quantile(0.95) as f64;
            let p99 = histogram.value_at_quantile(0.99) as f64;
            operation_latencies.insert(op.clone(), (p50, p95, p99));
        }

        MetricsReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            callbacks: self.callbacks.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            invalid_argument: self.invalid_argument.load(Ordering::Relaxed),
            duplicate_completions: self.duplicate_completions.load(Ordering::Relaxed),
            operation_latencies,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsReport {
    pub submitted: u64,
    pub completed: u64,
    pub callbacks: u64,
    pub callback_panics: u64,
    pub pool_exhausted: u64,
    pub queue_full: u64,
    pub invalid_argument: u64,
    pub duplicate_completions: u64,
    pub operation_latencies: HashMap<String, (f64, f64, f64)>, // (p50, p95, p99)
}
