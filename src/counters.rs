//! Thread-safe counter bag and the uniform-step latency histogram every
//! scenario's counters are built from. No locks: every cell is an
//! `AtomicI64`, mutated with `Relaxed` ordering since counters are
//! commutative accumulators with no cross-key invariant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// A named, atomically-mutated accumulator. `name` is the full colon-
/// delimited counter key, e.g. `signalrcore:echo:success`.
#[derive(Debug, Default)]
pub struct CounterBag {
    cells: Mutex<HashMap<String, &'static AtomicI64>>,
}

// The bag leaks a small, bounded number of distinct counter cells per
// scenario for the process lifetime — scenarios are singletons, so this is
// the same footprint a `lazy_static!` counter registry would have.
impl CounterBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, name: &str) -> &'static AtomicI64 {
        let mut cells = self.cells.lock().expect("counter bag mutex poisoned");
        if let Some(cell) = cells.get(name) {
            return cell;
        }
        let leaked: &'static AtomicI64 = Box::leak(Box::new(AtomicI64::new(0)));
        cells.insert(name.to_string(), leaked);
        leaked
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, delta: i64) {
        self.cell(name).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.cell(name).load(Ordering::Relaxed)
    }

    /// Snapshot of every counter ever touched on this bag.
    pub fn snapshot(&self) -> HashMap<String, i64> {
        let cells = self.cells.lock().expect("counter bag mutex poisoned");
        cells
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// `N+1` uniform-width buckets exported as `<tag>:latency:lt_<ms>` /
/// `<tag>:latency:ge_<ms>` counters. Bucket `i < N` covers
/// `latency_ms < (i+1) * step_ms`; bucket `N` covers `latency_ms >= N * step_ms`.
pub struct LatencyHistogram {
    tag: String,
    step_ms: i64,
    buckets: Vec<AtomicI64>,
}

impl LatencyHistogram {
    pub fn new(tag: impl Into<String>, bucket_count: usize, step_ms: i64) -> Self {
        assert!(bucket_count >= 1, "histogram needs at least one bucket");
        assert!(step_ms > 0, "histogram step must be positive");
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || AtomicI64::new(0));
        Self {
            tag: tag.into(),
            step_ms,
            buckets,
        }
    }

    fn bucket_index(&self, latency_ms: i64) -> usize {
        let top = self.buckets.len() - 1;
        if latency_ms < 0 {
            return 0;
        }
        let idx = (latency_ms / self.step_ms) as usize;
        idx.min(top)
    }

    pub fn record(&self, latency_ms: i64) {
        let idx = self.bucket_index(latency_ms);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Exports every bucket as a `<tag>:latency:lt_<ms>` / `:ge_<ms>` counter.
    pub fn export_into(&self, out: &mut HashMap<String, i64>) {
        let top = self.buckets.len() - 1;
        for (i, bucket) in self.buckets.iter().enumerate() {
            let value = bucket.load(Ordering::Relaxed);
            let key = if i == top {
                format!("{}:latency:ge_{}", self.tag, i as i64 * self.step_ms)
            } else {
                format!("{}:latency:lt_{}", self.tag, (i as i64 + 1) * self.step_ms)
            };
            out.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_bag_accumulates() {
        let bag = CounterBag::new();
        bag.incr("signalrcore:echo:success");
        bag.incr("signalrcore:echo:success");
        bag.add("signalrcore:echo:msgsendcount", 5);

        let snap = bag.snapshot();
        assert_eq!(snap["signalrcore:echo:success"], 2);
        assert_eq!(snap["signalrcore:echo:msgsendcount"], 5);
    }

    #[test]
    fn counter_bag_missing_key_reads_zero() {
        let bag = CounterBag::new();
        assert_eq!(bag.get("nope"), 0);
    }

    // S2: latency bucketing.
    #[test]
    fn latency_bucketing_matches_reference_samples() {
        let hist = LatencyHistogram::new("t", 11, 100);
        for sample in [0, 99, 100, 950, 1000, 1_000_000] {
            hist.record(sample);
        }

        let mut out = HashMap::new();
        hist.export_into(&mut out);

        assert_eq!(out["t:latency:lt_100"], 2); // 0, 99
        assert_eq!(out["t:latency:lt_200"], 1); // 100
        assert_eq!(out["t:latency:lt_1000"], 1); // 950
        assert_eq!(out["t:latency:ge_1000"], 2); // 1000, 1_000_000
    }

    #[test]
    fn single_sample_mutates_exactly_one_bucket() {
        let hist = LatencyHistogram::new("t", 11, 100);
        hist.record(250);

        let mut out = HashMap::new();
        hist.export_into(&mut out);
        let touched: Vec<_> = out.iter().filter(|(_, v)| **v != 0).collect();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].0, "t:latency:lt_300");
    }
}
