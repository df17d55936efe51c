//! Monotonic counters and timing accumulators for the relay and bundler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonic counter safe under concurrent increment.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sum(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Running min/max/average over nanosecond samples.
#[derive(Debug)]
pub struct MinMaxAvg {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl MinMaxAvg {
    pub fn new() -> Self {
        MinMaxAvg {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    pub fn add(&self, sample_ns: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(sample_ns, Ordering::Relaxed);
        self.min.fetch_min(sample_ns, Ordering::Relaxed);
        self.max.fetch_max(sample_ns, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn min(&self) -> Option<u64> {
        match self.min.load(Ordering::Relaxed) {
            u64::MAX => None,
            v => Some(v),
        }
    }

    pub fn max(&self) -> Option<u64> {
        match self.count() {
            0 => None,
            _ => Some(self.max.load(Ordering::Relaxed)),
        }
    }

    pub fn avg(&self) -> Option<u64> {
        match self.count() {
            0 => None,
            n => Some(self.sum.load(Ordering::Relaxed) / n),
        }
    }

    pub fn clear(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for MinMaxAvg {
    fn default() -> Self {
        Self::new()
    }
}

/// The relay engine's message counters with nanosecond time accumulators.
#[derive(Debug, Default)]
pub struct RelayCounters {
    /// Messages forwarded to a local site master.
    pub forward_to_site_master: Counter,
    pub forward_sm_time_ns: Counter,
    /// Messages relayed by this site master to a remote site master.
    pub relayed: Counter,
    pub relayed_time_ns: Counter,
    /// Messages received from a remote site and delivered to a local member.
    pub forward_to_local_mbr: Counter,
    pub forward_to_local_mbr_time_ns: Counter,
}

impl RelayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.forward_to_site_master.reset();
        self.forward_sm_time_ns.reset();
        self.relayed.reset();
        self.relayed_time_ns.reset();
        self.forward_to_local_mbr.reset();
        self.forward_to_local_mbr_time_ns.reset();
    }
}

/// Converts an accumulated nanosecond total to milliseconds for reporting.
pub fn ns_to_ms(ns: u64) -> u64 {
    Duration::from_nanos(ns).as_millis() as u64
}
