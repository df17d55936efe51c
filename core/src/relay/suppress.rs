//! Time-windowed deduplication of identical log events.
//!
//! Used to keep "no route to site X" from flooding the log: at most one
//! record per key per window is emitted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressLevel {
    Error,
    Warn,
}

/// Emits at most one record per key per window.
pub struct SuppressLog<K: Eq + Hash> {
    cache: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash> SuppressLog<K> {
    pub fn new() -> Self {
        SuppressLog { cache: Mutex::new(HashMap::new()) }
    }

    /// Logs `msg` at `level` unless the same key was logged within the
    /// last `window`. Returns whether a record was emitted.
    pub fn log(&self, level: SuppressLevel, key: K, window: Duration, msg: &str) -> bool {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        if let Some(last) = cache.get(&key) {
            if now.duration_since(*last) < window {
                return false;
            }
        }
        cache.insert(key, now);
        drop(cache);
        match level {
            SuppressLevel::Error => {
                error!("{} (suppressing identical reports for {:?})", msg, window)
            }
            SuppressLevel::Warn => {
                warn!("{} (suppressing identical reports for {:?})", msg, window)
            }
        }
        true
    }

    /// Evicts entries older than `window`.
    pub fn remove_expired(&self, window: Duration) {
        let now = Instant::now();
        self.cache.lock().retain(|_, last| now.duration_since(*last) < window);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl<K: Eq + Hash> Default for SuppressLog<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_log_emits_repeat_suppressed() {
        let log: SuppressLog<String> = SuppressLog::new();
        let window = Duration::from_secs(60);
        assert!(log.log(SuppressLevel::Error, "TOK".into(), window, "no route to TOK"));
        assert!(!log.log(SuppressLevel::Error, "TOK".into(), window, "no route to TOK"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_distinct_keys_log_independently() {
        let log: SuppressLog<String> = SuppressLog::new();
        let window = Duration::from_secs(60);
        assert!(log.log(SuppressLevel::Error, "TOK".into(), window, "no route to TOK"));
        assert!(log.log(SuppressLevel::Error, "NYC".into(), window, "no route to NYC"));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_emits_again_after_window() {
        let log: SuppressLog<String> = SuppressLog::new();
        let window = Duration::from_millis(5);
        assert!(log.log(SuppressLevel::Warn, "TOK".into(), window, "no route"));
        std::thread::sleep(Duration::from_millis(10));
        assert!(log.log(SuppressLevel::Warn, "TOK".into(), window, "no route"));
    }

    #[test]
    fn test_remove_expired() {
        let log: SuppressLog<String> = SuppressLog::new();
        log.log(SuppressLevel::Error, "TOK".into(), Duration::from_millis(5), "x");
        std::thread::sleep(Duration::from_millis(10));
        log.log(SuppressLevel::Error, "NYC".into(), Duration::from_secs(60), "y");
        log.remove_expired(Duration::from_millis(5));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_clear() {
        let log: SuppressLog<String> = SuppressLog::new();
        log.log(SuppressLevel::Error, "TOK".into(), Duration::from_secs(60), "x");
        log.clear();
        assert!(log.is_empty());
    }
}
