use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Keep the tail of the stream in memory; the total count keeps growing.
const MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub endpoint: &'static str,
    pub path: String,
    pub method: String,
    pub remote: String,
    pub body: serde_json::Value,
}

/// Append-only log of every HTTP call the bridge answers, kept for post-hoc
/// diagnosis of firmware behavior. Appended regardless of outcome; ordering
/// across concurrent writers is whatever the lock hands out, but no entry
/// is lost.
#[derive(Default)]
pub struct RequestLog {
    entries: Mutex<VecDeque<LogEntry>>,
    total: AtomicU64,
}

impl RequestLog {
    pub fn append(&self, entry: LogEntry) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        if entries.len() == MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Number of requests intercepted since start, including ones whose
    /// entries have rotated out of the ring.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(endpoint: &'static str) -> LogEntry {
        LogEntry {
            at: Utc::now(),
            endpoint,
            path: "/".to_string(),
            method: "POST".to_string(),
            remote: "127.0.0.1".to_string(),
            body: json!({}),
        }
    }

    #[test]
    fn total_survives_ring_rotation() {
        let log = RequestLog::default();
        for _ in 0..(MAX_ENTRIES + 5) {
            log.append(entry("accessCloud"));
        }
        assert_eq!(log.total(), (MAX_ENTRIES + 5) as u64);
        assert_eq!(log.recent(usize::MAX).len(), MAX_ENTRIES);
    }

    #[test]
    fn recent_returns_newest_first() {
        let log = RequestLog::default();
        log.append(entry("first"));
        log.append(entry("second"));
        let recent = log.recent(1);
        assert_eq!(recent[0].endpoint, "second");
    }

    #[test]
    fn no_entries_lost_under_concurrent_appends() {
        let log = std::sync::Arc::new(RequestLog::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        log.append(entry("catchAll"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.total(), 800);
    }
}
