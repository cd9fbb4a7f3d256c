//! Read-through cache for per-student resolution reports.
//!
//! Keyed by canonical student id and bounded both ways: LRU for size, TTL
//! for staleness. The administrative replace path invalidates wholesale, so
//! the TTL only matters when an external writer bypasses the daemon.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::tasks::ResolutionReport;

struct CachedReport {
    report: ResolutionReport,
    cached_at: Instant,
}

impl CachedReport {
    fn is_valid(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() < ttl
    }
}

pub struct TaskCache {
    entries: LruCache<String, CachedReport>,
    ttl: Duration,
}

impl TaskCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn get(&mut self, student_id: &str) -> Option<ResolutionReport> {
        let expired = match self.entries.get(student_id) {
            Some(hit) if hit.is_valid(self.ttl) => return Some(hit.report.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(student_id);
        }
        None
    }

    pub fn put(&mut self, student_id: String, report: ResolutionReport) {
        self.entries.put(
            student_id,
            CachedReport {
                report,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TaskCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(256).unwrap(), Duration::from_secs(30))
    }
}
