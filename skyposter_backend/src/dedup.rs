//! At-most-once reply bookkeeping.
//!
//! A comment id moves through `claimed` (a worker is replying to it) to
//! `processed` (a reply went out). Claiming is a single atomic check-and-set,
//! so two overlapping polls cannot both decide to answer the same comment.
//! Processed ids are kept in an LRU bounded by `capacity`.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct DedupInner {
    /// id -> generation of its most recent touch
    processed: HashMap<String, u64>,
    /// Recency queue with lazily discarded stale generations
    recency: VecDeque<(String, u64)>,
    generation: u64,
    claimed: HashSet<String>,
    checkpoint: Option<DateTime<Utc>>,
}

impl DedupInner {
    fn touch(&mut self, id: &str) {
        self.generation += 1;
        let generation = self.generation;
        self.processed.insert(id.to_string(), generation);
        self.recency.push_back((id.to_string(), generation));
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.processed.len() > capacity {
            let Some((id, generation)) = self.recency.pop_front() else {
                break;
            };
            if self.processed.get(&id) == Some(&generation) {
                self.processed.remove(&id);
            }
        }

        // Drop stale queue entries once they dominate.
        if self.recency.len() > capacity.saturating_mul(2).max(16) {
            let processed = &self.processed;
            self.recency
                .retain(|(id, generation)| processed.get(id) == Some(generation));
        }
    }
}

pub struct DedupTracker {
    capacity: usize,
    inner: Mutex<DedupInner>,
}

impl DedupTracker {
    /// `checkpoint` is the initial watermark: notifications at or before it are
    /// never answered. `None` answers the whole backlog.
    pub fn new(capacity: usize, checkpoint: Option<DateTime<Utc>>) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(DedupInner {
                checkpoint,
                ..DedupInner::default()
            }),
        }
    }

    /// True when the comment was answered or is being answered right now.
    pub fn contains(&self, id: &str) -> bool {
        let mut inner = self.lock();
        if inner.claimed.contains(id) {
            return true;
        }
        if inner.processed.contains_key(id) {
            inner.touch(id);
            inner.evict_to(self.capacity);
            return true;
        }
        false
    }

    /// True while a worker holds the claim on `id`.
    pub fn is_claimed(&self, id: &str) -> bool {
        self.lock().claimed.contains(id)
    }

    /// Reserve `id` for a reply. Returns false if it is already processed or
    /// claimed by another worker.
    pub fn try_claim(&self, id: &str) -> bool {
        let mut inner = self.lock();
        if inner.processed.contains_key(id) || inner.claimed.contains(id) {
            return false;
        }
        inner.claimed.insert(id.to_string());
        true
    }

    /// The reply for `id` went out; remember it for good.
    pub fn confirm(&self, id: &str) {
        let mut inner = self.lock();
        inner.claimed.remove(id);
        inner.touch(id);
        inner.evict_to(self.capacity);
    }

    /// The reply attempt failed; let a later poll try again.
    pub fn release(&self, id: &str) {
        self.lock().claimed.remove(id);
    }

    pub fn checkpoint(&self) -> Option<DateTime<Utc>> {
        self.lock().checkpoint
    }

    /// Move the watermark forward. Never moves it backwards.
    pub fn advance_checkpoint(&self, to: DateTime<Utc>) {
        let mut inner = self.lock();
        if inner.checkpoint.map(|current| to > current).unwrap_or(true) {
            inner.checkpoint = Some(to);
        }
    }

    pub fn processed_len(&self) -> usize {
        self.lock().processed.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DedupInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn claim_confirm_release_lifecycle() {
        let dedup = DedupTracker::new(100, None);

        assert!(!dedup.contains("c1"));
        assert!(dedup.try_claim("c1"));
        assert!(dedup.contains("c1"));
        assert!(!dedup.try_claim("c1"));

        dedup.release("c1");
        assert!(!dedup.contains("c1"));
        assert!(dedup.try_claim("c1"));

        dedup.confirm("c1");
        assert!(dedup.contains("c1"));
        assert!(!dedup.try_claim("c1"));
        assert_eq!(dedup.processed_len(), 1);
    }

    #[test]
    fn evicts_least_recently_seen() {
        let dedup = DedupTracker::new(2, None);
        dedup.confirm("a");
        dedup.confirm("b");
        // Seeing "a" again makes "b" the eviction candidate.
        assert!(dedup.contains("a"));
        dedup.confirm("c");

        assert!(dedup.contains("a"));
        assert!(!dedup.contains("b"));
        assert!(dedup.contains("c"));
        assert_eq!(dedup.processed_len(), 2);
    }

    #[test]
    fn recency_queue_stays_bounded() {
        let dedup = DedupTracker::new(4, None);
        for i in 0..4 {
            dedup.confirm(&format!("id-{}", i));
        }
        for _ in 0..1_000 {
            assert!(dedup.contains("id-0"));
            dedup.confirm("id-1");
        }
        let inner = dedup.lock();
        assert!(inner.recency.len() <= 16 + 1);
    }

    #[test]
    fn repeated_lookups_alone_keep_recency_bounded() {
        let dedup = DedupTracker::new(4, None);
        for i in 0..4 {
            dedup.confirm(&format!("id-{}", i));
        }
        for _ in 0..1_000 {
            assert!(dedup.contains("id-0"));
        }
        assert!(dedup.lock().recency.len() <= 16 + 1);
        assert_eq!(dedup.processed_len(), 4);
    }

    #[test]
    fn claimed_and_processed_are_distinguished() {
        let dedup = DedupTracker::new(10, None);
        assert!(dedup.try_claim("c1"));
        assert!(dedup.is_claimed("c1"));

        dedup.confirm("c1");
        assert!(!dedup.is_claimed("c1"));
        assert!(dedup.contains("c1"));
    }

    #[test]
    fn checkpoint_only_moves_forward() {
        let start = Utc::now();
        let dedup = DedupTracker::new(10, Some(start));

        dedup.advance_checkpoint(start - Duration::minutes(5));
        assert_eq!(dedup.checkpoint(), Some(start));

        dedup.advance_checkpoint(start + Duration::minutes(5));
        assert_eq!(dedup.checkpoint(), Some(start + Duration::minutes(5)));
    }

    #[test]
    fn only_one_concurrent_claim_wins() {
        let dedup = Arc::new(DedupTracker::new(100, None));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if dedup.try_claim("same-comment") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
