//! Threads the agent started, keyed by root post id.
//!
//! Written by the publisher, read by the notification worker. Readers get
//! snapshots, never a live view.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::social::PostRef;

/// A conversation root the agent created. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    root: PostRef,
    created_at: DateTime<Utc>,
}

impl Thread {
    /// A thread only exists once both halves of its root address are known.
    pub fn new(root: PostRef, created_at: DateTime<Utc>) -> Self {
        Self { root, created_at }
    }

    pub fn root(&self) -> &PostRef {
        &self.root
    }

    pub fn root_id(&self) -> &str {
        &self.root.id
    }

    pub fn root_content_id(&self) -> &str {
        &self.root.content_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Default)]
struct RegistryInner {
    by_root: HashMap<String, Thread>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

pub struct ThreadRegistry {
    capacity: usize,
    inner: RwLock<RegistryInner>,
}

impl ThreadRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Add a thread. Re-recording a known root is a no-op. When full, the
    /// oldest thread is evicted.
    pub fn record(&self, thread: Thread) {
        let mut inner = self.write();
        if inner.by_root.contains_key(thread.root_id()) {
            return;
        }

        inner.order.push_back(thread.root_id().to_string());
        inner.by_root.insert(thread.root_id().to_string(), thread);

        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.by_root.remove(&evicted);
                tracing::debug!("Thread registry full, evicted {}", evicted);
            }
        }
    }

    pub fn get(&self, root_id: &str) -> Option<Thread> {
        self.read().by_root.get(root_id).cloned()
    }

    /// Snapshot of all tracked threads, oldest first.
    pub fn active_threads(&self) -> Vec<Thread> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_root.get(id).cloned())
            .collect()
    }

    /// Forget threads created before `before`. Returns how many were removed.
    pub fn expire(&self, before: DateTime<Utc>) -> usize {
        let mut inner = self.write();
        let RegistryInner { by_root, order } = &mut *inner;
        let initial = order.len();
        order.retain(|id| {
            let expired = by_root
                .get(id)
                .map(|thread| thread.created_at() < before)
                .unwrap_or(true);
            if expired {
                by_root.remove(id);
            }
            !expired
        });
        initial - order.len()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
