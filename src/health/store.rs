use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::model::Metrics;

#[derive(Debug)]
struct Inner {
    latest: Option<Metrics>,
    history: VecDeque<Metrics>,
    capacity: usize,
}

/// Latest metrics snapshot plus a bounded history, shared between the
/// aggregator (writer) and query paths (readers).
#[derive(Debug)]
pub struct MetricsStore {
    inner: Mutex<Inner>,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                latest: None,
                history: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
            }),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, metrics: Metrics) {
        let mut inner = self.guard();
        if inner.history.len() == inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(metrics.clone());
        inner.latest = Some(metrics);
    }

    pub fn latest(&self) -> Option<Metrics> {
        self.guard().latest.clone()
    }

    /// Retained snapshots, oldest first.
    pub fn history(&self) -> Vec<Metrics> {
        self.guard().history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.guard().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().history.is_empty()
    }
}
