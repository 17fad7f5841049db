//! Operational counters, behind a sink trait so deployments can export them
//! however they like. The built-in sinks are a no-op and an in-process
//! collector used by tests and the status command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::domain::ChannelId;
use crate::errors::Error;

/// Coarse error buckets for counting, far more stable than error strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Auth,
    RateLimited,
    NotFound,
    Permission,
    Transient,
    QueueFull,
    BreakerOpen,
    Storage,
    Other,
}

impl From<&Error> for ErrorCategory {
    fn from(err: &Error) -> Self {
        match err {
            Error::Auth(_) | Error::AuthLost => ErrorCategory::Auth,
            Error::RateLimited { .. } => ErrorCategory::RateLimited,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::PermissionLost { .. } => ErrorCategory::Permission,
            Error::Transient(_) => ErrorCategory::Transient,
            Error::QueueFull { .. } => ErrorCategory::QueueFull,
            Error::BreakerOpen => ErrorCategory::BreakerOpen,
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => ErrorCategory::Storage,
            _ => ErrorCategory::Other,
        }
    }
}

/// Sink for orchestrator events. All methods default to no-ops so a sink only
/// implements what it cares about.
pub trait MetricsSink: Send + Sync {
    fn message_forwarded(&self, _destination: ChannelId) {}
    fn message_dropped(&self, _destination: ChannelId) {}
    fn duplicate_suppressed(&self) {}
    fn queue_depth(&self, _destination: ChannelId, _depth: usize) {}
    fn error(&self, _category: ErrorCategory) {}
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Counts everything in memory. Cheap enough to run in production and is what
/// the status report reads from.
#[derive(Default)]
pub struct InProcessMetrics {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
    errors: Mutex<HashMap<ErrorCategory, u64>>,
    depths: Mutex<HashMap<ChannelId, usize>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub forwarded: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub errors: HashMap<ErrorCategory, u64>,
    pub queue_depths: HashMap<ChannelId, usize>,
}

impl InProcessMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            errors: self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            queue_depths: self.depths.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}

impl MetricsSink for InProcessMetrics {
    fn message_forwarded(&self, _destination: ChannelId) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn message_dropped(&self, _destination: ChannelId) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn duplicate_suppressed(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_depth(&self, destination: ChannelId, depth: usize) {
        self.depths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(destination, depth);
    }

    fn error(&self, category: ErrorCategory) {
        *self
            .errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(category)
            .or_insert(0) += 1;
    }
}
