//! Tracer trait for observing fiber activity.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! what the cache does with each fiber. The default [`NoopTracer`] discards
//! everything; [`LogTracer`] forwards events to the `tracing` crate.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use suspense_query::{FiberCache, QueryKey, TaskQueue, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_fiber_created(&self, key: &QueryKey) {
//!         println!("fiber created: {key:?}");
//!     }
//! }
//!
//! let cache = FiberCache::builder(Arc::new(TaskQueue::new()))
//!     .tracer(PrintTracer)
//!     .build();
//! # let _ = cache;
//! ```

use crate::async_result::Status;
use crate::key::QueryKey;
use crate::promise::HandleId;

/// How a run produced its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The producer returned a value, or a handle that had already settled.
    Ready,
    /// The producer returned a fresh pending handle.
    Pending,
    /// The producer returned a handle or result it had returned before.
    Reused,
    /// A fulfilled result for the same arguments was served from the
    /// per-argument cache without calling the producer.
    Cached,
}

/// Reason for evicting a fiber's results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionReason {
    /// Evicted by an explicit call.
    Manual,
    /// Evicted because `source` was fulfilled by a run that declared this
    /// fiber as a dependent.
    Dependency { source: QueryKey },
}

/// Tracer trait for observing fiber activity.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: settlements may arrive on any
/// thread and report through the same tracer.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a fiber is created on first use of its key.
    #[inline]
    fn on_fiber_created(&self, _key: &QueryKey) {}

    /// Called after a fiber runs (or reuses) its producer.
    #[inline]
    fn on_run(&self, _key: &QueryKey, _outcome: RunOutcome) {}

    /// Called after a fiber drains its update queue.
    #[inline]
    fn on_commit(&self, _key: &QueryKey, _current: Option<Status>) {}

    /// Called when a handle settles after a newer run superseded it.
    #[inline]
    fn on_stale_settlement(&self, _key: &QueryKey, _handle: HandleId) {}

    /// Called when subscribers are notified.
    #[inline]
    fn on_notify(&self, _key: &QueryKey, _urgent: usize, _deferred: usize) {}

    /// Called when a fiber's results are evicted.
    #[inline]
    fn on_evict(&self, _key: &QueryKey, _reason: EvictionReason) {}

    /// Called when a read suspends on a pending handle.
    #[inline]
    fn on_suspend(&self, _key: &QueryKey, _handle: HandleId) {}

    /// Called when a consumer renders back from suspension and committed the
    /// settled result.
    #[inline]
    fn on_resync(&self, _key: &QueryKey) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`FiberCache`](crate::FiberCache).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards events to the `tracing` crate.
///
/// Lifecycle events are emitted at `debug`, notifications at `trace`.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_fiber_created(&self, key: &QueryKey) {
        tracing::debug!(query = ?key, "fiber created");
    }

    fn on_run(&self, key: &QueryKey, outcome: RunOutcome) {
        tracing::debug!(query = ?key, ?outcome, "run");
    }

    fn on_commit(&self, key: &QueryKey, current: Option<Status>) {
        tracing::trace!(query = ?key, ?current, "committed update queue");
    }

    fn on_stale_settlement(&self, key: &QueryKey, handle: HandleId) {
        tracing::debug!(query = ?key, %handle, "ignored settlement of superseded handle");
    }

    fn on_notify(&self, key: &QueryKey, urgent: usize, deferred: usize) {
        tracing::trace!(query = ?key, urgent, deferred, "notify");
    }

    fn on_evict(&self, key: &QueryKey, reason: EvictionReason) {
        tracing::debug!(query = ?key, ?reason, "evicted");
    }

    fn on_suspend(&self, key: &QueryKey, handle: HandleId) {
        tracing::debug!(query = ?key, %handle, "suspended");
    }

    fn on_resync(&self, key: &QueryKey) {
        tracing::debug!(query = ?key, "resynced after suspension");
    }
}
