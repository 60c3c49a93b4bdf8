//! Settle-once asynchronous handles.
//!
//! A [`Promise`] is the raw asynchronous handle a producer hands back when its
//! value is not ready yet. The producer keeps the matching [`Resolver`] and
//! settles it exactly once, from any thread. Settlement is terminal: once a
//! handle is fulfilled or rejected, every later observation sees the same
//! value or reason.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::async_result::AsyncResult;

/// Identity of an asynchronous handle.
///
/// Assigned once when the handle is created and kept across settlement, so a
/// fulfilled [`AsyncResult`] can be matched against the pending handle it came
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    pub(crate) fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final state of a settled handle.
pub enum Outcome<T> {
    /// The handle resolved with a value.
    Fulfilled(Arc<T>),
    /// The handle was rejected.
    Rejected(Arc<anyhow::Error>),
}

impl<T> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Fulfilled(value) => Outcome::Fulfilled(value.clone()),
            Outcome::Rejected(reason) => Outcome::Rejected(reason.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Fulfilled(value) => f.debug_tuple("Fulfilled").field(value).finish(),
            Outcome::Rejected(reason) => f.debug_tuple("Rejected").field(reason).finish(),
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;
type AbortHook = Box<dyn FnOnce() + Send>;

struct PromiseState<T> {
    outcome: Option<Outcome<T>>,
    /// Set once the engine has classified this handle and attached its own
    /// continuation; a tagged handle is reused as is.
    tagged: bool,
    continuations: Vec<Continuation<T>>,
    abort: Option<AbortHook>,
}

struct Shared<T> {
    id: HandleId,
    state: Mutex<PromiseState<T>>,
}

impl<T> Shared<T> {
    fn new(outcome: Option<Outcome<T>>) -> Arc<Self> {
        Arc::new(Self {
            id: HandleId::next(),
            state: Mutex::new(PromiseState {
                outcome,
                tagged: false,
                continuations: Vec::new(),
                abort: None,
            }),
        })
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let continuations = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            state.abort = None;
            std::mem::take(&mut state.continuations)
        };
        for continuation in continuations {
            continuation(&outcome);
        }
        true
    }
}

/// A raw asynchronous handle.
///
/// Cloning is cheap and every clone observes the same settlement.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// The settling side of a [`Promise`].
///
/// Dropping a resolver without settling leaves the promise pending forever.
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Create a pending promise and the resolver that settles it.
    pub fn new() -> (Promise<T>, Resolver<T>) {
        let shared = Shared::new(None);
        (
            Promise {
                shared: shared.clone(),
            },
            Resolver { shared },
        )
    }

    /// Create a promise that is already fulfilled.
    pub fn resolved(value: T) -> Self {
        Promise {
            shared: Shared::new(Some(Outcome::Fulfilled(Arc::new(value)))),
        }
    }

    /// Create a promise that is already rejected.
    pub fn rejected(reason: impl Into<anyhow::Error>) -> Self {
        Promise {
            shared: Shared::new(Some(Outcome::Rejected(Arc::new(reason.into())))),
        }
    }

    /// Attach an abort hook.
    ///
    /// The engine never calls it; superseded handles are left to settle. The
    /// hook is for the producer's own callers via [`Promise::abort`].
    pub fn with_abort(self, hook: impl FnOnce() + Send + 'static) -> Self {
        {
            let mut state = self.shared.state.lock();
            if state.outcome.is_none() {
                state.abort = Some(Box::new(hook));
            }
        }
        self
    }

    /// Invoke the abort hook if the promise is still pending.
    ///
    /// Returns `true` if a hook ran. Aborting does not settle the promise.
    pub fn abort(&self) -> bool {
        let hook = self.shared.state.lock().abort.take();
        match hook {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }

    /// The identity of this handle.
    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    /// Returns `true` if both promises are the same handle.
    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Returns `true` once the promise is fulfilled or rejected.
    pub fn is_settled(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// The settled outcome, if any.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.state.lock().outcome.clone()
    }

    /// Returns `true` if the engine has already classified this handle.
    pub fn is_tagged(&self) -> bool {
        self.shared.state.lock().tagged
    }

    /// Mark the handle as classified. Returns `true` if it was untagged.
    pub(crate) fn mark_tagged(&self) -> bool {
        let mut state = self.shared.state.lock();
        !std::mem::replace(&mut state.tagged, true)
    }

    /// Snapshot of the handle as a tagged result.
    ///
    /// A settled handle always yields the same value or reason, with the
    /// handle's own id.
    pub fn tag(&self) -> AsyncResult<T> {
        match self.outcome() {
            None => AsyncResult::Pending(self.clone()),
            Some(outcome) => AsyncResult::from_outcome(self.id(), outcome),
        }
    }

    /// Run `f` once the promise settles.
    ///
    /// If the promise has already settled, `f` runs immediately on the calling
    /// thread.
    pub fn then(&self, f: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let settled = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    state.continuations.push(Box::new(f));
                    return;
                }
            }
        };
        if let Some(outcome) = settled {
            f(&outcome);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        let status = match &state.outcome {
            None => "pending",
            Some(Outcome::Fulfilled(_)) => "fulfilled",
            Some(Outcome::Rejected(_)) => "rejected",
        };
        write!(f, "Promise({}, {})", self.shared.id, status)
    }
}

impl<T: Send + Sync + 'static> Resolver<T> {
    /// The identity of the promise this resolver settles.
    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    /// Fulfill the promise. Returns `false` if it had already settled.
    pub fn resolve(self, value: T) -> bool {
        self.shared.settle(Outcome::Fulfilled(Arc::new(value)))
    }

    /// Reject the promise. Returns `false` if it had already settled.
    pub fn reject(self, reason: impl Into<anyhow::Error>) -> bool {
        self.shared.settle(Outcome::Rejected(Arc::new(reason.into())))
    }
}

/// Type-erased view of a pending handle, carried by
/// [`QueryError::Suspend`](crate::QueryError::Suspend) so the host can retry
/// once the handle settles.
#[derive(Clone)]
pub struct SuspendHandle {
    inner: Arc<dyn Suspender>,
}

trait Suspender: Send + Sync {
    fn id(&self) -> HandleId;
    fn is_settled(&self) -> bool;
    fn on_settled(&self, f: Box<dyn FnOnce() + Send>);
}

impl<T: Send + Sync + 'static> Suspender for Promise<T> {
    fn id(&self) -> HandleId {
        Promise::id(self)
    }

    fn is_settled(&self) -> bool {
        Promise::is_settled(self)
    }

    fn on_settled(&self, f: Box<dyn FnOnce() + Send>) {
        self.then(move |_| f());
    }
}

impl SuspendHandle {
    pub(crate) fn new<T: Send + Sync + 'static>(promise: Promise<T>) -> Self {
        Self {
            inner: Arc::new(promise),
        }
    }

    /// The identity of the handle the read suspended on.
    pub fn id(&self) -> HandleId {
        self.inner.id()
    }

    /// Returns `true` once the handle has settled and a retry can succeed.
    pub fn is_settled(&self) -> bool {
        self.inner.is_settled()
    }

    /// Run `f` once the handle settles (immediately if it already has).
    pub fn on_settled(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.on_settled(Box::new(f));
    }
}

impl fmt::Debug for SuspendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendHandle")
            .field("id", &self.id())
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl fmt::Display for SuspendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle {}", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_settlement_is_terminal() {
        let (promise, resolver) = Promise::<i32>::new();
        assert!(!promise.is_settled());
        assert!(resolver.resolve(1));
        assert!(promise.is_settled());

        let first = promise.tag();
        let second = promise.tag();
        assert_eq!(first.id(), promise.id());
        assert_eq!(first.value().map(|v| **v), Some(1));
        assert_eq!(second.value().map(|v| **v), Some(1));
    }

    #[test]
    fn test_continuations_run_once_on_settle() {
        let (promise, resolver) = Promise::<&'static str>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            promise.then(move |outcome| {
                assert!(matches!(outcome, Outcome::Rejected(_)));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        resolver.reject(anyhow::anyhow!("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_then_after_settle_runs_immediately() {
        let promise = Promise::resolved(5u8);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        promise.then(move |outcome| {
            if let Outcome::Fulfilled(v) = outcome {
                seen_clone.store(**v as usize, Ordering::SeqCst);
            }
        });
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_mark_tagged_only_once() {
        let (promise, _resolver) = Promise::<()>::new();
        assert!(!promise.is_tagged());
        assert!(promise.mark_tagged());
        assert!(!promise.mark_tagged());
        assert!(promise.clone().is_tagged());
    }

    #[test]
    fn test_abort_hook_only_while_pending() {
        let aborted = Arc::new(AtomicUsize::new(0));
        let counter = aborted.clone();
        let (promise, resolver) = Promise::<u32>::new();
        let promise = promise.with_abort(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(promise.abort());
        assert!(!promise.abort());
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        // Aborting does not settle.
        assert!(!promise.is_settled());
        assert!(resolver.resolve(3));
    }

    #[test]
    fn test_suspend_handle_notifies_on_settle() {
        let (promise, resolver) = Promise::<u32>::new();
        let handle = SuspendHandle::new(promise.clone());
        let woke = Arc::new(AtomicUsize::new(0));
        let woke_clone = woke.clone();
        handle.on_settled(move || {
            woke_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!handle.is_settled());
        assert_eq!(handle.id(), promise.id());
        resolver.resolve(9);
        assert!(handle.is_settled());
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }
}
