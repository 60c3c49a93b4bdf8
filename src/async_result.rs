//! Tri-state results and producer output classification.

use std::fmt;
use std::sync::Arc;

use crate::promise::{HandleId, Outcome, Promise, SuspendHandle};
use crate::QueryError;

/// Coarse state of an [`AsyncResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

/// A tagged query result.
///
/// Fulfilled and rejected results keep the id of the handle they settled
/// from; a synchronous value gets a fresh id of its own. Cloning is cheap.
pub enum AsyncResult<T> {
    /// The handle has not settled yet.
    Pending(Promise<T>),
    /// The handle resolved with `value`.
    Fulfilled { id: HandleId, value: Arc<T> },
    /// The handle was rejected with `reason`.
    Rejected {
        id: HandleId,
        reason: Arc<anyhow::Error>,
    },
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        match self {
            AsyncResult::Pending(promise) => AsyncResult::Pending(promise.clone()),
            AsyncResult::Fulfilled { id, value } => AsyncResult::Fulfilled {
                id: *id,
                value: value.clone(),
            },
            AsyncResult::Rejected { id, reason } => AsyncResult::Rejected {
                id: *id,
                reason: reason.clone(),
            },
        }
    }
}

impl<T: Send + Sync + 'static> AsyncResult<T> {
    /// A fulfilled result with a fresh id.
    pub fn fulfilled(value: T) -> Self {
        AsyncResult::Fulfilled {
            id: HandleId::next(),
            value: Arc::new(value),
        }
    }

    /// A rejected result with a fresh id.
    pub fn rejected(reason: impl Into<anyhow::Error>) -> Self {
        AsyncResult::Rejected {
            id: HandleId::next(),
            reason: Arc::new(reason.into()),
        }
    }

    pub(crate) fn from_outcome(id: HandleId, outcome: Outcome<T>) -> Self {
        match outcome {
            Outcome::Fulfilled(value) => AsyncResult::Fulfilled { id, value },
            Outcome::Rejected(reason) => AsyncResult::Rejected { id, reason },
        }
    }

    /// The id of the handle this result belongs to.
    pub fn id(&self) -> HandleId {
        match self {
            AsyncResult::Pending(promise) => promise.id(),
            AsyncResult::Fulfilled { id, .. } | AsyncResult::Rejected { id, .. } => *id,
        }
    }

    /// The stored state, without looking at the live handle.
    pub fn status(&self) -> Status {
        match self {
            AsyncResult::Pending(_) => Status::Pending,
            AsyncResult::Fulfilled { .. } => Status::Fulfilled,
            AsyncResult::Rejected { .. } => Status::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AsyncResult::Pending(_))
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, AsyncResult::Fulfilled { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, AsyncResult::Rejected { .. })
    }

    /// Get the value if fulfilled.
    pub fn value(&self) -> Option<&Arc<T>> {
        match self {
            AsyncResult::Fulfilled { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Get the rejection reason if rejected.
    pub fn reason(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            AsyncResult::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Re-read a pending result from its live handle.
    ///
    /// Settled results are returned unchanged.
    pub fn refresh(&self) -> Self {
        match self {
            AsyncResult::Pending(promise) => promise.tag(),
            settled => settled.clone(),
        }
    }

    /// Read the result, consulting the live handle when pending.
    ///
    /// Pending becomes [`QueryError::Suspend`] and rejection becomes
    /// [`QueryError::Rejected`]. Use with `?` to propagate suspension upward.
    pub fn read(&self) -> Result<Arc<T>, QueryError> {
        match self.refresh() {
            AsyncResult::Pending(promise) => Err(QueryError::Suspend {
                handle: SuspendHandle::new(promise),
            }),
            AsyncResult::Fulfilled { value, .. } => Ok(value),
            AsyncResult::Rejected { reason, .. } => Err(QueryError::Rejected(reason)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncResult::Pending(promise) => write!(f, "AsyncResult::Pending({promise:?})"),
            AsyncResult::Fulfilled { id, value } => {
                write!(f, "AsyncResult::Fulfilled({id}, {value:?})")
            }
            AsyncResult::Rejected { id, reason } => {
                write!(f, "AsyncResult::Rejected({id}, {reason})")
            }
        }
    }
}

/// What a producer hands back.
pub enum Produced<T> {
    /// A synchronous value.
    Value(T),
    /// A raw asynchronous handle.
    Handle(Promise<T>),
    /// A result that was already tagged, typically one this engine returned.
    Result(AsyncResult<T>),
}

impl<T> Produced<T> {
    /// Wrap a fallible synchronous computation.
    pub fn from_result<E>(result: Result<T, E>) -> Self
    where
        T: Send + Sync + 'static,
        E: Into<anyhow::Error>,
    {
        match result {
            Ok(value) => Produced::Value(value),
            Err(err) => Produced::Result(AsyncResult::rejected(err)),
        }
    }
}

impl<T> From<Promise<T>> for Produced<T> {
    fn from(promise: Promise<T>) -> Self {
        Produced::Handle(promise)
    }
}

impl<T> From<AsyncResult<T>> for Produced<T> {
    fn from(result: AsyncResult<T>) -> Self {
        Produced::Result(result)
    }
}

/// A producer output after classification.
pub enum Classified<T> {
    /// Settled at classification time: a synchronous value, or a handle that
    /// had already settled when first seen.
    Ready(AsyncResult<T>),
    /// An already tagged handle or result, reused without a new continuation.
    Reused(AsyncResult<T>),
    /// An untagged handle, tagged now and still pending. The caller owns
    /// observing its settlement.
    Fresh(Promise<T>),
}

/// Classify a producer's output into a tagged result.
pub fn classify<T: Send + Sync + 'static>(produced: Produced<T>) -> Classified<T> {
    match produced {
        Produced::Value(value) => Classified::Ready(AsyncResult::fulfilled(value)),
        Produced::Result(result) => Classified::Reused(result.refresh()),
        Produced::Handle(promise) => {
            if !promise.mark_tagged() {
                return Classified::Reused(promise.tag());
            }
            match promise.tag() {
                AsyncResult::Pending(promise) => Classified::Fresh(promise),
                settled => Classified::Ready(settled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_value() {
        let classified = classify(Produced::Value(3));
        let Classified::Ready(result) = classified else {
            panic!("expected a ready result");
        };
        assert_eq!(result.value().map(|v| **v), Some(3));
    }

    #[test]
    fn test_classify_handle_once() {
        let (promise, resolver) = Promise::<u8>::new();
        assert!(matches!(
            classify(Produced::Handle(promise.clone())),
            Classified::Fresh(_)
        ));
        // The same handle again is reused, not re-watched.
        assert!(matches!(
            classify(Produced::Handle(promise.clone())),
            Classified::Reused(AsyncResult::Pending(_))
        ));
        resolver.resolve(1);
        let Classified::Reused(result) = classify(Produced::Handle(promise.clone())) else {
            panic!("expected reuse");
        };
        assert!(result.is_fulfilled());
        assert_eq!(result.id(), promise.id());
    }

    #[test]
    fn test_classify_settled_handle_is_ready() {
        let promise = Promise::<u8>::rejected(anyhow::anyhow!("nope"));
        let Classified::Ready(result) = classify(Produced::Handle(promise.clone())) else {
            panic!("expected ready");
        };
        assert!(result.is_rejected());
        assert_eq!(result.id(), promise.id());
    }

    #[test]
    fn test_read_pending_suspends() {
        let (promise, resolver) = Promise::<u8>::new();
        let result = AsyncResult::Pending(promise.clone());
        let err = result.read().unwrap_err();
        assert!(err.is_suspend());
        resolver.resolve(4);
        // Live handle settled; the stored tag is still pending but reads succeed.
        assert!(result.is_pending());
        assert_eq!(*result.read().unwrap(), 4);
    }

    #[test]
    fn test_read_rejected() {
        let result = AsyncResult::<u8>::rejected(std::io::Error::other("disk"));
        let err = result.read().unwrap_err();
        assert!(err.is::<std::io::Error>());
    }

    #[test]
    fn test_from_result() {
        let ok = classify(Produced::from_result::<anyhow::Error>(Ok(1u8)));
        assert!(matches!(ok, Classified::Ready(result) if result.is_fulfilled()));
        let err = classify(Produced::<u8>::from_result(Err(anyhow::anyhow!("bad"))));
        assert!(matches!(err, Classified::Reused(result) if result.is_rejected()));
    }
}
