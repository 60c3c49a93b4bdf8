//! Error types for query reads.

use std::sync::Arc;

use crate::promise::SuspendHandle;

/// Errors returned from reading a query inside a pass.
///
/// Suspension is an error value, not a failure: it tells the host to retry the
/// pass once `handle` settles. Rejections carry the producer's error, shared
/// so every reader of the same result observes the same reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The query has no settled value yet.
    ///
    /// Abandon the pass and retry it after `handle` settles.
    #[error("query suspended: waiting for {handle}")]
    Suspend {
        /// The pending handle that caused the suspension.
        handle: SuspendHandle,
    },

    /// The query's current result is a rejection.
    #[error("query rejected: {0}")]
    Rejected(Arc<anyhow::Error>),

    /// The fiber has neither a current result nor a pending handle.
    ///
    /// Typically raised for a manual query observed before any value was set
    /// and without an initial value.
    #[error("query {query} has no initial value")]
    NoInitialValue {
        /// Name of the query.
        query: String,
    },

    /// A producer query was mounted without arguments and has no default.
    #[error("query {query} was mounted without arguments")]
    MissingArgs {
        /// Name of the query.
        query: String,
    },

    /// The query has never been registered in this cache.
    #[error("query {query} is not registered")]
    NotFound {
        /// Name of the query.
        query: String,
    },

    /// The key is registered with different value or argument types.
    #[error("query {query} is registered as `{registered}`, not `{requested}`")]
    TypeMismatch {
        /// Name of the query.
        query: String,
        /// Fiber type already stored under the key.
        registered: &'static str,
        /// Fiber type the caller asked for.
        requested: &'static str,
    },
}

impl QueryError {
    /// Returns the rejection reason if this is a `Rejected` variant.
    pub fn rejection(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryError::Rejected(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the pending handle if this is a `Suspend` variant.
    pub fn suspend_handle(&self) -> Option<&SuspendHandle> {
        match self {
            QueryError::Suspend { handle } => Some(handle),
            _ => None,
        }
    }

    /// Returns `true` if the read suspended.
    pub fn is_suspend(&self) -> bool {
        matches!(self, QueryError::Suspend { .. })
    }

    /// Attempts to downcast the rejection reason to a specific type.
    ///
    /// Returns `Some(&E)` if this is a `Rejected` containing an error of type `E`,
    /// otherwise returns `None`.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.rejection().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `Rejected` containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("not found: {0}")]
    struct NotFound(u32);

    #[test]
    fn test_downcast_rejection() {
        let err = QueryError::Rejected(Arc::new(anyhow::Error::new(NotFound(4))));
        assert!(err.is::<NotFound>());
        assert_eq!(err.downcast_ref::<NotFound>().map(|e| e.0), Some(4));
        assert!(!err.is::<std::io::Error>());
        assert_eq!(err.to_string(), "query rejected: not found: 4");
    }

    #[test]
    fn test_system_errors_have_no_rejection() {
        let err = QueryError::NoInitialValue {
            query: "count".into(),
        };
        assert!(err.rejection().is_none());
        assert!(!err.is_suspend());
        assert_eq!(err.to_string(), "query count has no initial value");
    }
}
