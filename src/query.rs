//! Query trait definition and the two stock query kinds.

use std::any::Any;
use std::borrow::Cow;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::async_result::Produced;
use crate::fiber::{Producer, Source};
use crate::key::QueryKey;

/// Bounds every argument type satisfies.
///
/// Arguments are compared by equality to decide whether a pass re-runs the
/// producer, and kept per fiber as the last arguments.
pub trait QueryArgs: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Debug + Send + Sync + 'static> QueryArgs for T {}

/// Something that can be observed through a [`Pass`](crate::Pass).
///
/// A query names its fiber (the key) and describes how the fiber is first
/// built (the source). The source is only consulted when the fiber is
/// created; later calls with the same key reuse the stored fiber.
///
/// # Example
///
/// ```
/// use suspense_query::{Produced, Query, QueryKey, Source};
///
/// struct Square;
///
/// impl Query for Square {
///     type Args = u32;
///     type Output = u32;
///
///     fn key(&self) -> QueryKey {
///         QueryKey::new("square")
///     }
///
///     fn source(&self) -> Source<u32, u32> {
///         Source::producer(|n: u32| Produced::Value(n * n))
///     }
/// }
/// ```
pub trait Query: Send + Sync + 'static {
    /// The argument tuple passed to the producer.
    type Args: QueryArgs;

    /// The value a run resolves to.
    type Output: Send + Sync + 'static;

    /// The identity of the fiber.
    fn key(&self) -> QueryKey;

    /// How the fiber produces results.
    fn source(&self) -> Source<Self::Output, Self::Args>;

    /// Arguments used to mount the fiber when a pass supplies none.
    fn default_args(&self) -> Option<Self::Args> {
        None
    }
}

/// A query backed by a producer function.
///
/// Keyed by the function's own type: every fn item and closure is a distinct
/// type, so two `QueryFn`s built from the same function share a fiber.
pub struct QueryFn<T, A> {
    key: QueryKey,
    producer: Producer<T, A>,
    default_args: Option<A>,
}

impl<T, A> QueryFn<T, A>
where
    T: Send + Sync + 'static,
    A: QueryArgs,
{
    /// Wrap a producer that may return a value, a handle or a tagged result.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(A) -> Produced<T> + Send + Sync + 'static,
    {
        Self {
            key: QueryKey::of_type::<F>(),
            producer: Arc::new(f),
            default_args: unit_args(),
        }
    }

    /// Wrap a synchronous producer.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(A) -> T + Send + Sync + 'static,
    {
        Self {
            key: QueryKey::of_type::<F>(),
            producer: Arc::new(move |args| Produced::Value(f(args))),
            default_args: unit_args(),
        }
    }

    /// Wrap a producer under an explicit name instead of its type.
    pub fn named<F>(name: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(A) -> Produced<T> + Send + Sync + 'static,
    {
        Self {
            key: QueryKey::named(name),
            producer: Arc::new(f),
            default_args: unit_args(),
        }
    }

    /// Arguments to mount with when a pass supplies none.
    pub fn with_default_args(mut self, args: A) -> Self {
        self.default_args = Some(args);
        self
    }
}

/// `Some(())` when the argument type is `()`, so argument-less producers
/// mount without options.
fn unit_args<A: QueryArgs>() -> Option<A> {
    (&() as &dyn Any).downcast_ref::<A>().cloned()
}

impl<T, A> Clone for QueryFn<T, A>
where
    A: Clone,
{
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            producer: self.producer.clone(),
            default_args: self.default_args.clone(),
        }
    }
}

impl<T, A> Query for QueryFn<T, A>
where
    T: Send + Sync + 'static,
    A: QueryArgs,
{
    type Args = A;
    type Output = T;

    fn key(&self) -> QueryKey {
        self.key.clone()
    }

    fn source(&self) -> Source<T, A> {
        Source::Producer(self.producer.clone())
    }

    fn default_args(&self) -> Option<A> {
        self.default_args.clone()
    }
}

impl<T, A: Debug> Debug for QueryFn<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFn")
            .field("key", &self.key)
            .field("default_args", &self.default_args)
            .finish()
    }
}

/// A producer-less query whose value is only ever set explicitly.
pub struct Manual<T> {
    key: QueryKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Manual<T> {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self::keyed(QueryKey::named(name))
    }

    pub fn keyed(key: QueryKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Manual<T> {
    fn clone(&self) -> Self {
        Self::keyed(self.key.clone())
    }
}

impl<T> Debug for Manual<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Manual").field(&self.key).finish()
    }
}

impl<T: QueryArgs> Query for Manual<T> {
    type Args = T;
    type Output = T;

    fn key(&self) -> QueryKey {
        self.key.clone()
    }

    fn source(&self) -> Source<T, T> {
        Source::manual()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(n: u32) -> u32 {
        n * 2
    }

    fn triple(n: u32) -> u32 {
        n * 3
    }

    #[test]
    fn test_query_fn_keyed_by_function() {
        assert_eq!(QueryFn::sync(double).key(), QueryFn::sync(double).key());
        assert_ne!(QueryFn::sync(double).key(), QueryFn::sync(triple).key());
    }

    #[test]
    fn test_unit_args_default() {
        let no_args = QueryFn::sync(|(): ()| 1u8);
        assert_eq!(no_args.default_args(), Some(()));
        assert_eq!(QueryFn::sync(double).default_args(), None);
        assert_eq!(
            QueryFn::sync(double).with_default_args(4).default_args(),
            Some(4)
        );
    }

    #[test]
    fn test_manual_source() {
        let count = Manual::<u32>::new("count");
        assert!(count.source().is_manual());
        assert_eq!(count.key(), QueryKey::named("count"));
        assert!(count.default_args().is_none());
    }
}
