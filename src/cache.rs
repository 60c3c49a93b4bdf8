//! The fiber cache: one fiber per query key.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use papaya::HashMap;

use crate::config::FiberConfig;
use crate::error::QueryError;
use crate::fiber::{AnyFiber, Fiber, Source};
use crate::key::QueryKey;
use crate::query::{Query, QueryArgs};
use crate::scheduler::{ExecutionContext, Scheduler, TaskQueue};
use crate::tracer::{EvictionReason, NoopTracer, Tracer};

pub(crate) struct CacheShared {
    fibers: HashMap<QueryKey, Arc<dyn AnyFiber>, ahash::RandomState>,
    scheduler: Arc<dyn Scheduler>,
    tracer: Arc<dyn Tracer>,
}

impl CacheShared {
    pub(crate) fn lookup(&self, key: &QueryKey) -> Option<Arc<dyn AnyFiber>> {
        self.fibers.pin().get(key).cloned()
    }
}

/// A cache of fibers keyed by [`QueryKey`].
///
/// Fibers are created on first use and live as long as the cache; eviction
/// clears their results but keeps the fiber, its config and subscriptions.
///
/// Cheap to clone; clones share the same fibers.
#[derive(Clone)]
pub struct FiberCache {
    shared: Arc<CacheShared>,
}

static GLOBAL_TASKS: OnceLock<Arc<TaskQueue>> = OnceLock::new();
static GLOBAL_CACHE: OnceLock<FiberCache> = OnceLock::new();

thread_local! {
    static PROVIDED: RefCell<Vec<FiberCache>> = const { RefCell::new(Vec::new()) };
}

impl FiberCache {
    /// Create a cache that defers render-phase flushes to `scheduler`.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::builder(scheduler).build()
    }

    /// Create a builder for customizing the cache.
    pub fn builder(scheduler: Arc<dyn Scheduler>) -> FiberCacheBuilder {
        FiberCacheBuilder::new(scheduler)
    }

    /// The process-wide default cache.
    ///
    /// Its scheduler is [`FiberCache::global_tasks`]; the host drains it on
    /// every tick.
    pub fn global() -> FiberCache {
        GLOBAL_CACHE
            .get_or_init(|| FiberCache::new(Self::global_tasks()))
            .clone()
    }

    /// The task queue backing [`FiberCache::global`].
    pub fn global_tasks() -> Arc<TaskQueue> {
        GLOBAL_TASKS
            .get_or_init(|| Arc::new(TaskQueue::new()))
            .clone()
    }

    /// The innermost cache provided on this thread, or the global cache.
    pub fn current() -> FiberCache {
        PROVIDED
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(Self::global)
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.shared.scheduler
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.shared.tracer
    }

    /// Returns `true` if both handles refer to the same cache.
    pub fn ptr_eq(&self, other: &FiberCache) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Get the fiber for `key`, creating it from `source` and `config` if
    /// absent.
    ///
    /// For an existing fiber, `config` is merged into its config and `source`
    /// is not called. Fails with [`QueryError::TypeMismatch`] if the key is
    /// registered with different value or argument types.
    pub fn get_or_create<T, A>(
        &self,
        key: QueryKey,
        source: impl FnOnce() -> Source<T, A>,
        config: Option<&FiberConfig<T>>,
    ) -> Result<Arc<Fiber<T, A>>, QueryError>
    where
        T: Send + Sync + 'static,
        A: QueryArgs,
    {
        let pinned = self.shared.fibers.pin();
        let (stored, created) = match pinned.get(&key) {
            Some(existing) => (existing.clone(), false),
            None => {
                let fiber: Arc<dyn AnyFiber> = Arc::new(Fiber::new(
                    key.clone(),
                    source(),
                    config.cloned().unwrap_or_default(),
                    Arc::downgrade(&self.shared),
                    self.shared.scheduler.clone(),
                    self.shared.tracer.clone(),
                ));
                let stored = pinned.get_or_insert(key.clone(), fiber.clone()).clone();
                let created = Arc::ptr_eq(&stored, &fiber);
                (stored, created)
            }
        };
        drop(pinned);

        let fiber = downcast_fiber::<T, A>(&key, stored)?;
        if created {
            self.shared.tracer.on_fiber_created(&key);
        } else if let Some(config) = config {
            fiber.merge_config(config);
        }
        Ok(fiber)
    }

    /// Get or create the fiber of `query`.
    pub fn fiber<Q: Query>(&self, query: &Q) -> Result<Arc<Fiber<Q::Output, Q::Args>>, QueryError> {
        self.get_or_create(query.key(), || query.source(), None)
    }

    /// Get an existing fiber without creating it.
    pub fn get<T, A>(&self, key: &QueryKey) -> Result<Option<Arc<Fiber<T, A>>>, QueryError>
    where
        T: Send + Sync + 'static,
        A: QueryArgs,
    {
        match self.shared.lookup(key) {
            Some(stored) => downcast_fiber(key, stored).map(Some),
            None => Ok(None),
        }
    }

    /// Returns `true` if a fiber exists for `key`.
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.shared.fibers.pin().contains_key(key)
    }

    /// Evict all results of the fiber for `key` and notify its subscribers.
    ///
    /// Returns `false` if no such fiber exists; a miss is not an error.
    pub fn evict(&self, key: &QueryKey) -> bool {
        match self.shared.lookup(key) {
            Some(fiber) => {
                fiber.invalidate(&ExecutionContext::event(), EvictionReason::Manual);
                true
            }
            None => false,
        }
    }

    /// Evict the results of `key` produced for `args`.
    pub fn evict_args<T, A>(&self, key: &QueryKey, args: &A) -> Result<bool, QueryError>
    where
        T: Send + Sync + 'static,
        A: QueryArgs,
    {
        match self.get::<T, A>(key)? {
            Some(fiber) => {
                fiber.evict(&ExecutionContext::event(), Some(args));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Keys of all fibers in the cache.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.shared.fibers.pin().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every fiber.
    ///
    /// Unlike eviction, this forgets configs and subscriptions.
    pub fn clear(&self) {
        self.shared.fibers.pin().clear();
    }

    pub(crate) fn lookup(&self, key: &QueryKey) -> Option<Arc<dyn AnyFiber>> {
        self.shared.lookup(key)
    }
}

fn downcast_fiber<T, A>(key: &QueryKey, stored: Arc<dyn AnyFiber>) -> Result<Arc<Fiber<T, A>>, QueryError>
where
    T: Send + Sync + 'static,
    A: QueryArgs,
{
    let registered = stored.type_name();
    stored
        .as_any()
        .downcast::<Fiber<T, A>>()
        .map_err(|_| QueryError::TypeMismatch {
            query: key.debug_repr(),
            registered,
            requested: std::any::type_name::<Fiber<T, A>>(),
        })
}

impl std::fmt::Debug for FiberCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberCache")
            .field("fibers", &self.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`FiberCache`] with customizable settings.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use suspense_query::{FiberCache, LogTracer, TaskQueue};
///
/// let cache = FiberCache::builder(Arc::new(TaskQueue::new()))
///     .tracer(LogTracer)
///     .build();
/// assert!(cache.is_empty());
/// ```
pub struct FiberCacheBuilder {
    scheduler: Arc<dyn Scheduler>,
    tracer: Arc<dyn Tracer>,
}

impl FiberCacheBuilder {
    /// Create a new builder with the default tracer.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Set the tracer for observing fiber activity.
    pub fn tracer<Tr: Tracer>(mut self, tracer: Tr) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Set a shared tracer, e.g. one the caller keeps a handle to.
    pub fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the cache with the configured settings.
    pub fn build(self) -> FiberCache {
        FiberCache {
            shared: Arc::new(CacheShared {
                fibers: HashMap::with_hasher(ahash::RandomState::new()),
                scheduler: self.scheduler,
                tracer: self.tracer,
            }),
        }
    }
}

/// Scopes a [`FiberCache`] as [`FiberCache::current`] on this thread.
pub struct Provider;

impl Provider {
    /// Provide `cache` until the returned guard is dropped.
    ///
    /// Guards nest; dropping one restores the previously provided cache.
    pub fn enter(cache: &FiberCache) -> ProviderGuard {
        PROVIDED.with(|stack| stack.borrow_mut().push(cache.clone()));
        ProviderGuard {
            _not_send: PhantomData,
        }
    }
}

/// Restores the previously provided cache when dropped.
#[must_use = "the cache is only provided while the guard is alive"]
pub struct ProviderGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for ProviderGuard {
    fn drop(&mut self) {
        PROVIDED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_result::Produced;

    fn cache() -> FiberCache {
        FiberCache::new(Arc::new(TaskQueue::new()))
    }

    #[test]
    fn test_get_or_create_returns_same_fiber() {
        let cache = cache();
        let key = QueryKey::named("count");
        let first = cache
            .get_or_create(key.clone(), Source::<u32, u32>::manual, None)
            .unwrap();
        let second = cache
            .get_or_create(key.clone(), || -> Source<u32, u32> { panic!("not called") }, None)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_initial_value_seeds_current() {
        let cache = cache();
        let config = FiberConfig::new().initial_value(5u32);
        let fiber = cache
            .get_or_create(QueryKey::named("count"), Source::<u32, u32>::manual, Some(&config))
            .unwrap();
        let current = fiber.current().unwrap();
        assert_eq!(current.value().map(|v| **v), Some(5));
    }

    #[test]
    fn test_config_merges_into_existing_fiber() {
        let cache = cache();
        let key = QueryKey::named("users");
        let source = || Source::producer(|id: u32| Produced::Value(id * 2));
        cache
            .get_or_create(key.clone(), source, Some(&FiberConfig::new().name("users")))
            .unwrap();
        let fiber = cache
            .get_or_create(key, source, Some(&FiberConfig::new().enable_cache(true)))
            .unwrap();
        let config = fiber.config();
        assert_eq!(config.name.as_deref(), Some("users"));
        assert!(config.cache_enabled());
    }

    #[test]
    fn test_type_mismatch() {
        let cache = cache();
        let key = QueryKey::named("count");
        cache
            .get_or_create(key.clone(), Source::<u32, u32>::manual, None)
            .unwrap();
        let err = cache
            .get_or_create(key, Source::<String, String>::manual, None)
            .unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch { .. }));
    }

    #[test]
    fn test_evict_miss_is_not_an_error() {
        let cache = cache();
        assert!(!cache.evict(&QueryKey::named("missing")));
        assert!(cache.get::<u32, u32>(&QueryKey::named("missing")).unwrap().is_none());
    }

    #[test]
    fn test_provider_nesting() {
        let outer = cache();
        let inner = cache();
        assert!(FiberCache::current().ptr_eq(&FiberCache::global()));
        {
            let _outer = Provider::enter(&outer);
            assert!(FiberCache::current().ptr_eq(&outer));
            {
                let _inner = Provider::enter(&inner);
                assert!(FiberCache::current().ptr_eq(&inner));
            }
            assert!(FiberCache::current().ptr_eq(&outer));
        }
        assert!(FiberCache::current().ptr_eq(&FiberCache::global()));
    }
}
