//! The consumer-facing surface: passes, controls and mutators.
//!
//! A host renders a consumer by opening a [`Pass`], reading queries through
//! it, and then either committing it (the output was used) or dropping it
//! (the pass was speculative and discarded). Reads never register anything
//! until the commit, except reads that suspend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::FiberCache;
use crate::config::ObserveOptions;
use crate::error::QueryError;
use crate::fiber::Fiber;
use crate::key::QueryKey;
use crate::query::{Query, QueryArgs};
use crate::scheduler::ExecutionContext;
use crate::subscription::{Consumer, Subscription, Urgency};

static WARNED_ARGS_CONFLICT: AtomicBool = AtomicBool::new(false);

/// One speculative render of a consumer.
///
/// Dropping a pass without calling [`Pass::commit`] abandons it: none of its
/// subscription records are registered.
pub struct Pass {
    cache: FiberCache,
    consumer: Consumer,
    records: Vec<Arc<Subscription>>,
}

impl FiberCache {
    /// Open a pass for `consumer` against this cache.
    pub fn pass(&self, consumer: &Consumer) -> Pass {
        Pass::new(self, consumer)
    }
}

impl Pass {
    pub fn new(cache: &FiberCache, consumer: &Consumer) -> Self {
        Self {
            cache: cache.clone(),
            consumer: consumer.clone(),
            records: Vec::new(),
        }
    }

    /// Open a pass against [`FiberCache::current`].
    pub fn current(consumer: &Consumer) -> Self {
        Self::new(&FiberCache::current(), consumer)
    }

    pub fn cache(&self) -> &FiberCache {
        &self.cache
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Records created so far, in read order.
    pub fn records(&self) -> &[Arc<Subscription>] {
        &self.records
    }

    fn render_ctx(&self) -> ExecutionContext {
        ExecutionContext::render().with_transition(self.consumer.transition().cloned())
    }

    fn event_ctx(&self) -> ExecutionContext {
        ExecutionContext::event().with_transition(self.consumer.transition().cloned())
    }

    /// Read a query, running its producer as needed.
    ///
    /// Mounts the fiber with `args`, else `initial_args`, else the query's
    /// default arguments if it has no data yet; re-runs it if `args` differ
    /// from the last run's. Returns the value, or
    /// [`QueryError::Suspend`] while the result is pending, or
    /// [`QueryError::Rejected`] if the producer failed.
    pub fn observe<Q: Query>(
        &mut self,
        query: &Q,
        options: ObserveOptions<Q::Output, Q::Args>,
    ) -> Result<Arc<Q::Output>, QueryError> {
        let fiber = self
            .cache
            .get_or_create(query.key(), || query.source(), Some(&options.config))?;
        if args_conflict(fiber.has_data(), &options) {
            warn_on_args_conflict(&fiber);
        }
        self.render_fiber(&fiber, query, &options)?;

        let record = fiber.subscribe(
            self.consumer.clone(),
            options.urgency.unwrap_or(Urgency::Urgent),
        );
        self.records.push(record.clone());
        fiber.read(&record)
    }

    fn render_fiber<Q: Query>(
        &self,
        fiber: &Arc<Fiber<Q::Output, Q::Args>>,
        query: &Q,
        options: &ObserveOptions<Q::Output, Q::Args>,
    ) -> Result<(), QueryError> {
        if !fiber.has_data() {
            if fiber.is_manual() {
                fiber.seed_initial_value();
                return Ok(());
            }
            let args = options
                .args
                .clone()
                .or_else(|| options.initial_args.clone())
                .or_else(|| query.default_args())
                .ok_or_else(|| QueryError::MissingArgs {
                    query: fiber.name(),
                })?;
            fiber.run(&self.render_ctx(), args);
        } else if let Some(args) = &options.args {
            if !fiber.is_manual() && fiber.effective_args().as_ref() != Some(args) {
                fiber.run(&self.render_ctx(), args.clone());
            }
        }
        Ok(())
    }

    /// The rejection reason of a query's current result, without suspending.
    ///
    /// Does not run the producer or subscribe.
    pub fn error<Q: Query>(&self, query: &Q) -> Result<Option<Arc<anyhow::Error>>, QueryError> {
        Ok(self.cache.fiber(query)?.error())
    }

    /// Imperative controls for a query, subscribed in the deferred class.
    pub fn control<Q: Query>(&mut self, query: &Q) -> Result<Controls<Q::Output, Q::Args>, QueryError> {
        let fiber = self.cache.fiber(query)?;
        let record = fiber.subscribe(self.consumer.clone(), Urgency::Deferred);
        self.records.push(record);
        Ok(Controls {
            is_pending: fiber.is_pending(),
            ctx: self.event_ctx(),
            fiber,
        })
    }

    /// A mutation handle whose fulfilled runs evict `dependents`.
    ///
    /// Subscribed in the urgent class.
    pub fn mutate<Q: Query>(
        &mut self,
        query: &Q,
        dependents: impl IntoIterator<Item = QueryKey>,
    ) -> Result<Mutator<Q::Output, Q::Args>, QueryError> {
        let fiber = self.cache.fiber(query)?;
        let record = fiber.subscribe(self.consumer.clone(), Urgency::Urgent);
        self.records.push(record);
        Ok(Mutator {
            ctx: ExecutionContext::event().with_dependents(dependents),
            fiber,
        })
    }

    /// Evict a query's results, all of them or those for `args`.
    pub fn evict<Q: Query>(&self, query: &Q, args: Option<&Q::Args>) -> Result<(), QueryError> {
        self.cache.fiber(query)?.evict(&self.event_ctx(), args);
        Ok(())
    }

    /// Run an already registered query with `args`.
    ///
    /// Fails with [`QueryError::NotFound`] if no pass or control has created
    /// its fiber yet.
    pub fn run<Q: Query>(&self, query: &Q, args: Q::Args) -> Result<(), QueryError> {
        let key = query.key();
        let fiber = self
            .cache
            .get::<Q::Output, Q::Args>(&key)?
            .ok_or_else(|| QueryError::NotFound {
                query: key.debug_repr(),
            })?;
        fiber.run(&self.event_ctx(), args);
        Ok(())
    }

    /// The host committed this pass: register every record.
    ///
    /// A record whose fiber changed since it was read asks the consumer to
    /// re-render instead of registering.
    pub fn commit(self) -> Mounted {
        for record in &self.records {
            record.commit();
        }
        Mounted {
            records: self.records,
        }
    }
}

impl std::fmt::Debug for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pass")
            .field("consumer", &self.consumer.id())
            .field("records", &self.records.len())
            .finish()
    }
}

/// Both `args` and `initial_args` on an already mounted fiber. On the first
/// mount `args` simply takes precedence.
fn args_conflict<T, A>(mounted: bool, options: &ObserveOptions<T, A>) -> bool {
    mounted && options.args.is_some() && options.initial_args.is_some()
}

fn warn_on_args_conflict<T, A>(fiber: &Fiber<T, A>)
where
    T: Send + Sync + 'static,
    A: QueryArgs,
{
    if !WARNED_ARGS_CONFLICT.swap(true, Ordering::Relaxed) {
        tracing::warn!(
            query = %fiber.name(),
            "`args` and `initial_args` were both supplied; `initial_args` is only used to mount"
        );
    }
}

/// The records of a committed pass.
///
/// Dropping it (or calling [`Mounted::unmount`]) cleans the records up. A
/// record already replaced by a newer pass of the same consumer is left
/// alone.
pub struct Mounted {
    records: Vec<Arc<Subscription>>,
}

impl Mounted {
    pub fn records(&self) -> &[Arc<Subscription>] {
        &self.records
    }

    pub fn unmount(self) {}
}

impl Drop for Mounted {
    fn drop(&mut self) {
        for record in &self.records {
            record.unmount();
        }
    }
}

/// Imperative controls returned by [`Pass::control`].
pub struct Controls<T, A> {
    fiber: Arc<Fiber<T, A>>,
    ctx: ExecutionContext,
    is_pending: bool,
}

impl<T: Send + Sync + 'static, A: QueryArgs> Controls<T, A> {
    /// Whether a run was in flight when the controls were taken.
    pub fn is_pending(&self) -> bool {
        self.is_pending
    }

    pub fn run(&self, args: A) {
        self.fiber.run(&self.ctx, args);
    }

    pub fn set_data(&self, value: T) {
        self.fiber.set_data(&self.ctx, value);
    }

    pub fn set_error(&self, reason: impl Into<anyhow::Error>) {
        self.fiber.set_error(&self.ctx, reason);
    }

    pub fn fiber(&self) -> &Arc<Fiber<T, A>> {
        &self.fiber
    }
}

/// Mutation handle returned by [`Pass::mutate`].
pub struct Mutator<T, A> {
    fiber: Arc<Fiber<T, A>>,
    ctx: ExecutionContext,
}

impl<T: Send + Sync + 'static, A: QueryArgs> Mutator<T, A> {
    /// Run the mutation. If it is fulfilled, every dependent present in the
    /// cache is evicted and its subscribers notified; rejection evicts
    /// nothing.
    pub fn call(&self, args: A) {
        self.fiber.run(&self.ctx, args);
    }

    pub fn fiber(&self) -> &Arc<Fiber<T, A>> {
        &self.fiber
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_conflict_needs_a_mounted_fiber() {
        let both = ObserveOptions::<u32, u32>::with_args(3).initial_args(4);
        assert!(!args_conflict(false, &both));
        assert!(args_conflict(true, &both));

        let args_only = ObserveOptions::<u32, u32>::with_args(3);
        assert!(!args_conflict(true, &args_only));
        let initial_only = ObserveOptions::<u32, u32>::new().initial_args(4);
        assert!(!args_conflict(true, &initial_only));
    }
}
