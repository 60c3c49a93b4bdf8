//! The per-query state fiber.
//!
//! A fiber holds the committed `current` result, the in-flight `alternate`
//! handle, the arguments of the last run, a FIFO queue of results not yet
//! committed, and the subscription records to notify.
//!
//! Results enter only through the update queue. The queue is drained
//! immediately while the fiber has no current result; otherwise the drain
//! happens on the flush, which runs in place for event-phase updates and on
//! the next scheduler tick for render-phase updates. Reads see committed
//! state only; a pass that queued a run keeps reading the previous result
//! until the flush commits the run.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::async_result::{classify, AsyncResult, Classified, Produced};
use crate::cache::CacheShared;
use crate::config::FiberConfig;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::promise::{HandleId, Outcome, Promise};
use crate::query::QueryArgs;
use crate::scheduler::{ExecutionContext, Scheduler};
use crate::subscription::{Consumer, Subscribers, Subscription, SubscriptionFlags, Urgency};
use crate::tracer::{EvictionReason, RunOutcome, Tracer};

/// Producer closure of a fiber.
pub type Producer<T, A> = Arc<dyn Fn(A) -> Produced<T> + Send + Sync>;

/// Where a fiber's results come from.
pub enum Source<T, A> {
    /// Results are produced by calling the producer with the run arguments.
    Producer(Producer<T, A>),
    /// No producer: results are set explicitly. Running a manual fiber maps
    /// the arguments straight to the value.
    Manual(fn(A) -> T),
}

impl<T, A> Clone for Source<T, A> {
    fn clone(&self) -> Self {
        match self {
            Source::Producer(producer) => Source::Producer(producer.clone()),
            Source::Manual(identity) => Source::Manual(*identity),
        }
    }
}

impl<T, A> Source<T, A> {
    pub fn producer(f: impl Fn(A) -> Produced<T> + Send + Sync + 'static) -> Self {
        Source::Producer(Arc::new(f))
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Source::Manual(_))
    }
}

impl<T> Source<T, T> {
    pub fn manual() -> Self {
        Source::Manual(std::convert::identity)
    }
}

/// A queued result. `args` is `None` for results set directly, which leave
/// the fiber's last arguments untouched.
struct Update<T, A> {
    args: Option<A>,
    result: AsyncResult<T>,
}

/// Tracks the handle consumers are suspended on.
struct SuspenseLedger {
    handle: HandleId,
    readers: usize,
}

struct FiberState<T, A> {
    config: FiberConfig<T>,
    current: Option<AsyncResult<T>>,
    alternate: Option<Promise<T>>,
    last_args: Option<A>,
    queue: VecDeque<Update<T, A>>,
    /// Fulfilled results per argument, when caching is enabled.
    cache: Vec<(A, AsyncResult<T>)>,
    suspense: Option<SuspenseLedger>,
}

impl<T: Send + Sync + 'static, A: QueryArgs> FiberState<T, A> {
    /// Drain the queue in FIFO order. Returns `true` if anything was drained.
    ///
    /// A pending entry becomes the alternate, superseding the previous one; a
    /// settled entry becomes current and clears the alternate. Superseded
    /// handles are never looked at again, even if they have settled since.
    /// Once the queue is empty, a surviving alternate whose handle settled
    /// while it was queued is promoted to current.
    fn process_update_queue(&mut self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        let mut alternate_args = None;
        while let Some(Update { args, result }) = self.queue.pop_front() {
            match result {
                AsyncResult::Pending(promise) => {
                    self.alternate = Some(promise);
                    alternate_args = args.clone();
                }
                settled => {
                    if let Some(args) = &args {
                        self.remember(args, &settled);
                    }
                    self.current = Some(settled);
                    self.alternate = None;
                }
            }
            if let Some(args) = args {
                self.last_args = Some(args);
            }
        }

        let settled = self
            .alternate
            .as_ref()
            .map(Promise::tag)
            .filter(|tagged| !tagged.is_pending());
        if let Some(settled) = settled {
            if let Some(args) = &alternate_args {
                self.remember(args, &settled);
            }
            self.current = Some(settled);
            self.alternate = None;
        }
        true
    }

    /// Keep a fulfilled result for `args` when caching is enabled.
    fn remember(&mut self, args: &A, result: &AsyncResult<T>) {
        if self.config.cache_enabled() && result.is_fulfilled() {
            store_cached(&mut self.cache, args.clone(), result.clone());
        }
    }

    /// Id of the handle that will be the alternate once the queue drains:
    /// the last queued entry if it is pending, else the committed alternate
    /// if nothing is queued.
    fn surviving_handle(&self) -> Option<HandleId> {
        match self.queue.back() {
            Some(Update {
                result: AsyncResult::Pending(promise),
                ..
            }) => Some(promise.id()),
            Some(_) => None,
            None => self.alternate.as_ref().map(Promise::id),
        }
    }

    /// The last arguments with queued updates taken into account.
    fn effective_args(&self) -> Option<&A> {
        self.queue
            .iter()
            .rev()
            .find_map(|update| update.args.as_ref())
            .or(self.last_args.as_ref())
    }

    fn has_data(&self) -> bool {
        self.current.is_some() || self.alternate.is_some()
    }

    fn cached(&self, args: &A) -> Option<AsyncResult<T>> {
        self.cache
            .iter()
            .find(|(cached_args, _)| cached_args == args)
            .map(|(_, result)| result.clone())
    }

    /// Drop current, alternate and queued results; the per-argument cache
    /// is kept.
    fn reset(&mut self) {
        self.current = None;
        self.alternate = None;
        self.queue.clear();
        self.suspense = None;
    }

    fn clear(&mut self) {
        self.reset();
        self.cache.clear();
    }
}

fn store_cached<T, A: PartialEq>(cache: &mut Vec<(A, AsyncResult<T>)>, args: A, result: AsyncResult<T>) {
    match cache.iter_mut().find(|(cached_args, _)| *cached_args == args) {
        Some(entry) => entry.1 = result,
        None => cache.push((args, result)),
    }
}

/// How a settling handle relates to the fiber.
enum Settlement {
    /// The handle is the fiber's alternate: commit its result.
    Active,
    /// The handle is the last queued entry; the drain promotes it.
    Queued,
    /// A newer run or a set value superseded the handle.
    Stale,
}

/// Per-query state: results, update queue and subscribers.
pub struct Fiber<T, A> {
    key: QueryKey,
    source: Source<T, A>,
    root: Weak<CacheShared>,
    scheduler: Arc<dyn Scheduler>,
    tracer: Arc<dyn Tracer>,
    state: Mutex<FiberState<T, A>>,
    subscribers: Mutex<Subscribers>,
}

impl<T: Send + Sync + 'static, A: QueryArgs> Fiber<T, A> {
    pub(crate) fn new(
        key: QueryKey,
        source: Source<T, A>,
        config: FiberConfig<T>,
        root: Weak<CacheShared>,
        scheduler: Arc<dyn Scheduler>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let current = config.initial_value.clone().map(|value| AsyncResult::Fulfilled {
            id: HandleId::next(),
            value,
        });
        Self {
            key,
            source,
            root,
            scheduler,
            tracer,
            state: Mutex::new(FiberState {
                config,
                current,
                alternate: None,
                last_args: None,
                queue: VecDeque::new(),
                cache: Vec::new(),
                suspense: None,
            }),
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The configured name, or the key's debug representation.
    pub fn name(&self) -> String {
        self.name_of(&self.state.lock())
    }

    fn name_of(&self, state: &FiberState<T, A>) -> String {
        state
            .config
            .name
            .clone()
            .unwrap_or_else(|| self.key.debug_repr())
    }

    pub fn is_manual(&self) -> bool {
        self.source.is_manual()
    }

    pub fn config(&self) -> FiberConfig<T> {
        self.state.lock().config.clone()
    }

    pub(crate) fn merge_config(&self, config: &FiberConfig<T>) {
        self.state.lock().config.merge(config);
    }

    /// The committed current result.
    pub fn current(&self) -> Option<AsyncResult<T>> {
        self.state.lock().current.clone()
    }

    /// The committed in-flight handle.
    pub fn alternate(&self) -> Option<Promise<T>> {
        self.state.lock().alternate.clone()
    }

    /// Arguments of the last committed run.
    pub fn last_args(&self) -> Option<A> {
        self.state.lock().last_args.clone()
    }

    /// Arguments of the last run, including runs still queued.
    pub fn effective_args(&self) -> Option<A> {
        self.state.lock().effective_args().cloned()
    }

    /// Returns `true` while a run is in flight.
    pub fn is_pending(&self) -> bool {
        self.state.lock().alternate.is_some()
    }

    /// Returns `true` if the fiber has a current result or an in-flight run.
    pub fn has_data(&self) -> bool {
        self.state.lock().has_data()
    }

    /// Number of updates waiting for a flush.
    pub fn queued_updates(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of fulfilled results kept per argument.
    pub fn cached_results(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Run the producer with `args` and feed the result through the queue.
    ///
    /// With caching enabled, a fulfilled result for equal arguments is reused
    /// without calling the producer. A fresh pending handle is committed when
    /// it settles, unless a newer run has superseded it by then.
    pub fn run(self: &Arc<Self>, ctx: &ExecutionContext, args: A) {
        let producer = match &self.source {
            Source::Manual(into_value) => {
                let result = AsyncResult::fulfilled(into_value(args.clone()));
                self.tracer.on_run(&self.key, RunOutcome::Ready);
                self.apply_update(ctx, Some(args), result);
                return;
            }
            Source::Producer(producer) => producer,
        };

        let cached = {
            let state = self.state.lock();
            if state.config.cache_enabled() {
                state.cached(&args)
            } else {
                None
            }
        };
        if let Some(result) = cached {
            self.tracer.on_run(&self.key, RunOutcome::Cached);
            self.apply_update(ctx, Some(args), result);
            return;
        }

        match classify(producer(args.clone())) {
            Classified::Ready(result) => {
                self.tracer.on_run(&self.key, RunOutcome::Ready);
                self.apply_update(ctx, Some(args), result);
            }
            Classified::Reused(result) => {
                self.tracer.on_run(&self.key, RunOutcome::Reused);
                self.apply_update(ctx, Some(args), result);
            }
            Classified::Fresh(promise) => {
                self.tracer.on_run(&self.key, RunOutcome::Pending);
                self.apply_update(ctx, Some(args.clone()), AsyncResult::Pending(promise.clone()));

                let id = promise.id();
                let fiber = Arc::downgrade(self);
                let settle_ctx = ctx.detached();
                promise.then(move |outcome| {
                    if let Some(fiber) = fiber.upgrade() {
                        fiber.settle(&settle_ctx, id, args, outcome);
                    }
                });
            }
        }
    }

    fn settle(self: &Arc<Self>, ctx: &ExecutionContext, id: HandleId, args: A, outcome: &Outcome<T>) {
        let settlement = {
            let state = self.state.lock();
            if state.surviving_handle() != Some(id) {
                Settlement::Stale
            } else if state.queue.is_empty() {
                Settlement::Active
            } else {
                Settlement::Queued
            }
        };
        match settlement {
            Settlement::Active => {
                let result = AsyncResult::from_outcome(id, outcome.clone());
                self.apply_update(ctx, Some(args), result);
            }
            Settlement::Queued => {}
            Settlement::Stale => self.tracer.on_stale_settlement(&self.key, id),
        }
    }

    /// Commit `value` as the current result and notify subscribers.
    ///
    /// Any in-flight run is discarded; its late settlement is ignored. The
    /// last arguments are left as they were.
    pub fn set_data(self: &Arc<Self>, ctx: &ExecutionContext, value: T) {
        self.apply_update(ctx, None, AsyncResult::fulfilled(value));
    }

    /// Commit `reason` as a rejected current result and notify subscribers.
    pub fn set_error(self: &Arc<Self>, ctx: &ExecutionContext, reason: impl Into<anyhow::Error>) {
        self.apply_update(ctx, None, AsyncResult::rejected(reason));
    }

    fn apply_update(self: &Arc<Self>, ctx: &ExecutionContext, args: Option<A>, result: AsyncResult<T>) {
        let update_id = result.id();
        {
            let mut state = self.state.lock();
            state.queue.push_back(Update { args, result });
            if state.current.is_none() {
                state.process_update_queue();
            }
        }

        if ctx.is_render_phase() {
            let fiber = self.clone();
            let ctx = ctx.detached();
            self.scheduler
                .schedule(Box::new(move || fiber.commit_update(&ctx, update_id)));
        } else {
            self.commit_update(ctx, update_id);
        }
    }

    /// Flush for one applied update: drain, evict dependents if the update is
    /// now the fulfilled current result, then notify.
    fn commit_update(&self, ctx: &ExecutionContext, update_id: HandleId) {
        let fulfilled = {
            let mut state = self.state.lock();
            self.drain(&mut state);
            state
                .current
                .as_ref()
                .is_some_and(|current| current.is_fulfilled() && current.id() == update_id)
        };

        let notify_ctx = ctx.without_dependents();
        if fulfilled {
            if let Some(dependents) = ctx.dependents() {
                self.invalidate_dependents(&notify_ctx, dependents);
            }
        }
        self.notify(&notify_ctx);
    }

    fn invalidate_dependents(&self, ctx: &ExecutionContext, dependents: &[QueryKey]) {
        let Some(root) = self.root.upgrade() else {
            return;
        };
        for key in dependents {
            if let Some(dependent) = root.lookup(key) {
                dependent.invalidate(
                    ctx,
                    EvictionReason::Dependency {
                        source: self.key.clone(),
                    },
                );
            }
        }
    }

    fn drain(&self, state: &mut FiberState<T, A>) {
        if state.process_update_queue() {
            self.tracer
                .on_commit(&self.key, state.current.as_ref().map(|c| c.status()));
        }
    }

    /// Drain the update queue and notify subscribers.
    pub fn flush(&self, ctx: &ExecutionContext) {
        self.drain(&mut self.state.lock());
        self.notify(ctx);
    }

    /// Evict results and notify subscribers.
    ///
    /// With `None`, clears current, alternate, queued updates and the whole
    /// per-argument cache. With `Some(args)`, removes the cached entry for
    /// `args`, and clears current, alternate and queued updates only if the
    /// last run used `args`.
    pub fn evict(&self, ctx: &ExecutionContext, args: Option<&A>) {
        {
            let mut state = self.state.lock();
            match args {
                None => state.clear(),
                Some(args) => {
                    state.cache.retain(|(cached_args, _)| cached_args != args);
                    if state.effective_args() == Some(args) {
                        state.reset();
                    }
                }
            }
        }
        self.tracer.on_evict(&self.key, EvictionReason::Manual);
        self.notify(ctx);
    }

    /// Re-seed `current` from the configured initial value of an empty fiber.
    pub(crate) fn seed_initial_value(&self) {
        let mut state = self.state.lock();
        if state.has_data() || !state.queue.is_empty() {
            return;
        }
        state.current = state
            .config
            .initial_value
            .clone()
            .map(|value| AsyncResult::Fulfilled {
                id: HandleId::next(),
                value,
            });
    }

    /// Notify every registered record: deferred ones inside a transition,
    /// urgent ones directly.
    pub fn notify(&self, ctx: &ExecutionContext) {
        let (deferred, urgent) = self.subscribers.lock().snapshot();
        self.tracer.on_notify(&self.key, urgent.len(), deferred.len());
        if !deferred.is_empty() {
            ctx.start_transition(&*self.scheduler, &mut || {
                for record in &deferred {
                    record.consumer().rerender();
                }
            });
        }
        for record in &urgent {
            record.consumer().rerender();
        }
    }

    /// Create an unregistered record for `consumer`, snapshotting the id of
    /// the current result.
    pub fn subscribe(self: &Arc<Self>, consumer: Consumer, urgency: Urgency) -> Arc<Subscription> {
        let (snapshot, pending) = {
            let state = self.state.lock();
            (
                state.current.as_ref().map(|c| c.id()),
                state.alternate.is_some(),
            )
        };
        let flags = if pending {
            SubscriptionFlags::PENDING
        } else {
            SubscriptionFlags::empty()
        };
        let fiber: Weak<dyn AnyFiber> = Arc::downgrade(self) as Weak<dyn AnyFiber>;
        Subscription::new(consumer, urgency, flags, snapshot, fiber)
    }

    /// Read the fiber for `record` inside a pass.
    ///
    /// Reads the in-flight handle if there is one, else the current result.
    /// A first read that is about to suspend registers `record` right away
    /// and enters the suspension ledger; a read that renders back the result
    /// it was suspended on marks `record` for resync.
    pub(crate) fn read(&self, record: &Arc<Subscription>) -> Result<Arc<T>, QueryError> {
        record.insert_flags(SubscriptionFlags::RENDERING);

        let (target, suspended_on, resync) = {
            let mut state = self.state.lock();
            let target = match (&state.alternate, &state.current) {
                (Some(alternate), _) => AsyncResult::Pending(alternate.clone()),
                (None, Some(current)) => current.clone(),
                (None, None) => {
                    return Err(QueryError::NoInitialValue {
                        query: self.name_of(&state),
                    })
                }
            };

            let suspending = state.current.is_none()
                && state.alternate.as_ref().is_some_and(|p| !p.is_settled());
            let suspended_on = if suspending { Some(target.id()) } else { None };
            if let Some(id) = suspended_on {
                let joined = state
                    .suspense
                    .as_ref()
                    .is_some_and(|ledger| ledger.handle == id);
                if joined {
                    if let Some(ledger) = state.suspense.as_mut() {
                        ledger.readers += 1;
                    }
                } else {
                    state.suspense = Some(SuspenseLedger {
                        handle: id,
                        readers: 1,
                    });
                }
            }

            let current_id = state.current.as_ref().map(|c| c.id());
            let resync = state
                .suspense
                .as_ref()
                .is_some_and(|ledger| Some(ledger.handle) == current_id);
            if resync {
                state.suspense = None;
            }
            (target, suspended_on, resync)
        };

        if let Some(id) = suspended_on {
            record.insert_flags(SubscriptionFlags::SUSPENDING);
            record.register();
            self.tracer.on_suspend(&self.key, id);
        }
        if resync {
            record.insert_flags(SubscriptionFlags::RESYNC);
        }
        target.read()
    }

    /// The rejection reason of the current result, if rejected.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.current()
            .and_then(|current| current.reason().cloned())
    }

    /// Number of reads that suspended on the in-flight handle.
    pub fn suspended_readers(&self) -> usize {
        self.state
            .lock()
            .suspense
            .as_ref()
            .map_or(0, |ledger| ledger.readers)
    }
}

impl<T, A> fmt::Debug for Fiber<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("key", &self.key)
            .field("manual", &self.source.is_manual())
            .finish_non_exhaustive()
    }
}

/// Type-erased access to a fiber.
///
/// The cache stores fibers of different value and argument types side by
/// side; subscriptions and dependency cascades go through this trait.
pub trait AnyFiber: Send + Sync + 'static {
    fn key(&self) -> &QueryKey;

    /// Type name of the concrete fiber, for mismatch diagnostics.
    fn type_name(&self) -> &'static str;

    /// Id of the current result as a read would see it.
    fn current_id(&self) -> Option<HandleId>;

    /// Clear results and notify, recording `reason`.
    fn invalidate(&self, ctx: &ExecutionContext, reason: EvictionReason);

    /// Report a completed resync, then flush and notify.
    fn resync(&self, ctx: &ExecutionContext);

    fn subscribers(&self) -> &Mutex<Subscribers>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + Sync + 'static, A: QueryArgs> AnyFiber for Fiber<T, A> {
    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn current_id(&self) -> Option<HandleId> {
        self.state.lock().current.as_ref().map(|c| c.id())
    }

    fn invalidate(&self, ctx: &ExecutionContext, reason: EvictionReason) {
        self.state.lock().clear();
        self.tracer.on_evict(&self.key, reason);
        self.notify(ctx);
    }

    fn resync(&self, ctx: &ExecutionContext) {
        self.tracer.on_resync(&self.key);
        self.flush(ctx);
    }

    fn subscribers(&self) -> &Mutex<Subscribers> {
        &self.subscribers
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
