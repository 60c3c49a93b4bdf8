//! Host scheduling hooks and the execution context threaded through updates.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::QueryKey;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a closure as a low-priority transition.
pub type Transition = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// The host's scheduling primitives.
///
/// Updates applied while a pass is rendering are not flushed in place; they
/// are handed to [`Scheduler::schedule`] and flushed on the next tick.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` after the current pass, on a later tick.
    fn schedule(&self, task: Task);

    /// Run `f` as a low-priority transition.
    ///
    /// Hosts without transitions can keep the default, which calls `f`
    /// directly.
    fn start_transition(&self, f: &mut dyn FnMut()) {
        f()
    }
}

/// A FIFO task queue drained explicitly by the host.
///
/// This is the scheduler used by the global cache and by most tests: call
/// [`TaskQueue::run_until_idle`] at the point where the host's tick would run.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    transition_depth: AtomicUsize,
    transitions: AtomicUsize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Run tasks until the queue is empty, including tasks scheduled by the
    /// tasks themselves. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // Pop under the lock, run outside it.
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Returns `true` while a transition started through this queue is running.
    pub fn in_transition(&self) -> bool {
        self.transition_depth.load(Ordering::SeqCst) > 0
    }

    /// Total number of transitions started through this queue.
    pub fn transitions_started(&self) -> usize {
        self.transitions.load(Ordering::SeqCst)
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    fn start_transition(&self, f: &mut dyn FnMut()) {
        self.transitions.fetch_add(1, Ordering::SeqCst);
        self.transition_depth.fetch_add(1, Ordering::SeqCst);
        f();
        self.transition_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .field("in_transition", &self.in_transition())
            .finish()
    }
}

/// Which phase an update is applied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Inside a speculative pass. Flushes are deferred to the scheduler.
    Render,
    /// Outside any pass: event handlers, settlements, scheduled tasks.
    Event,
}

/// Context passed through every update.
///
/// Carries the phase (which decides whether the flush is deferred), the
/// transition to use for deferred-class notifications, and the dependents to
/// evict once the update is fulfilled.
#[derive(Clone)]
pub struct ExecutionContext {
    phase: Phase,
    transition: Option<Transition>,
    dependents: Option<Arc<[QueryKey]>>,
}

impl ExecutionContext {
    /// Context for updates applied outside a pass.
    pub fn event() -> Self {
        Self {
            phase: Phase::Event,
            transition: None,
            dependents: None,
        }
    }

    /// Context for updates applied while a pass is rendering.
    pub fn render() -> Self {
        Self {
            phase: Phase::Render,
            ..Self::event()
        }
    }

    /// Use `transition` instead of the scheduler's own.
    pub fn with_transition(mut self, transition: Option<Transition>) -> Self {
        self.transition = transition;
        self
    }

    /// Evict `keys` once the update this context applies is fulfilled.
    pub fn with_dependents(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        let keys: Arc<[QueryKey]> = keys.into_iter().collect();
        self.dependents = (!keys.is_empty()).then_some(keys);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_render_phase(&self) -> bool {
        self.phase == Phase::Render
    }

    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    pub fn dependents(&self) -> Option<&[QueryKey]> {
        self.dependents.as_deref()
    }

    /// The same context moved to the event phase, for work that runs later
    /// on a tick or from a settlement.
    pub(crate) fn detached(&self) -> Self {
        Self {
            phase: Phase::Event,
            ..self.clone()
        }
    }

    /// The same context without dependents.
    pub(crate) fn without_dependents(&self) -> Self {
        Self {
            dependents: None,
            ..self.clone()
        }
    }

    /// Run `f` inside this context's transition, falling back to the
    /// scheduler's.
    pub(crate) fn start_transition(&self, scheduler: &dyn Scheduler, f: &mut dyn FnMut()) {
        match &self.transition {
            Some(transition) => transition(f),
            None => scheduler.start_transition(f),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::event()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("phase", &self.phase)
            .field("transition", &self.transition.is_some())
            .field("dependents", &self.dependents)
            .finish()
    }
}
