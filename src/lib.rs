//! Suspense-Query: a cache-and-notification engine for asynchronous queries
//! read from speculative, suspendable render passes.
//!
//! Each query owns a [`Fiber`]: the committed result, the in-flight run, and
//! the consumers to notify. Consumers read through a [`Pass`], which may be
//! committed or thrown away; reads of a pending result return
//! [`QueryError::Suspend`] so the host can retry the pass once the handle
//! settles.
//!
//! # Key Features
//!
//! - **Speculation-safe**: a discarded pass leaves no subscription behind
//! - **Last run wins**: a superseded handle settling late never overwrites a
//!   newer result
//! - **Deferred flushes**: updates made while rendering are committed on the
//!   next scheduler tick
//! - **Two urgency classes**: deferred subscribers are notified inside a
//!   transition, urgent ones directly
//! - **Dependency eviction**: a fulfilled mutation evicts the queries it
//!   declares as dependents
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use suspense_query::{
//!     Consumer, FiberCache, ObserveOptions, Promise, Produced, QueryError, QueryFn, TaskQueue,
//! };
//!
//! let tasks = Arc::new(TaskQueue::new());
//! let cache = FiberCache::new(tasks.clone());
//! let consumer = Consumer::new(|| {});
//!
//! let (promise, resolver) = Promise::new();
//! let handle = Arc::new(parking_lot::Mutex::new(Some(promise)));
//! let get_user = QueryFn::new(move |id: u32| {
//!     let promise = handle.lock().take();
//!     match promise {
//!         Some(promise) => Produced::Handle(promise),
//!         None => Produced::Value(format!("user {id}")),
//!     }
//! });
//!
//! let mut pass = cache.pass(&consumer);
//! let err = pass.observe(&get_user, ObserveOptions::with_args(1)).unwrap_err();
//! assert!(matches!(err, QueryError::Suspend { .. }));
//! drop(pass);
//!
//! resolver.resolve("Ada".to_string());
//! tasks.run_until_idle();
//!
//! let mut pass = cache.pass(&consumer);
//! let user = pass.observe(&get_user, ObserveOptions::with_args(1)).unwrap();
//! assert_eq!(*user, "Ada");
//! let _mounted = pass.commit();
//! ```

mod async_result;
mod cache;
mod config;
mod error;
mod fiber;
mod key;
mod promise;
mod query;
mod runtime;
mod scheduler;
mod subscription;
pub mod tracer;

pub use async_result::{classify, AsyncResult, Classified, Produced, Status};
pub use cache::{FiberCache, FiberCacheBuilder, Provider, ProviderGuard};
pub use config::{Deadline, Effect, FiberConfig, ObserveOptions};
pub use error::QueryError;
pub use fiber::{AnyFiber, Fiber, Producer, Source};
pub use key::{Identity, QueryKey};
pub use promise::{HandleId, Outcome, Promise, Resolver, SuspendHandle};
pub use query::{Manual, Query, QueryArgs, QueryFn};
pub use runtime::{Controls, Mounted, Mutator, Pass};
pub use scheduler::{ExecutionContext, Phase, Scheduler, Task, TaskQueue, Transition};
pub use subscription::{Consumer, ConsumerId, Subscribers, Subscription, SubscriptionFlags, Urgency};
pub use tracer::{EvictionReason, LogTracer, NoopTracer, RunOutcome, Tracer};
