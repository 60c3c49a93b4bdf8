//! Tests for mutations evicting their dependents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use suspense_query::{
    Consumer, EvictionReason, ExecutionContext, FiberCache, FiberConfig, Mounted, ObserveOptions,
    Promise, Produced, Query, QueryFn, QueryKey, Resolver, TaskQueue, Tracer,
};

#[derive(Default)]
struct EvictionLog {
    evictions: Mutex<Vec<(QueryKey, EvictionReason)>>,
}

impl Tracer for EvictionLog {
    fn on_evict(&self, key: &QueryKey, reason: EvictionReason) {
        self.evictions.lock().push((key.clone(), reason));
    }
}

struct Blog {
    tasks: Arc<TaskQueue>,
    cache: FiberCache,
    log: Arc<EvictionLog>,
    fetches: Arc<AtomicUsize>,
    renders: Arc<AtomicUsize>,
    reader: Consumer,
}

impl Blog {
    fn new() -> Self {
        let tasks = Arc::new(TaskQueue::new());
        let log = Arc::new(EvictionLog::default());
        let cache = FiberCache::builder(tasks.clone())
            .shared_tracer(log.clone())
            .build();
        let renders = Arc::new(AtomicUsize::new(0));
        let counter = renders.clone();
        Self {
            tasks,
            cache,
            log,
            fetches: Arc::new(AtomicUsize::new(0)),
            renders,
            reader: Consumer::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    fn posts(&self) -> QueryFn<Vec<String>, ()> {
        let fetches = self.fetches.clone();
        QueryFn::named("posts", move |()| {
            fetches.fetch_add(1, Ordering::SeqCst);
            Produced::Value(vec!["first".to_string()])
        })
    }

    /// Observe the posts and commit, as a mounted reader would.
    fn mount_reader(&self) -> Mounted {
        let mut pass = self.cache.pass(&self.reader);
        pass.observe(&self.posts(), ObserveOptions::new()).unwrap();
        let mounted = pass.commit();
        // The mount's own flush notifies the reader once; start counting after.
        self.tasks.run_until_idle();
        self.renders.store(0, Ordering::SeqCst);
        mounted
    }

    fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[test]
fn test_fulfilled_mutation_evicts_dependents_once() {
    let blog = Blog::new();
    let _mounted = blog.mount_reader();
    assert_eq!(blog.fetches(), 1);

    let add_post = QueryFn::sync(|title: String| title.len());
    let writer = Consumer::new(|| {});
    let mut pass = blog.cache.pass(&writer);
    let mutator = pass.mutate(&add_post, [blog.posts().key()]).unwrap();
    mutator.call("second".to_string());

    assert_eq!(blog.renders(), 1);
    let posts = blog.cache.fiber(&blog.posts()).unwrap();
    assert!(posts.current().is_none());
    assert_eq!(
        blog.log.evictions.lock().clone(),
        vec![(
            blog.posts().key(),
            EvictionReason::Dependency {
                source: add_post.key()
            }
        )]
    );

    // The reader re-renders and fetches again.
    let mut pass = blog.cache.pass(&blog.reader);
    pass.observe(&blog.posts(), ObserveOptions::new()).unwrap();
    assert_eq!(blog.fetches(), 2);
}

#[test]
fn test_rejected_mutation_evicts_nothing() {
    let blog = Blog::new();
    let _mounted = blog.mount_reader();

    let add_post = QueryFn::new(|title: String| {
        Produced::from_result(if title.is_empty() {
            Err(anyhow::anyhow!("title is required"))
        } else {
            Ok(title.len())
        })
    });
    let writer = Consumer::new(|| {});
    let mut pass = blog.cache.pass(&writer);
    let mutator = pass.mutate(&add_post, [blog.posts().key()]).unwrap();
    mutator.call(String::new());

    assert!(mutator.fiber().current().unwrap().is_rejected());
    assert_eq!(blog.renders(), 0);
    assert!(blog.log.evictions.lock().is_empty());
    assert!(blog.cache.fiber(&blog.posts()).unwrap().current().is_some());
}

#[test]
fn test_pending_mutation_evicts_on_fulfillment() {
    let blog = Blog::new();
    let _mounted = blog.mount_reader();

    let resolver: Arc<Mutex<Option<Resolver<usize>>>> = Arc::default();
    let slot = resolver.clone();
    let add_post = QueryFn::new(move |_title: String| {
        let (promise, resolver) = Promise::new();
        *slot.lock() = Some(resolver);
        Produced::Handle(promise)
    });
    let writer = Consumer::new(|| {});
    let mut pass = blog.cache.pass(&writer);
    let mutator = pass.mutate(&add_post, [blog.posts().key()]).unwrap();
    mutator.call("second".to_string());

    assert!(mutator.fiber().is_pending());
    assert!(blog.log.evictions.lock().is_empty());
    assert_eq!(blog.renders(), 0);

    let resolver = resolver.lock().take().unwrap();
    resolver.resolve(6);

    assert_eq!(blog.log.evictions.lock().len(), 1);
    assert_eq!(blog.renders(), 1);
    assert!(blog.cache.fiber(&blog.posts()).unwrap().current().is_none());
}

#[test]
fn test_unknown_dependents_are_skipped() {
    let blog = Blog::new();
    let _mounted = blog.mount_reader();

    let add_post = QueryFn::sync(|title: String| title.len());
    let writer = Consumer::new(|| {});
    let mut pass = blog.cache.pass(&writer);
    let mutator = pass
        .mutate(
            &add_post,
            [QueryKey::named("never-observed"), blog.posts().key()],
        )
        .unwrap();
    mutator.call("second".to_string());

    assert_eq!(blog.log.evictions.lock().len(), 1);
    assert!(!blog.cache.contains(&QueryKey::named("never-observed")));
    assert_eq!(blog.renders(), 1);
}

#[test]
fn test_plain_runs_do_not_evict() {
    let blog = Blog::new();
    let _mounted = blog.mount_reader();

    let add_post = QueryFn::sync(|title: String| title.len());
    let writer = Consumer::new(|| {});
    let pass = blog.cache.pass(&writer);
    blog.cache.fiber(&add_post).unwrap();
    pass.run(&add_post, "second".to_string()).unwrap();

    assert!(blog.log.evictions.lock().is_empty());
    assert_eq!(blog.fetches(), 1);
}

#[test]
fn test_superseded_mutation_run_evicts_nothing() {
    let blog = Blog::new();
    let _mounted = blog.mount_reader();

    let resolvers: Arc<Mutex<Vec<Option<Resolver<usize>>>>> = Arc::default();
    let slot = resolvers.clone();
    let add_post = QueryFn::new(move |_title: String| {
        let (promise, resolver) = Promise::new();
        slot.lock().push(Some(resolver));
        Produced::Handle(promise)
    });
    let mutation = blog
        .cache
        .get_or_create(
            add_post.key(),
            || add_post.source(),
            Some(&FiberConfig::new().initial_value(0)),
        )
        .unwrap();

    // Both runs are queued while rendering; only the first declares
    // dependents, and it settles before the tick after being superseded.
    let with_dependents = ExecutionContext::render().with_dependents([blog.posts().key()]);
    mutation.run(&with_dependents, "first".to_string());
    mutation.run(&ExecutionContext::render(), "second".to_string());
    let first = resolvers.lock()[0].take().unwrap();
    first.resolve(5);
    blog.tasks.run_until_idle();

    assert_eq!(
        mutation.current().and_then(|c| c.value().map(|v| **v)),
        Some(0)
    );
    assert!(mutation.is_pending());
    assert!(blog.log.evictions.lock().is_empty());
    assert!(blog.cache.fiber(&blog.posts()).unwrap().current().is_some());

    let second = resolvers.lock()[1].take().unwrap();
    second.resolve(6);
    assert_eq!(
        mutation.current().and_then(|c| c.value().map(|v| **v)),
        Some(6)
    );
    assert!(blog.log.evictions.lock().is_empty());
}
