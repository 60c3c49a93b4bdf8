//! Consumers, subscription records and their commit/cleanup lifecycle.
//!
//! A pass creates one [`Subscription`] per fiber it reads. The record is not
//! registered with the fiber until the host commits the pass; an abandoned
//! pass leaves nothing behind. The one exception is a read that suspends:
//! the host will never commit that pass, so the record registers itself
//! straight away and is torn down when the consumer renders back.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::fiber::AnyFiber;
use crate::promise::HandleId;
use crate::scheduler::{ExecutionContext, Transition};

/// Identity of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// A rendering unit that reads fibers and is re-rendered when they change.
#[derive(Clone)]
pub struct Consumer {
    id: ConsumerId,
    rerender: Arc<dyn Fn() + Send + Sync>,
    transition: Option<Transition>,
}

impl Consumer {
    /// Create a consumer with its re-render callback.
    pub fn new(rerender: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            id: ConsumerId(NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed)),
            rerender: Arc::new(rerender),
            transition: None,
        }
    }

    /// Use `transition` for deferred-class notifications triggered by this
    /// consumer's controls.
    pub fn with_transition(mut self, transition: impl Fn(&mut dyn FnMut()) + Send + Sync + 'static) -> Self {
        self.transition = Some(Arc::new(transition));
        self
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    /// Ask the host to re-render this consumer.
    pub fn rerender(&self) {
        (self.rerender)()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("transition", &self.transition.is_some())
            .finish()
    }
}

/// Notification class of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Urgency {
    /// Notified inside a transition.
    Deferred,
    /// Notified directly.
    Urgent,
}

bitflags::bitflags! {
    /// State bits of a [`Subscription`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubscriptionFlags: u8 {
        /// The record was read during its pass.
        const RENDERING  = 1 << 0;
        /// The fiber had a pending run when the record was created.
        const PENDING    = 1 << 1;
        /// The record is registered by a committed pass.
        const COMMITTED  = 1 << 2;
        /// The read suspended and the record registered itself.
        const SUSPENDING = 1 << 3;
        /// The consumer rendered back from suspension; commit tears down the
        /// stale suspended records.
        const RESYNC     = 1 << 4;
    }
}

/// A consumer's registration with one fiber for one pass.
pub struct Subscription {
    version: u64,
    consumer: Consumer,
    urgency: Urgency,
    flags: Mutex<SubscriptionFlags>,
    snapshot: Option<HandleId>,
    fiber: Weak<dyn AnyFiber>,
}

impl Subscription {
    pub(crate) fn new(
        consumer: Consumer,
        urgency: Urgency,
        flags: SubscriptionFlags,
        snapshot: Option<HandleId>,
        fiber: Weak<dyn AnyFiber>,
    ) -> Arc<Self> {
        Arc::new(Self {
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            consumer,
            urgency,
            flags: Mutex::new(flags),
            snapshot,
            fiber,
        })
    }

    /// Unique per record; cleanup only removes the registration if it still
    /// holds this version.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    /// The id of the fiber's current result when the record was created.
    pub fn snapshot(&self) -> Option<HandleId> {
        self.snapshot
    }

    pub fn flags(&self) -> SubscriptionFlags {
        *self.flags.lock()
    }

    pub fn is_committed(&self) -> bool {
        self.flags().contains(SubscriptionFlags::COMMITTED)
    }

    pub(crate) fn insert_flags(&self, flags: SubscriptionFlags) {
        self.flags.lock().insert(flags);
    }

    /// Register this record with its fiber, replacing any record of the same
    /// consumer in the same class.
    pub(crate) fn register(self: &Arc<Self>) {
        if let Some(fiber) = self.fiber.upgrade() {
            fiber.subscribers().lock().insert(self.clone());
        }
    }

    /// Returns `true` if this record is registered with its fiber.
    pub fn is_registered(&self) -> bool {
        let Some(fiber) = self.fiber.upgrade() else {
            return false;
        };
        let subscribers = fiber.subscribers().lock();
        subscribers
            .get(self.urgency, self.consumer.id)
            .is_some_and(|current| current.version == self.version)
    }

    /// Commit the record after the host committed its pass.
    ///
    /// If the fiber's current result changed since the pass read it, the
    /// consumer is asked to re-render instead and `false` is returned.
    pub fn commit(self: &Arc<Self>) -> bool {
        let Some(fiber) = self.fiber.upgrade() else {
            return false;
        };
        if fiber.current_id() != self.snapshot {
            self.consumer.rerender();
            return false;
        }
        fiber.subscribers().lock().insert(self.clone());

        let resync = {
            let mut flags = self.flags.lock();
            flags.insert(SubscriptionFlags::COMMITTED);
            flags.remove(SubscriptionFlags::SUSPENDING);
            let resync = flags.contains(SubscriptionFlags::RESYNC);
            flags.remove(SubscriptionFlags::RESYNC);
            resync
        };
        if resync {
            let stale = fiber.subscribers().lock().stale_suspenders(self);
            for record in stale {
                record.cleanup();
            }
            let ctx = ExecutionContext::event().with_transition(self.consumer.transition.clone());
            fiber.resync(&ctx);
        }
        true
    }

    /// Remove the registration if it still belongs to this record.
    ///
    /// Returns `false` if a newer record of the same consumer replaced it.
    pub fn cleanup(&self) -> bool {
        let Some(fiber) = self.fiber.upgrade() else {
            return false;
        };
        let mut subscribers = fiber.subscribers().lock();
        subscribers.remove(self)
    }

    /// Cleanup on unmount.
    pub(crate) fn unmount(&self) {
        self.cleanup();
        self.flags.lock().remove(SubscriptionFlags::COMMITTED);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("version", &self.version)
            .field("consumer", &self.consumer.id)
            .field("urgency", &self.urgency)
            .field("flags", &self.flags())
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

type RecordMap = HashMap<ConsumerId, Arc<Subscription>, ahash::RandomState>;

/// The registered records of one fiber, one map per notification class.
#[derive(Default)]
pub struct Subscribers {
    deferred: RecordMap,
    urgent: RecordMap,
}

impl Subscribers {
    fn class(&self, urgency: Urgency) -> &RecordMap {
        match urgency {
            Urgency::Deferred => &self.deferred,
            Urgency::Urgent => &self.urgent,
        }
    }

    fn class_mut(&mut self, urgency: Urgency) -> &mut RecordMap {
        match urgency {
            Urgency::Deferred => &mut self.deferred,
            Urgency::Urgent => &mut self.urgent,
        }
    }

    pub(crate) fn insert(&mut self, record: Arc<Subscription>) {
        self.class_mut(record.urgency)
            .insert(record.consumer.id, record);
    }

    pub(crate) fn get(&self, urgency: Urgency, consumer: ConsumerId) -> Option<&Arc<Subscription>> {
        self.class(urgency).get(&consumer)
    }

    fn remove(&mut self, record: &Subscription) -> bool {
        let map = self.class_mut(record.urgency);
        match map.get(&record.consumer.id) {
            Some(current) if current.version == record.version => {
                map.remove(&record.consumer.id);
                true
            }
            _ => false,
        }
    }

    /// Other records in `keep`'s class that registered while suspended and
    /// never committed.
    fn stale_suspenders(&self, keep: &Subscription) -> Vec<Arc<Subscription>> {
        self.class(keep.urgency)
            .values()
            .filter(|record| record.version != keep.version)
            .filter(|record| {
                let flags = record.flags();
                flags.contains(SubscriptionFlags::SUSPENDING)
                    && !flags.contains(SubscriptionFlags::COMMITTED)
            })
            .cloned()
            .collect()
    }

    /// Snapshot of the records as `(deferred, urgent)`.
    pub(crate) fn snapshot(&self) -> (Vec<Arc<Subscription>>, Vec<Arc<Subscription>>) {
        (
            self.deferred.values().cloned().collect(),
            self.urgent.values().cloned().collect(),
        )
    }

    pub fn len(&self, urgency: Urgency) -> usize {
        self.class(urgency).len()
    }

    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty() && self.urgent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;

    fn record(consumer: &Consumer, urgency: Urgency, flags: SubscriptionFlags) -> Arc<Subscription> {
        let fiber: Weak<dyn AnyFiber> = Weak::<Fiber<u32, u32>>::new();
        Subscription::new(consumer.clone(), urgency, flags, None, fiber)
    }

    #[test]
    fn test_records_replace_per_consumer_and_class() {
        let consumer = Consumer::new(|| {});
        let mut subscribers = Subscribers::default();

        let first = record(&consumer, Urgency::Urgent, SubscriptionFlags::empty());
        let second = record(&consumer, Urgency::Urgent, SubscriptionFlags::empty());
        let deferred = record(&consumer, Urgency::Deferred, SubscriptionFlags::empty());
        subscribers.insert(first.clone());
        subscribers.insert(second.clone());
        subscribers.insert(deferred);

        assert_eq!(subscribers.len(Urgency::Urgent), 1);
        assert_eq!(subscribers.len(Urgency::Deferred), 1);
        assert_eq!(
            subscribers
                .get(Urgency::Urgent, consumer.id())
                .map(|r| r.version()),
            Some(second.version())
        );

        // A replaced record cannot remove its successor.
        assert!(!subscribers.remove(&first));
        assert!(subscribers.remove(&second));
        assert_eq!(subscribers.len(Urgency::Urgent), 0);
    }

    #[test]
    fn test_stale_suspenders_skip_committed_records() {
        let keep = record(&Consumer::new(|| {}), Urgency::Urgent, SubscriptionFlags::RESYNC);
        let suspended = record(
            &Consumer::new(|| {}),
            Urgency::Urgent,
            SubscriptionFlags::SUSPENDING,
        );
        let committed = record(
            &Consumer::new(|| {}),
            Urgency::Urgent,
            SubscriptionFlags::SUSPENDING | SubscriptionFlags::COMMITTED,
        );
        let other_class = record(
            &Consumer::new(|| {}),
            Urgency::Deferred,
            SubscriptionFlags::SUSPENDING,
        );

        let mut subscribers = Subscribers::default();
        for r in [&keep, &suspended, &committed, &other_class] {
            subscribers.insert(r.clone());
        }

        let stale = subscribers.stale_suspenders(&keep);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].version(), suspended.version());
    }

    #[test]
    fn test_detached_record_is_inert() {
        let consumer = Consumer::new(|| panic!("a detached record never re-renders"));
        let record = record(&consumer, Urgency::Urgent, SubscriptionFlags::empty());
        assert!(!record.commit());
        assert!(!record.cleanup());
        assert!(!record.is_registered());
        assert!(!record.is_committed());
    }
}
