//! Owner-keyed publish/subscribe fan-out.
//!
//! A [`SubscriberBus`] delivers every published event to every subscriber
//! registered at the moment the event is dispatched, in publish order.
//! Callbacks run synchronously on the publishing thread with no lock held,
//! so a callback may publish, subscribe or unsubscribe on the same bus.
//!
//! A publish issued while the bus is already dispatching (from a callback,
//! or concurrently from another thread) is queued and delivered by the
//! dispatcher that is already running, after the current event reaches all
//! of its subscribers. Two events are therefore never interleaved at any
//! single subscriber.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::debug;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Identifies one subscription on one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription<E> {
    id: SubscriptionId,
    owner: String,
    callback: Callback<E>,
    active: Arc<AtomicBool>,
}

// Derive would require `E: Clone`.
impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            owner: self.owner.clone(),
            callback: self.callback.clone(),
            active: self.active.clone(),
        }
    }
}

struct BusState<E> {
    subscriptions: Vec<Subscription<E>>,
    pending: VecDeque<E>,
    dispatching: bool,
}

struct BusInner<E> {
    state: StdMutex<BusState<E>>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle to a shared subscriber list.
pub struct SubscriberBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for SubscriberBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for SubscriberBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for SubscriberBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Resets the dispatching flag if a callback unwinds, so the bus stays usable.
struct DispatchGuard<'a, E> {
    bus: &'a SubscriberBus<E>,
    armed: bool,
}

impl<E> Drop for DispatchGuard<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.bus.lock();
            state.dispatching = false;
            state.pending.clear();
        }
    }
}

impl<E> SubscriberBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: StdMutex::new(BusState {
                    subscriptions: Vec::new(),
                    pending: VecDeque::new(),
                    dispatching: false,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState<E>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `callback` under `owner`. One owner may hold several
    /// subscriptions; [`unsubscribe`](Self::unsubscribe) removes all of them.
    pub fn subscribe<F>(&self, owner: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let owner = owner.into();
        debug!("[bus] Subscribed {} ({:?})", owner, id);
        self.lock().subscriptions.push(Subscription {
            id,
            owner,
            callback: Arc::new(callback),
            active: Arc::new(AtomicBool::new(true)),
        });
        id
    }

    /// Remove every subscription held by `owner`. Returns how many were removed.
    ///
    /// A removed subscription receives no further events, including ones
    /// from a dispatch already in progress.
    pub fn unsubscribe(&self, owner: &str) -> usize {
        let mut state = self.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| {
            if sub.owner == owner {
                sub.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        before - state.subscriptions.len()
    }

    /// Remove a single subscription.
    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        match state.subscriptions.iter().position(|sub| sub.id == id) {
            Some(index) => {
                let sub = state.subscriptions.remove(index);
                sub.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Drop all subscriptions.
    pub fn clear(&self) {
        let mut state = self.lock();
        for sub in state.subscriptions.drain(..) {
            sub.active.store(false, Ordering::Release);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Deliver `event` to all current subscribers.
    ///
    /// The subscriber list is snapshotted per event: a subscription added
    /// during dispatch sees only later events.
    pub fn publish(&self, event: E) {
        {
            let mut state = self.lock();
            state.pending.push_back(event);
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        let mut guard = DispatchGuard {
            bus: self,
            armed: true,
        };

        loop {
            let (event, targets) = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(event) => (event, state.subscriptions.clone()),
                    None => {
                        state.dispatching = false;
                        guard.armed = false;
                        return;
                    }
                }
            };

            for sub in &targets {
                if sub.active.load(Ordering::Acquire) {
                    (sub.callback)(&event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&str, &u32) + Clone) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |who: &str, n: &u32| {
            sink.lock().unwrap().push(format!("{}:{}", who, n))
        })
    }

    #[test]
    fn test_publish_reaches_every_subscriber_in_order() {
        let bus = SubscriberBus::<u32>::new();
        let (log, record) = recorder();

        let r = record.clone();
        bus.subscribe("a", move |n| r("a", n));
        let r = record.clone();
        bus.subscribe("b", move |n| r("b", n));

        bus.publish(1);
        bus.publish(2);

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn test_interleaved_publishes_arrive_in_publish_order() {
        let bus = SubscriberBus::<u32>::new();
        let (log, record) = recorder();

        let echo = bus.clone();
        bus.subscribe("echo", move |n| {
            if *n == 1 {
                echo.publish(10);
            }
        });
        let relay = bus.clone();
        bus.subscribe("relay", move |n| {
            if *n == 1 {
                relay.publish(20);
            }
        });
        let r = record.clone();
        bus.subscribe("log", move |n| r("log", n));

        bus.publish(1);
        bus.publish(3);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["log:1", "log:10", "log:20", "log:3"]
        );
    }

    #[test]
    fn test_reentrant_publish_is_delivered_after_current_event() {
        let bus = SubscriberBus::<u32>::new();
        let (log, record) = recorder();

        let inner = bus.clone();
        let r = record.clone();
        bus.subscribe("echo", move |n| {
            r("echo", n);
            if *n == 1 {
                inner.publish(2);
            }
        });
        let r = record.clone();
        bus.subscribe("tail", move |n| r("tail", n));

        bus.publish(1);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["echo:1", "tail:1", "echo:2", "tail:2"]
        );
    }

    #[test]
    fn test_subscribe_during_dispatch_sees_only_later_events() {
        let bus = SubscriberBus::<u32>::new();
        let (log, record) = recorder();

        let inner = bus.clone();
        let r = record.clone();
        bus.subscribe("joiner", move |n| {
            if *n == 1 {
                let r = r.clone();
                inner.subscribe("late", move |n| r("late", n));
            }
        });

        bus.publish(1);
        bus.publish(2);

        assert_eq!(*log.lock().unwrap(), vec!["late:2"]);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_skips_removed() {
        let bus = SubscriberBus::<u32>::new();
        let (log, record) = recorder();

        let inner = bus.clone();
        bus.subscribe("first", move |_| {
            inner.unsubscribe("second");
        });
        let r = record.clone();
        bus.subscribe("second", move |n| r("second", n));

        bus.publish(1);

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_by_owner_removes_all() {
        let bus = SubscriberBus::<u32>::new();
        bus.subscribe("child", |_| {});
        bus.subscribe("child", |_| {});
        let keep = bus.subscribe("other", |_| {});

        assert_eq!(bus.unsubscribe("child"), 2);
        assert_eq!(bus.unsubscribe("child"), 0);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe_id(keep));
        assert!(!bus.unsubscribe_id(keep));
    }

    #[test]
    fn test_bus_survives_panicking_subscriber() {
        let bus = SubscriberBus::<u32>::new();
        let (log, record) = recorder();
        bus.subscribe("bad", |n| {
            if *n == 1 {
                panic!("boom");
            }
        });
        let r = record.clone();
        bus.subscribe("good", move |n| r("good", n));

        let publisher = bus.clone();
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| publisher.publish(1)));
        assert!(result.is_err());

        bus.publish(2);
        assert_eq!(*log.lock().unwrap(), vec!["good:2"]);
    }
}
