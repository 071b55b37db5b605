//! Subscriber fan-out for committed events (mechanics only).
//!
//! The store appends first and notifies afterwards, so this registry is for
//! distribution, not storage: the log stays the source of truth and any
//! consumer can catch up by replaying it.
//!
//! Delivery rules:
//!
//! - subscribers are notified in registration order
//! - a synchronous subscriber runs inline on the appending task; a panic or an
//!   error is caught and logged, never propagated to the appender or to the
//!   remaining subscribers
//! - an asynchronous subscriber is spawned on the current tokio runtime and
//!   never awaited; its failure is logged from inside the spawned task

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::envelope::EventEnvelope;

/// Error a subscriber may return; logged, never propagated.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

pub type SubscriberResult = Result<(), SubscriberError>;

type BoxFuture = Pin<Box<dyn Future<Output = SubscriberResult> + Send>>;

type SyncCallback = dyn Fn(&EventEnvelope) -> SubscriberResult + Send + Sync;
type AsyncCallback = dyn Fn(EventEnvelope) -> BoxFuture + Send + Sync;

#[derive(Clone)]
enum Subscriber {
    Sync(Arc<SyncCallback>),
    Async(Arc<AsyncCallback>),
}

type Entries = RwLock<Vec<(u64, Subscriber)>>;

/// Ordered set of event listeners.
pub struct SubscriberRegistry {
    entries: Arc<Entries>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous listener fired for every future event.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&EventEnvelope) -> SubscriberResult + Send + Sync + 'static,
    {
        self.insert(Subscriber::Sync(Arc::new(callback)))
    }

    /// Register an asynchronous listener, spawned per event.
    pub fn subscribe_async<F, Fut>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubscriberResult> + Send + 'static,
    {
        let boxed = move |envelope: EventEnvelope| -> BoxFuture { Box::pin(callback(envelope)) };
        self.insert(Subscriber::Async(Arc::new(boxed)))
    }

    fn insert(&self, subscriber: Subscriber) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.entries.write() {
            Ok(mut entries) => entries.push((id, subscriber)),
            Err(poisoned) => poisoned.into_inner().push((id, subscriber)),
        }
        SubscriptionHandle {
            id,
            entries: Arc::downgrade(&self.entries),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one committed event to every subscriber.
    pub fn notify(&self, envelope: &EventEnvelope) {
        // Copy the list out so callbacks may (un)subscribe without deadlocking.
        let subscribers: Vec<(u64, Subscriber)> = match self.entries.read() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for (id, subscriber) in subscribers {
            match subscriber {
                Subscriber::Sync(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => tracing::warn!(
                            subscriber = id,
                            position = envelope.position(),
                            event_type = %envelope.event_type(),
                            error = %error,
                            "event subscriber failed"
                        ),
                        Err(_) => tracing::warn!(
                            subscriber = id,
                            position = envelope.position(),
                            event_type = %envelope.event_type(),
                            "event subscriber panicked"
                        ),
                    }
                }
                Subscriber::Async(callback) => {
                    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                        tracing::warn!(
                            subscriber = id,
                            position = envelope.position(),
                            "no tokio runtime; async subscriber skipped"
                        );
                        continue;
                    };
                    let position = envelope.position();
                    let future = match catch_unwind(AssertUnwindSafe(|| callback(envelope.clone()))) {
                        Ok(future) => future,
                        Err(_) => {
                            tracing::warn!(subscriber = id, position, "event subscriber panicked");
                            continue;
                        }
                    };
                    runtime.spawn(async move {
                        if let Err(error) = future.await {
                            tracing::warn!(
                                subscriber = id,
                                position,
                                error = %error,
                                "async event subscriber failed"
                            );
                        }
                    });
                }
            }
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl core::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Returned by `subscribe`; call `unsubscribe` to stop receiving events.
///
/// Dropping the handle keeps the subscription alive.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    entries: Weak<Entries>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(entries) = self.entries.upgrade() else {
            return false;
        };
        let mut entries = match entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != self.id);
        entries.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DomainEvent, EventPayload};
    use scenelog_core::AggregateId;
    use std::sync::Mutex;

    fn envelope(position: u64) -> EventEnvelope {
        let event = DomainEvent::new(
            AggregateId::system(),
            EventPayload::SystemDisconnected { reason: None },
        );
        EventEnvelope::new(position, position, event)
    }

    #[test]
    fn notifies_in_registration_order() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            registry.subscribe(move |_| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }
        registry.notify(&envelope(1));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn panicking_or_failing_subscriber_does_not_stop_siblings() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(0));
        registry.subscribe(|_| panic!("boom"));
        registry.subscribe(|_| Err("nope".into()));
        let counter = seen.clone();
        registry.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        registry.notify(&envelope(1));
        registry.notify(&envelope(2));
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let handle = registry.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        registry.notify(&envelope(1));
        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        registry.notify(&envelope(2));
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn async_subscribers_are_spawned() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.subscribe_async(move |env| {
            let tx = tx.clone();
            async move {
                tx.send(env.position())?;
                Ok::<(), SubscriberError>(())
            }
        });
        registry.notify(&envelope(7));
        assert_eq!(rx.recv().await, Some(7));
    }
}
