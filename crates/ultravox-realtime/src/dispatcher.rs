//! Ordered, failure-isolating publish/subscribe registry.
//!
//! Handlers for one event name run in registration order, synchronously in
//! the publishing context. A publish that happens while a dispatch is already
//! running (for example from inside a handler) is queued and delivered once the
//! current dispatch finishes, so no handler ever runs re-entrantly.

use crate::{error::panic_message, events::EventName};
use std::{
    collections::{HashMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::warn;

/// Default bound on publishes deferred during a dispatch.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A subscriber callback. Returning an error (or panicking) is reported but
/// never stops delivery to the remaining handlers.
pub type Handler<P> = Arc<dyn Fn(&P) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch queue is full ({capacity} pending); dropped `{event}`")]
    QueueFull { event: String, capacity: usize },
}

/// A handler that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub event: EventName,
    pub subscription: SubscriptionId,
    pub message: String,
}

/// Outcome of one `publish` call, including any deferred publishes it drained.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handler invocations that returned `Ok`.
    pub delivered: usize,
    /// True when the publish was queued behind a running dispatch.
    pub deferred: bool,
    pub failures: Vec<HandlerFailure>,
}

struct Subscriber<P> {
    id: SubscriptionId,
    handler: Handler<P>,
}

impl<P> Clone for Subscriber<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Reserved names get a fixed slot; everything else lives in `other`.
struct Subscribers<P> {
    state: Vec<Subscriber<P>>,
    output: Vec<Subscriber<P>>,
    transcript: Vec<Subscriber<P>>,
    tool_call: Vec<Subscriber<P>>,
    error: Vec<Subscriber<P>>,
    other: HashMap<String, Vec<Subscriber<P>>>,
}

impl<P> Default for Subscribers<P> {
    fn default() -> Self {
        Self {
            state: Vec::new(),
            output: Vec::new(),
            transcript: Vec::new(),
            tool_call: Vec::new(),
            error: Vec::new(),
            other: HashMap::new(),
        }
    }
}

impl<P> Subscribers<P> {
    fn slot(&self, name: &EventName) -> Option<&Vec<Subscriber<P>>> {
        match name {
            EventName::State => Some(&self.state),
            EventName::Output => Some(&self.output),
            EventName::Transcript => Some(&self.transcript),
            EventName::ToolCall => Some(&self.tool_call),
            EventName::Error => Some(&self.error),
            EventName::Other(name) => self.other.get(name),
        }
    }

    fn slot_mut(&mut self, name: EventName) -> &mut Vec<Subscriber<P>> {
        match name {
            EventName::State => &mut self.state,
            EventName::Output => &mut self.output,
            EventName::Transcript => &mut self.transcript,
            EventName::ToolCall => &mut self.tool_call,
            EventName::Error => &mut self.error,
            EventName::Other(name) => self.other.entry(name).or_default(),
        }
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for slot in [
            &mut self.state,
            &mut self.output,
            &mut self.transcript,
            &mut self.tool_call,
            &mut self.error,
        ]
        .into_iter()
        .chain(self.other.values_mut())
        {
            let before = slot.len();
            slot.retain(|subscriber| subscriber.id != id);
            removed |= slot.len() != before;
        }
        self.other.retain(|_, slot| !slot.is_empty());
        removed
    }
}

struct Inner<P> {
    subscribers: Subscribers<P>,
    next_id: u64,
    pending: VecDeque<(EventName, P)>,
    dispatching: bool,
}

/// Typed event registry keyed by [`EventName`].
pub struct EventDispatcher<P> {
    inner: Mutex<Inner<P>>,
    capacity: usize,
}

impl<P> Default for EventDispatcher<P> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl<P> EventDispatcher<P> {
    /// Creates a dispatcher that defers at most `capacity` re-entrant publishes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Subscribers::default(),
                next_id: 0,
                pending: VecDeque::new(),
                dispatching: false,
            }),
            capacity,
        }
    }

    // Handlers never run under the lock, so a poisoned mutex still holds
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, name: impl Into<EventName>, handler: F) -> SubscriptionId
    where
        F: Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.slot_mut(name.into()).push(Subscriber {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Registers a handler under an id allocated by the caller.
    pub(crate) fn insert(&self, id: SubscriptionId, name: EventName, handler: Handler<P>) {
        self.lock()
            .subscribers
            .slot_mut(name)
            .push(Subscriber { id, handler });
    }

    /// Removes a subscription. Returns `false` if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.remove(id)
    }

    pub fn handler_count(&self, name: &EventName) -> usize {
        self.lock().subscribers.slot(name).map_or(0, Vec::len)
    }

    /// Delivers `payload` to every handler registered under `name`.
    ///
    /// Publishing a name nobody subscribed to is not an error.
    pub fn publish(
        &self,
        name: impl Into<EventName>,
        payload: P,
    ) -> Result<DispatchReport, DispatchError> {
        let name = name.into();
        {
            let mut inner = self.lock();
            if inner.dispatching {
                if inner.pending.len() >= self.capacity {
                    warn!(event = %name, capacity = self.capacity, "Dispatch queue full, dropping event");
                    return Err(DispatchError::QueueFull {
                        event: name.to_string(),
                        capacity: self.capacity,
                    });
                }
                inner.pending.push_back((name, payload));
                return Ok(DispatchReport {
                    deferred: true,
                    ..DispatchReport::default()
                });
            }
            inner.dispatching = true;
        }

        let mut report = DispatchReport::default();
        let mut next = Some((name, payload));
        while let Some((name, payload)) = next.take() {
            let subscribers = self
                .lock()
                .subscribers
                .slot(&name)
                .cloned()
                .unwrap_or_default();

            for subscriber in subscribers {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(&payload)));
                let message = match outcome {
                    Ok(Ok(())) => {
                        report.delivered += 1;
                        continue;
                    }
                    Ok(Err(err)) => format!("{err:#}"),
                    Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
                };
                warn!(event = %name, subscription = ?subscriber.id, error = %message, "Event handler failed");
                report.failures.push(HandlerFailure {
                    event: name.clone(),
                    subscription: subscriber.id,
                    message,
                });
            }

            let mut inner = self.lock();
            next = inner.pending.pop_front();
            if next.is_none() {
                inner.dispatching = false;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Weak;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::<String>::default();
        let log = recorder();

        let first = log.clone();
        dispatcher.subscribe("state", move |p: &String| {
            first.lock().unwrap().push(format!("h1:{p}"));
            Ok(())
        });
        let second = log.clone();
        dispatcher.subscribe("state", move |p: &String| {
            second.lock().unwrap().push(format!("h2:{p}"));
            Ok(())
        });

        let report = dispatcher.publish("state", "idle".to_string()).unwrap();
        assert_eq!(report.delivered, 2);
        assert!(report.failures.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["h1:idle", "h2:idle"]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_the_rest() {
        let dispatcher = EventDispatcher::<String>::default();
        let log = recorder();

        let failing = dispatcher.subscribe("state", |_: &String| Err(anyhow!("h1 broke")));
        dispatcher.subscribe("state", |_: &String| -> anyhow::Result<()> {
            panic!("h2 panicked")
        });
        let last = log.clone();
        dispatcher.subscribe("state", move |p: &String| {
            last.lock().unwrap().push(p.clone());
            Ok(())
        });

        let report = dispatcher.publish(EventName::State, "speaking".to_string()).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].subscription, failing);
        assert_eq!(report.failures[0].message, "h1 broke");
        assert!(report.failures[1].message.contains("h2 panicked"));
        assert_eq!(*log.lock().unwrap(), vec!["speaking"]);
    }

    #[test]
    fn test_unknown_names_are_accepted() {
        let dispatcher = EventDispatcher::<u32>::default();
        dispatcher.subscribe("not-yet-invented", |_: &u32| Ok(()));
        assert_eq!(
            dispatcher.handler_count(&EventName::from("not-yet-invented")),
            1
        );

        let report = dispatcher.publish("nobody-listens", 1).unwrap();
        assert_eq!(report.delivered, 0);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::<u32>::default();
        let log = recorder();
        let sink = log.clone();
        let id = dispatcher.subscribe("custom", move |n: &u32| {
            sink.lock().unwrap().push(n.to_string());
            Ok(())
        });

        dispatcher.publish("custom", 1).unwrap();
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.publish("custom", 2).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["1"]);
        assert_eq!(dispatcher.handler_count(&EventName::from("custom")), 0);
    }

    #[test]
    fn test_reentrant_publish_is_deferred_in_fifo_order() {
        let dispatcher = Arc::new(EventDispatcher::<String>::default());
        let log = recorder();

        let weak: Weak<EventDispatcher<String>> = Arc::downgrade(&dispatcher);
        let state_log = log.clone();
        dispatcher.subscribe("state", move |p: &String| {
            state_log.lock().unwrap().push(format!("state:{p}:begin"));
            if let Some(dispatcher) = weak.upgrade() {
                let first = dispatcher.publish("output", "a".to_string())?;
                let second = dispatcher.publish("output", "b".to_string())?;
                assert!(first.deferred && second.deferred);
            }
            state_log.lock().unwrap().push(format!("state:{p}:end"));
            Ok(())
        });
        let output_log = log.clone();
        dispatcher.subscribe("output", move |p: &String| {
            output_log.lock().unwrap().push(format!("output:{p}"));
            Ok(())
        });

        let report = dispatcher.publish("state", "thinking".to_string()).unwrap();
        assert!(!report.deferred);
        assert_eq!(report.delivered, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "state:thinking:begin",
                "state:thinking:end",
                "output:a",
                "output:b"
            ]
        );
    }

    #[test]
    fn test_full_queue_rejects_reentrant_publish() {
        let dispatcher = Arc::new(EventDispatcher::<u32>::new(1));
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&dispatcher);
        let results = outcomes.clone();
        dispatcher.subscribe("state", move |_: &u32| {
            if let Some(dispatcher) = weak.upgrade() {
                let mut results = results.lock().unwrap();
                results.push(dispatcher.publish("output", 1).is_ok());
                results.push(dispatcher.publish("output", 2).is_ok());
            }
            Ok(())
        });

        dispatcher.publish("state", 0).unwrap();
        assert_eq!(*outcomes.lock().unwrap(), vec![true, false]);

        // The dispatcher is usable again after the overflow.
        let report = dispatcher.publish("state", 0).unwrap();
        assert!(!report.deferred);
    }
}
