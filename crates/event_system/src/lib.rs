//! # Meridian Event System
//!
//! Typed, synchronous event fan-out for the Meridian transport layer.
//!
//! Connection receive loops produce a stream of occurrences — loop start/stop
//! markers, decoded packets, recoverable decode failures — and hand each one to
//! an [`Emitter`]. Subscribers register a handler for a concrete event *type*;
//! firing an event invokes every current subscriber for that type on the firing
//! task, in registration order.
//!
//! ## Key Components
//!
//! - [`Emitter`] - Registration and dispatch hub
//! - [`HandlerId`] - Token returned by [`Emitter::on`]/[`Emitter::once`], used
//!   to unsubscribe
//! - [`EmitterStats`] - Usage counters for monitoring
//!
//! ## Dispatch Model
//!
//! Dispatch is synchronous: [`Emitter::fire`] returns after every handler has
//! run. Handlers therefore must not block for long. Handler failures are
//! isolated — a handler returning an error is logged and does not prevent the
//! remaining handlers from running.
//!
//! The emitter is fully thread-safe; handlers may subscribe or unsubscribe
//! concurrently with a fire in progress (including from within a handler).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during event handler execution.
#[derive(Debug, Error)]
pub enum EventError {
    /// A handler rejected or failed to process the event.
    #[error("handler execution failed: {0}")]
    HandlerExecution(String),
}

/// Identifies a single subscription on an [`Emitter`].
///
/// Returned by [`Emitter::on`] and [`Emitter::once`]; pass it to
/// [`Emitter::off`] to remove the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    event_type: TypeId,
    seq: u64,
}

/// Type-erased handler invocation. The concrete event type is recovered by
/// downcast inside the typed wrapper.
trait ErasedHandler: Send + Sync {
    fn call(&self, event: &(dyn Any + Send + Sync)) -> Result<(), EventError>;
}

struct TypedHandler<T, F> {
    handler: F,
    _event: PhantomData<fn(&T)>,
}

impl<T, F> ErasedHandler for TypedHandler<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<(), EventError> + Send + Sync,
{
    fn call(&self, event: &(dyn Any + Send + Sync)) -> Result<(), EventError> {
        match event.downcast_ref::<T>() {
            Some(event) => (self.handler)(event),
            // Registrations are keyed by TypeId, so the downcast cannot miss.
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct Registration {
    seq: u64,
    once: bool,
    /// Set on first dispatch of a `once` registration so that concurrent
    /// fires cannot run it twice.
    spent: Arc<AtomicBool>,
    handler: Arc<dyn ErasedHandler>,
}

/// Snapshot of emitter usage counters.
///
/// Both counters are monotonic totals since the emitter was created;
/// unsubscribing does not decrement `handlers_registered`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmitterStats {
    /// Total number of events fired
    pub events_fired: u64,
    /// Total number of handlers ever registered
    pub handlers_registered: u64,
}

/// The event registration and dispatch hub.
///
/// Handlers are keyed by the concrete type of the event they accept, so a
/// subscriber only ever sees events of the type it asked for.
///
/// # Thread Safety
///
/// All operations are safe to call from any number of threads. The handler
/// registry is never locked while handlers run, so a handler may call
/// [`Emitter::on`], [`Emitter::off`], or even [`Emitter::fire`] without
/// deadlocking.
///
/// # Examples
///
/// ```rust
/// use event_system::Emitter;
///
/// let events = Emitter::new();
///
/// events.on(|greeting: &String| {
///     println!("received: {greeting}");
///     Ok(())
/// });
///
/// events.fire(&"hello".to_string());
/// ```
#[derive(Default)]
pub struct Emitter {
    /// Registered handlers, keyed by event type
    handlers: DashMap<TypeId, Vec<Registration>>,
    /// Source of subscription sequence numbers
    next_seq: AtomicU64,
    /// Total events fired
    events_fired: AtomicU64,
    /// Total handlers registered
    handlers_registered: AtomicU64,
}

impl Emitter {
    /// Creates a new emitter with no subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to every fired event of type `T`.
    ///
    /// Handlers for the same event type run in registration order on the
    /// firing task.
    ///
    /// # Returns
    ///
    /// A [`HandlerId`] that can be passed to [`Emitter::off`] to unsubscribe.
    pub fn on<T, F>(&self, handler: F) -> HandlerId
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register(false, handler)
    }

    /// Subscribes `handler` to the next fired event of type `T` only.
    ///
    /// The handler runs at most once, even when events are fired concurrently
    /// from multiple threads, and is removed after its first dispatch.
    pub fn once<T, F>(&self, handler: F) -> HandlerId
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register(true, handler)
    }

    /// Removes a subscription.
    ///
    /// Returns `true` if the subscription was still present. Removing a
    /// handler while a fire is in progress is safe; the in-progress fire may
    /// still deliver one final event to it.
    pub fn off(&self, id: HandlerId) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&id.event_type) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|registration| registration.seq != id.seq);
        before != entry.len()
    }

    /// Fires `event` to every current subscriber for `T`, synchronously, in
    /// registration order.
    ///
    /// Firing with no subscribers is a no-op. A failing handler is logged and
    /// skipped; the remaining handlers still run.
    pub fn fire<T: Send + Sync + 'static>(&self, event: &T) {
        self.events_fired.fetch_add(1, Ordering::Relaxed);

        // Snapshot the registration list and release the map before invoking
        // anything, so handlers can freely touch the emitter.
        let snapshot: Vec<Registration> = match self.handlers.get(&TypeId::of::<T>()) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        let mut spent = Vec::new();
        for registration in &snapshot {
            if registration.once {
                if registration.spent.swap(true, Ordering::AcqRel) {
                    continue;
                }
                spent.push(registration.seq);
            }
            if let Err(err) = registration.handler.call(event) {
                warn!(
                    event_type = std::any::type_name::<T>(),
                    "event handler failed: {err}"
                );
            }
        }

        if !spent.is_empty() {
            if let Some(mut entry) = self.handlers.get_mut(&TypeId::of::<T>()) {
                entry.retain(|registration| !spent.contains(&registration.seq));
            }
        }
    }

    /// Number of live subscriptions for event type `T`.
    pub fn handler_count<T: Send + Sync + 'static>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<T>())
            .map_or(0, |entry| entry.len())
    }

    /// Returns a snapshot of the usage counters.
    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            events_fired: self.events_fired.load(Ordering::Relaxed),
            handlers_registered: self.handlers_registered.load(Ordering::Relaxed),
        }
    }

    fn register<T, F>(&self, once: bool, handler: F) -> HandlerId
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let event_type = TypeId::of::<T>();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            seq,
            once,
            spent: Arc::new(AtomicBool::new(false)),
            handler: Arc::new(TypedHandler::<T, F> {
                handler,
                _event: PhantomData,
            }),
        };

        self.handlers.entry(event_type).or_default().push(registration);
        self.handlers_registered.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_type = std::any::type_name::<T>(),
            once, "event handler registered"
        );

        HandlerId { event_type, seq }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("event_types", &self.handlers.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    #[derive(Debug, PartialEq)]
    struct Pong(u32);

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&Ping) -> Result<(), EventError>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |event: &Ping| {
            sink.lock().unwrap().push(event.0);
            Ok(())
        })
    }

    #[test]
    fn dispatch_is_typed() {
        let events = Emitter::new();
        let (pings, on_ping) = recorder();
        events.on(on_ping);

        events.fire(&Ping(1));
        events.fire(&Pong(2));
        events.fire(&Ping(3));

        assert_eq!(*pings.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn fire_without_subscribers_is_noop() {
        let events = Emitter::new();
        events.fire(&Ping(7));
        assert_eq!(events.stats().events_fired, 1);
    }

    #[test]
    fn once_runs_at_most_once() {
        let events = Emitter::new();
        let (pings, on_ping) = recorder();
        events.once(on_ping);

        events.fire(&Ping(1));
        events.fire(&Ping(2));

        assert_eq!(*pings.lock().unwrap(), vec![1]);
        assert_eq!(events.handler_count::<Ping>(), 0);
    }

    #[test]
    fn off_removes_subscription() {
        let events = Emitter::new();
        let (pings, on_ping) = recorder();
        let id = events.on(on_ping);

        events.fire(&Ping(1));
        assert!(events.off(id));
        assert!(!events.off(id));
        events.fire(&Ping(2));

        assert_eq!(*pings.lock().unwrap(), vec![1]);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let events = Emitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4u32 {
            let sink = log.clone();
            events.on(move |_: &Ping| {
                sink.lock().unwrap().push(tag);
                Ok(())
            });
        }

        events.fire(&Ping(0));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn failing_handler_does_not_stop_dispatch() {
        let events = Emitter::new();
        events.on(|_: &Ping| Err(EventError::HandlerExecution("nope".into())));
        let (pings, on_ping) = recorder();
        events.on(on_ping);

        events.fire(&Ping(9));
        assert_eq!(*pings.lock().unwrap(), vec![9]);
    }

    #[test]
    fn subscribing_during_fire_does_not_deadlock() {
        let events = Arc::new(Emitter::new());
        let inner = events.clone();
        let pings = Arc::new(Mutex::new(Vec::new()));
        let sink = pings.clone();
        events.on(move |_: &Ping| {
            let sink = sink.clone();
            inner.on(move |event: &Ping| {
                sink.lock().unwrap().push(event.0);
                Ok(())
            });
            Ok(())
        });

        events.fire(&Ping(1));
        // The handler registered during the fire sees the next event only.
        events.fire(&Ping(2));

        assert!(pings.lock().unwrap().contains(&2));
    }

    #[test]
    fn stats_track_registrations_and_fires() {
        let events = Emitter::new();
        events.on(|_: &Ping| Ok(()));
        events.once(|_: &Pong| Ok(()));
        events.fire(&Ping(0));
        events.fire(&Ping(0));

        let stats = events.stats();
        assert_eq!(stats.handlers_registered, 2);
        assert_eq!(stats.events_fired, 2);
    }
}
