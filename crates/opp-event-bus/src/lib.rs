//! Event bus for Open Peer Power
//!
//! This crate provides the EventBus, the central message broker. Listeners
//! are jobs registered per event type (or for every event via `*`), run in
//! registration order through the job scheduler. Specific listeners run
//! before wildcard listeners. A failing listener never affects the others
//! or the code that fired the event.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opp_core::events::OPENPEERPOWER_CLOSE;
use opp_core::{Context, Event, EventData, EventOrigin, EventType};
use opp_scheduler::{panic_message, HandlerResult, Job, SharedScheduler};
use tracing::{debug, error, trace, warn};

/// Event shared between every listener of one fire
pub type EventRef = Arc<Event>;

/// A listener job
pub type EventListener = Job<EventRef, HandlerResult>;

/// Predicate deciding whether a listener sees an event
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A unique identifier for an event listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    event_type: EventType,
    job: EventListener,
    filter: Option<EventFilter>,
    /// Set for run-once listeners; flips to true on first delivery
    fired: Option<AtomicBool>,
}

type ListenerTable = DashMap<EventType, Vec<Arc<Listener>>>;

/// Handle returned by the `listen*` methods
///
/// Dropping the handle keeps the listener registered.
pub struct Unsubscribe {
    table: Weak<ListenerTable>,
    event_type: EventType,
    id: ListenerId,
}

impl Unsubscribe {
    /// Remove the listener; returns false when it was already gone
    pub fn unsubscribe(self) -> bool {
        match self.table.upgrade() {
            Some(table) => remove_listener(&table, &self.event_type, self.id),
            None => false,
        }
    }

    pub fn listener_id(&self) -> ListenerId {
        self.id
    }
}

fn remove_listener(table: &ListenerTable, event_type: &EventType, id: ListenerId) -> bool {
    let removed = match table.get_mut(event_type) {
        Some(mut listeners) => {
            let before = listeners.len();
            listeners.retain(|l| l.id != id);
            before != listeners.len()
        }
        None => false,
    };
    table.remove_if(event_type, |_, listeners| listeners.is_empty());

    if !removed {
        warn!(event_type = %event_type, "Unable to remove unknown job listener");
    }
    removed
}

/// The event bus for publishing and subscribing to events
pub struct EventBus {
    listeners: Arc<ListenerTable>,
    scheduler: SharedScheduler,
    next_listener_id: AtomicU64,
}

impl EventBus {
    /// Create a new event bus dispatching through the given scheduler
    pub fn new(scheduler: SharedScheduler) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            scheduler,
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    fn add_listener(
        &self,
        event_type: EventType,
        job: EventListener,
        filter: Option<EventFilter>,
        once: bool,
    ) -> Unsubscribe {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        trace!(event_type = %event_type, job = %job.name(), "Adding listener");

        let listener = Arc::new(Listener {
            id,
            event_type: event_type.clone(),
            job,
            filter,
            fired: once.then(|| AtomicBool::new(false)),
        });
        self.listeners
            .entry(event_type.clone())
            .or_default()
            .push(listener);

        Unsubscribe {
            table: Arc::downgrade(&self.listeners),
            event_type,
            id,
        }
    }

    /// Listen for events of one type, or all events with `*`
    pub fn listen(&self, event_type: impl Into<EventType>, listener: EventListener) -> Unsubscribe {
        self.add_listener(event_type.into(), listener, None, false)
    }

    /// Listen for events accepted by `filter`
    ///
    /// The filter runs synchronously while firing; rejected events never
    /// reach the scheduler.
    pub fn listen_filtered<F>(
        &self,
        event_type: impl Into<EventType>,
        listener: EventListener,
        filter: F,
    ) -> Unsubscribe
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.add_listener(event_type.into(), listener, Some(Arc::new(filter)), false)
    }

    /// Listen for the next event of a type only
    pub fn listen_once(
        &self,
        event_type: impl Into<EventType>,
        listener: EventListener,
    ) -> Unsubscribe {
        self.add_listener(event_type.into(), listener, None, true)
    }

    /// Fire an event to all matching listeners
    ///
    /// Listeners of the exact type run first, then wildcard listeners.
    /// `openpeerpower_close` is not delivered to wildcard listeners.
    pub fn fire(&self, event: Event) -> EventRef {
        let event = Arc::new(event);

        let mut targets: Vec<Arc<Listener>> = self
            .listeners
            .get(event.event_type())
            .map(|listeners| listeners.clone())
            .unwrap_or_default();
        if event.event_type() != OPENPEERPOWER_CLOSE {
            if let Some(all) = self.listeners.get(&EventType::match_all()) {
                targets.extend(all.iter().cloned());
            }
        }

        debug!(event_type = %event.event_type(), listeners = targets.len(), "Bus: firing event");

        for listener in targets {
            if let Some(filter) = &listener.filter {
                match catch_unwind(AssertUnwindSafe(|| filter(&event))) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(payload) => {
                        error!(
                            event_type = %event.event_type(),
                            "Event filter panicked: {}",
                            panic_message(payload)
                        );
                        continue;
                    }
                }
            }

            if let Some(fired) = &listener.fired {
                if fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                remove_listener(&self.listeners, &listener.event_type, listener.id);
            }

            self.scheduler
                .run_detached(&listener.job, event.clone(), event.event_type().as_str());
        }

        event
    }

    /// Build and fire an event
    pub fn fire_data(
        &self,
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        context: Context,
    ) -> EventRef {
        self.fire(Event::new(event_type, data, context))
    }

    /// Build and fire an event with every field given
    pub fn fire_with(
        &self,
        event_type: impl Into<EventType>,
        data: Option<serde_json::Value>,
        origin: EventOrigin,
        context: Option<Context>,
        time_fired: Option<DateTime<Utc>>,
    ) -> EventRef {
        let data = data.unwrap_or_else(|| serde_json::json!({}));
        let mut event =
            Event::new(event_type, data, context.unwrap_or_default()).with_origin(origin);
        if let Some(time_fired) = time_fired {
            event = event.with_time_fired(time_fired);
        }
        self.fire(event)
    }

    /// Fire a typed event
    pub fn fire_typed<T>(&self, data: T, context: Context) -> EventRef
    where
        T: EventData + serde::Serialize,
    {
        let json_data = serde_json::to_value(&data).unwrap_or_default();
        self.fire(Event::new(T::event_type(), json_data, context))
    }

    /// Number of listeners per event type
    pub fn listeners(&self) -> HashMap<String, usize> {
        self.listeners
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().len()))
            .collect()
    }

    /// Total number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use opp_core::events::{StateChangedData, OPENPEERPOWER_STOP};
    use opp_core::{Attributes, EntityId, State};
    use opp_scheduler::JobScheduler;
    use serde_json::json;
    use std::sync::Mutex;

    fn make_bus() -> EventBus {
        EventBus::new(Arc::new(JobScheduler::current()))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventListener {
        let log = log.clone();
        Job::callback(move |event: EventRef| {
            log.lock().unwrap().push(format!("{tag}:{}", event.event_type()));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_listen_and_fire() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.listen("test_event", recorder(&log, "a"));

        bus.fire_data("test_event", json!({"key": "value"}), Context::new());
        bus.fire_data("other_event", json!({}), Context::new());

        assert_eq!(*log.lock().unwrap(), vec!["a:test_event"]);
    }

    #[tokio::test]
    async fn test_order_specific_then_wildcard() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.listen("*", recorder(&log, "all"));
        bus.listen("test_event", recorder(&log, "first"));
        bus.listen("test_event", recorder(&log, "second"));

        bus.fire_data("test_event", json!({}), Context::new());

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:test_event", "second:test_event", "all:test_event"]
        );
    }

    #[tokio::test]
    async fn test_close_event_skips_wildcard() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.listen("*", recorder(&log, "all"));
        bus.listen(OPENPEERPOWER_CLOSE, recorder(&log, "close"));

        bus.fire_data(OPENPEERPOWER_CLOSE, json!({}), Context::new());

        assert_eq!(*log.lock().unwrap(), vec!["close:openpeerpower_close"]);
    }

    #[tokio::test]
    async fn test_failing_listener_is_isolated() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.listen(
            "test_event",
            Job::callback(|_: EventRef| anyhow::bail!("listener failed")),
        );
        bus.listen(
            "test_event",
            Job::callback(|_: EventRef| -> HandlerResult { panic!("listener panicked") }),
        );
        bus.listen("test_event", recorder(&log, "survivor"));

        bus.fire_data("test_event", json!({}), Context::new());

        assert_eq!(*log.lock().unwrap(), vec!["survivor:test_event"]);
    }

    #[tokio::test]
    async fn test_listen_once_fires_once() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.listen_once("test_event", recorder(&log, "once"));

        bus.fire_data("test_event", json!({}), Context::new());
        bus.fire_data("test_event", json!({}), Context::new());

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(bus.listeners().get("test_event").is_none());
    }

    #[tokio::test]
    async fn test_listen_once_coroutine_fires_once() {
        let bus = make_bus();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        bus.listen_once(
            "test_event",
            Job::coroutine(move |_: EventRef| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }
            }),
        );

        bus.fire_data("test_event", json!({}), Context::new());
        bus.fire_data("test_event", json!({}), Context::new());
        bus.scheduler().block_till_done().await;

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filter_drops_without_scheduling() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        bus.listen_filtered(
            "test_event",
            Job::coroutine(move |event: EventRef| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(event.data()["n"].to_string());
                    Ok(())
                }
            }),
            |event| event.data()["n"].as_i64() == Some(2),
        );

        bus.fire_data("test_event", json!({"n": 1}), Context::new());
        assert_eq!(bus.scheduler().pending_count(), 0);

        bus.fire_data("test_event", json!({"n": 2}), Context::new());
        bus.scheduler().block_till_done().await;

        assert_eq!(*log.lock().unwrap(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let unsub = bus.listen("test_event", recorder(&log, "a"));
        let id = unsub.listener_id();
        assert_eq!(bus.listeners()["test_event"], 1);

        assert!(unsub.unsubscribe());
        bus.fire_data("test_event", json!({}), Context::new());
        assert!(log.lock().unwrap().is_empty());
        assert!(bus.listeners().is_empty());

        let stale = Unsubscribe {
            table: Arc::downgrade(&bus.listeners),
            event_type: "test_event".into(),
            id,
        };
        assert!(!stale.unsubscribe());
    }

    #[tokio::test]
    async fn test_executor_listener() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        bus.listen(
            OPENPEERPOWER_STOP,
            Job::executor(move |event: EventRef| {
                seen.lock().unwrap().push(event.event_type().to_string());
                Ok(())
            }),
        );

        bus.fire_data(OPENPEERPOWER_STOP, json!({}), Context::new());
        bus.scheduler().block_till_done().await;

        assert_eq!(*log.lock().unwrap(), vec![OPENPEERPOWER_STOP]);
    }

    #[tokio::test]
    async fn test_fire_typed() {
        let bus = make_bus();
        let received = Arc::new(Mutex::new(None));
        let slot = received.clone();
        bus.listen(
            "state_changed",
            Job::callback(move |event: EventRef| {
                *slot.lock().unwrap() = event.data_as::<StateChangedData>();
                Ok(())
            }),
        );

        let entity_id: EntityId = "light.test".parse().unwrap();
        let new_state =
            State::new(entity_id.clone(), "on", Attributes::new(), Context::new()).unwrap();
        bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state: None,
                new_state: Some(new_state),
            },
            Context::new(),
        );

        let data = received.lock().unwrap().take().unwrap();
        assert_eq!(data.entity_id.to_string(), "light.test");
        assert_eq!(data.new_state.unwrap().state, "on");
    }

    #[tokio::test]
    async fn test_fire_with_overrides() {
        let bus = make_bus();
        let fired_at = Utc::now() - chrono::Duration::seconds(30);
        let ctx = Context::new();

        let event = bus.fire_with(
            "remote_event",
            None,
            EventOrigin::Remote,
            Some(ctx.clone()),
            Some(fired_at),
        );

        assert_eq!(event.origin(), EventOrigin::Remote);
        assert_eq!(event.time_fired(), fired_at);
        assert_eq!(event.context(), &ctx);
        assert_eq!(event.data(), &json!({}));
    }

    #[tokio::test]
    async fn test_listener_counts() {
        let bus = make_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.listen("a", recorder(&log, "1"));
        bus.listen("a", recorder(&log, "2"));
        bus.listen("*", recorder(&log, "3"));

        let counts = bus.listeners();
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["*"], 1);
        assert_eq!(bus.listener_count(), 3);
    }
}
