//! Test Open Peer Power instance
//!
//! Provides an isolated OpenPeerPower instance for testing with captured
//! events and service calls. The clock is disabled so tests control time.

#![allow(dead_code)]

use opp_core::events::OPENPEERPOWER_CLOSE;
use opp_core::{Attributes, Context, ServiceCall, State, MATCH_ALL};
use opp_event_bus::EventRef;
use opp_scheduler::{HandlerResult, Job};
use opp_server::config::CoreConfig;
use opp_server::{CoreOptions, OpenPeerPower, SharedOpenPeerPower};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Options for tests: no clock and short shutdown stages
pub fn test_options() -> CoreOptions {
    CoreOptions {
        run_timer: false,
        start_timeout: Duration::from_secs(2),
        stage_1_shutdown_timeout: Duration::from_secs(2),
        stage_2_shutdown_timeout: Duration::from_secs(2),
        stage_3_shutdown_timeout: Duration::from_secs(2),
        ..CoreOptions::default()
    }
}

/// A test instance of Open Peer Power with captured events and service calls
pub struct TestOpenPeerPower {
    pub opp: SharedOpenPeerPower,
    /// Every fired event, `openpeerpower_close` included
    captured_events: Arc<Mutex<Vec<EventRef>>>,
    captured_service_calls: Arc<Mutex<Vec<ServiceCall>>>,
}

impl TestOpenPeerPower {
    /// Create a test instance; must be called inside a tokio runtime
    pub fn new() -> Self {
        Self::with_options(test_options())
    }

    pub fn with_options(options: CoreOptions) -> Self {
        Self::with_config(CoreConfig::default(), options)
    }

    pub fn with_config(core: CoreConfig, options: CoreOptions) -> Self {
        let opp = OpenPeerPower::new(core, options);
        let captured_events = Arc::new(Mutex::new(Vec::new()));

        // The close event is not delivered to wildcard listeners
        for event_type in [MATCH_ALL, OPENPEERPOWER_CLOSE] {
            let events = captured_events.clone();
            opp.bus.listen(
                event_type,
                Job::callback(move |event: EventRef| -> HandlerResult {
                    events.lock().unwrap().push(event);
                    Ok(())
                })
                .named("capture_events"),
            );
        }

        Self {
            opp,
            captured_events,
            captured_service_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the state of an entity
    pub fn set_state(&self, entity_id: &str, state: &str, attributes: Attributes) -> State {
        self.opp
            .states
            .set(entity_id, state, attributes, Context::new())
            .expect("Invalid state")
    }

    /// Assert that an entity is in a specific state
    pub fn assert_state(&self, entity_id: &str, expected: &str) {
        let state = self.opp.states.get(entity_id).map(|s| s.state);
        assert_eq!(
            state.as_deref(),
            Some(expected),
            "Expected entity {} to be in state '{}', but was {:?}",
            entity_id,
            expected,
            state
        );
    }

    /// Register a service that records its calls
    pub fn mock_service(&self, domain: &str, service: &str) {
        let calls = self.captured_service_calls.clone();
        self.opp.services.register(
            domain,
            service,
            Job::callback(move |call: ServiceCall| -> HandlerResult {
                calls.lock().unwrap().push(call);
                Ok(())
            })
            .named("mock_service"),
            None,
        );
    }

    /// Get all captured events
    pub fn captured_events(&self) -> Vec<EventRef> {
        self.captured_events.lock().unwrap().clone()
    }

    /// Types of the captured events, in firing order
    pub fn event_types(&self) -> Vec<String> {
        self.captured_events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }

    /// Captured events of one type
    pub fn events(&self, event_type: &str) -> Vec<EventRef> {
        self.captured_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Get captured service calls for a specific domain
    pub fn service_calls(&self, domain: &str) -> Vec<ServiceCall> {
        self.captured_service_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.domain == domain)
            .cloned()
            .collect()
    }

    /// Clear all captured events
    pub fn clear_events(&self) {
        self.captured_events.lock().unwrap().clear();
    }
}
