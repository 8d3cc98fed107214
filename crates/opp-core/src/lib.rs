//! Core types for Open Peer Power
//!
//! This crate provides the fundamental types shared by every other crate:
//! EntityId, State, Event, Context, ServiceCall, the core lifecycle state
//! and the error taxonomy.

pub mod dt;

mod context;
mod core_state;
mod entity_id;
mod error;
mod event;
mod service_call;
mod state;

pub use context::Context;
pub use core_state::{CoreState, SharedCoreState};
pub use entity_id::{split_entity_id, valid_entity_id, EntityId, EntityIdError, EntityIdPart};
pub use error::{ConditionError, OppError, OppResult, Unauthorized};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use service_call::ServiceCall;
pub use state::{valid_state, Attributes, State};

/// Maximum length for a state value
pub const MAX_LENGTH_STATE_STATE: usize = 255;

/// Event type matching every event
pub const MATCH_ALL: &str = "*";

/// Standard event types and their payloads
pub mod events {
    use super::*;

    pub const STATE_CHANGED: &str = "state_changed";
    pub const CALL_SERVICE: &str = "call_service";
    pub const SERVICE_REGISTERED: &str = "service_registered";
    pub const SERVICE_REMOVED: &str = "service_removed";
    pub const COMPONENT_LOADED: &str = "component_loaded";
    pub const CORE_CONFIG_UPDATE: &str = "core_config_updated";
    pub const OPENPEERPOWER_START: &str = "openpeerpower_start";
    pub const OPENPEERPOWER_STARTED: &str = "openpeerpower_started";
    pub const OPENPEERPOWER_STOP: &str = "openpeerpower_stop";
    pub const OPENPEERPOWER_FINAL_WRITE: &str = "openpeerpower_final_write";
    pub const OPENPEERPOWER_CLOSE: &str = "openpeerpower_close";
    pub const TIME_CHANGED: &str = "time_changed";
    pub const TIMER_OUT_OF_SYNC: &str = "timer_out_of_sync";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for CALL_SERVICE events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct CallServiceData {
        pub domain: String,
        pub service: String,
        pub service_data: serde_json::Value,
    }

    impl EventData for CallServiceData {
        fn event_type() -> &'static str {
            CALL_SERVICE
        }
    }

    /// Data for SERVICE_REGISTERED and SERVICE_REMOVED events
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct ServiceEventData {
        pub domain: String,
        pub service: String,
    }

    /// Data for TIME_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct TimeChangedData {
        pub now: chrono::DateTime<chrono::Utc>,
    }

    impl EventData for TimeChangedData {
        fn event_type() -> &'static str {
            TIME_CHANGED
        }
    }

    /// Data for TIMER_OUT_OF_SYNC events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct TimerOutOfSyncData {
        pub seconds: f64,
    }

    impl EventData for TimerOutOfSyncData {
        fn event_type() -> &'static str {
            TIMER_OUT_OF_SYNC
        }
    }
}
