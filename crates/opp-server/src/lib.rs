//! Open Peer Power orchestrator
//!
//! Ties the core crates together into a running instance:
//!
//! - [`OpenPeerPower`]: lifecycle (start, stop, restart, run until stopped)
//!   and the scheduling entry points
//! - the `time_changed` clock, started once the instance is running
//! - [`DataRegistry`]: typed per-integration storage
//! - [`Integration`], [`IntegrationTable`] and [`ConfigEntries`]: the plugin
//!   interface and the config entry lifecycle

mod data;
mod instance;
mod integration;
mod timer;

pub use data::DataRegistry;
pub use instance::{
    CoreError, CoreOptions, OpenPeerPower, SharedOpenPeerPower, RESTART_EXIT_CODE,
    STAGE_1_SHUTDOWN_TIMEOUT, STAGE_2_SHUTDOWN_TIMEOUT, STAGE_3_SHUTDOWN_TIMEOUT, START_TIMEOUT,
};
pub use integration::{
    retry_delay, ConfigEntries, ConfigEntriesError, ConfigEntriesResult, ConfigEntry,
    ConfigEntrySource, ConfigEntryState, Integration, IntegrationTable, InvalidTransition,
    SetupError, SharedIntegration,
};

// Re-export the core crates so embedders depend on a single crate
pub use opp_config as config;
pub use opp_core as types;
pub use opp_event_bus as event_bus;
pub use opp_scheduler as scheduler;
pub use opp_service_registry as service_registry;
pub use opp_state_machine as state_machine;
