//! Core configuration for Open Peer Power
//!
//! - [`CoreConfig`] holds the values of the `openpeerpower:` section of
//!   configuration.yaml plus runtime facts such as the config directory.
//! - [`Config`] is the live, shared configuration. Updates are validated,
//!   persisted to `.storage/core.config` and announced with a
//!   `core_config_updated` event.
//! - [`Store`] reads and writes the versioned JSON files under `.storage/`.

mod config;
mod core_config;
mod error;
mod storage;

pub use config::{Config, ConfigUpdate};
pub use core_config::{ConfigSource, CoreConfig, UnitSystem, UnitSystemName, CORE_SECTION};
pub use error::{ConfigError, ConfigResult};
pub use storage::{Storable, StorageError, StorageFile, StorageResult, Store, STORAGE_DIR};

/// Version reported in `Config::as_dict`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse an IANA time zone name
pub fn validate_time_zone(time_zone: &str) -> ConfigResult<chrono_tz::Tz> {
    time_zone
        .parse()
        .map_err(|_| ConfigError::InvalidTimeZone(time_zone.to_string()))
}

/// Thread-safe wrapper for Config
pub type SharedConfig = std::sync::Arc<Config>;
