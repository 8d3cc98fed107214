//! Integrations and their config entries
//!
//! An integration is registered in the [`IntegrationTable`] under its domain
//! and implements the [`Integration`] capabilities it supports. A
//! [`ConfigEntry`] is one configured instance of an integration; its
//! lifecycle follows:
//!
//! ```text
//! not_loaded -> setup_in_progress -> loaded | setup_error | setup_retry | migration_error
//! setup_error, setup_retry -> setup_in_progress (manual or scheduled retry)
//! loaded, setup_error, setup_retry -> unload_in_progress -> not_loaded | failed_unload
//! ```
//!
//! `migration_error` and `failed_unload` are final until restart.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::instance::OpenPeerPower;

/// Failure signalled by an integration during setup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    /// The device or service is not reachable yet; setup is retried later
    #[error("not ready: {0}")]
    NotReady(String),

    /// Credentials were rejected; the entry needs re-authentication
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("{0}")]
    Failed(String),
}

/// Capabilities of an integration
///
/// Every method has a default so an integration only implements what it
/// supports.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Domain the integration is registered under (e.g., "hue")
    fn domain(&self) -> &str;

    /// One-time setup from the integration's YAML section
    ///
    /// Returning `Ok(false)` aborts loading the integration.
    async fn setup(
        &self,
        _opp: &Arc<OpenPeerPower>,
        _config: &serde_yaml::Value,
    ) -> Result<bool, SetupError> {
        Ok(true)
    }

    /// Set up one config entry
    async fn setup_entry(
        &self,
        _opp: &Arc<OpenPeerPower>,
        _entry: &ConfigEntry,
    ) -> Result<bool, SetupError> {
        Err(SetupError::Failed(format!(
            "{} does not support config entries",
            self.domain()
        )))
    }

    /// Whether `unload_entry` is implemented
    fn supports_unload(&self) -> bool {
        false
    }

    /// Release everything `setup_entry` created
    async fn unload_entry(
        &self,
        _opp: &Arc<OpenPeerPower>,
        _entry: &ConfigEntry,
    ) -> Result<bool, SetupError> {
        Ok(false)
    }

    fn has_options_flow(&self) -> bool {
        false
    }
}

/// Shared integration object
pub type SharedIntegration = Arc<dyn Integration>;

/// Registered integrations by domain
#[derive(Default)]
pub struct IntegrationTable {
    integrations: DashMap<String, SharedIntegration>,
}

impl IntegrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration, replacing one with the same domain
    pub fn register(&self, integration: SharedIntegration) {
        let domain = integration.domain().to_lowercase();
        debug!(domain = %domain, "Registering integration");
        self.integrations.insert(domain, integration);
    }

    pub fn get(&self, domain: &str) -> Option<SharedIntegration> {
        self.integrations
            .get(&domain.to_lowercase())
            .map(|i| i.value().clone())
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<_> = self.integrations.iter().map(|i| i.key().clone()).collect();
        domains.sort();
        domains
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    #[default]
    NotLoaded,
    SetupInProgress,
    Loaded,
    SetupError,
    /// Integration reported not ready; a retry is scheduled
    SetupRetry,
    MigrationError,
    UnloadInProgress,
    FailedUnload,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("config entry cannot go from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
}

impl ConfigEntryState {
    /// States an entry can leave without a restart
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }

    /// Validate a transition to `to`
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded)
                | (SetupInProgress, SetupError)
                | (SetupInProgress, SetupRetry)
                | (SetupInProgress, MigrationError)
                | (SetupError, SetupInProgress)
                | (SetupError, UnloadInProgress)
                | (SetupRetry, SetupInProgress)
                | (SetupRetry, UnloadInProgress)
                | (Loaded, UnloadInProgress)
                | (UnloadInProgress, NotLoaded)
                | (UnloadInProgress, FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

/// Delay before retrying an entry that was not ready: 5 s doubling up to 80 s
pub fn retry_delay(tries: u32) -> Duration {
    Duration::from_secs(5 * 2u64.pow(tries.min(4)))
}

/// Where a config entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    #[default]
    User,
    Import,
    Discovery,
    Reauth,
    Ignore,
    System,
}

/// One configured instance of an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// ULID assigned at creation
    pub entry_id: String,

    pub domain: String,

    pub title: String,

    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    #[serde(default)]
    pub disabled: bool,

    // Runtime only, never persisted
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Explanation for failed states
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Setup attempts that ended in `SetupRetry`
    #[serde(skip, default)]
    pub tries: u32,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into().to_lowercase(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            disabled: false,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    /// Transition to `state`, recording `reason`
    pub fn try_set_state(
        &mut self,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.try_transition(state)?;
        self.reason = reason;
        if !matches!(
            state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }
        Ok(())
    }
}

/// Config entry errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Integration {0} does not support unloading")]
    UnloadNotSupported(String),

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Config entries of all integrations
#[derive(Default)]
pub struct ConfigEntries {
    entries: DashMap<String, ConfigEntry>,
    /// Serializes setup and unload
    setup_lock: tokio::sync::Mutex<()>,
}

/// Set an entry up again after `delay`
///
/// The retry is a plain timer, not a tracked task, so startup and shutdown
/// never wait for it. It is dropped when the instance is gone or no longer
/// running, or when the entry left `SetupRetry` in the meantime.
fn schedule_retry(opp: &Arc<OpenPeerPower>, entry_id: &str, delay: Duration) {
    let runtime = opp.scheduler.runtime().clone();
    let opp = Arc::downgrade(opp);
    let entry_id = entry_id.to_string();
    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(opp) = opp.upgrade() else {
            return;
        };
        let waiting = opp
            .config_entries
            .get(&entry_id)
            .is_some_and(|e| e.state == ConfigEntryState::SetupRetry);
        if !waiting || !opp.is_running() {
            debug!(entry_id, "Dropping scheduled setup retry");
            return;
        }
        if let Err(err) = opp.config_entries.setup(&opp, &entry_id).await {
            warn!(entry_id, "Retrying setup failed: {}", err);
        }
    });
}

impl ConfigEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; it is not set up yet
    pub fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(unique_id) = &entry.unique_id {
            let duplicate = self.entries.iter().any(|e| {
                e.domain == entry.domain && e.unique_id.as_deref() == Some(unique_id.as_str())
            });
            if duplicate {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        debug!(entry_id = %entry.entry_id, domain = %entry.domain, "Adding config entry");
        self.entries.insert(entry.entry_id.clone(), entry.clone());
        Ok(entry)
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|e| e.value().clone())
    }

    /// Entries, optionally only those of one domain
    pub fn entries(&self, domain: Option<&str>) -> Vec<ConfigEntry> {
        self.entries
            .iter()
            .filter(|e| domain.map_or(true, |d| e.domain == d))
            .map(|e| e.value().clone())
            .collect()
    }

    fn transition(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        Ok(entry.clone())
    }

    /// Set up an entry through its integration
    ///
    /// Returns whether the entry ended up loaded. Failures signalled by the
    /// integration only change the entry state.
    pub async fn setup(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry_id: &str,
    ) -> ConfigEntriesResult<bool> {
        let _lock = self.setup_lock.lock().await;
        self.setup_locked(opp, entry_id).await
    }

    async fn setup_locked(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry_id: &str,
    ) -> ConfigEntriesResult<bool> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if entry.disabled {
            debug!(entry_id, "Skipping setup for disabled entry");
            return Ok(false);
        }

        let entry = self.transition(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let Some(integration) = opp.integrations.get(&entry.domain) else {
            error!("Integration {} not found for config entry {}", entry.domain, entry.title);
            self.transition(
                entry_id,
                ConfigEntryState::SetupError,
                Some("Integration not found".to_string()),
            )?;
            return Ok(false);
        };

        match integration.setup_entry(opp, &entry).await {
            Ok(true) => {
                self.transition(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Setup completed for config entry {} ({})", entry.title, entry.domain);
                Ok(true)
            }
            Ok(false) => {
                error!("{} setup of config entry {} failed", entry.domain, entry.title);
                self.transition(entry_id, ConfigEntryState::SetupError, None)?;
                Ok(false)
            }
            Err(SetupError::NotReady(reason)) => {
                self.transition(entry_id, ConfigEntryState::SetupRetry, Some(reason.clone()))?;
                let tries = self
                    .entries
                    .get_mut(entry_id)
                    .map(|mut e| {
                        e.tries += 1;
                        e.tries
                    })
                    .unwrap_or(1);
                let delay = retry_delay(tries - 1);
                warn!(
                    "Config entry {} for {} is not ready yet: {}; retrying in {:?}",
                    entry.title, entry.domain, reason, delay
                );
                schedule_retry(opp, entry_id, delay);
                Ok(false)
            }
            Err(SetupError::AuthFailed(reason)) => {
                warn!(
                    "Config entry {} for {} could not authenticate: {}",
                    entry.title, entry.domain, reason
                );
                self.transition(entry_id, ConfigEntryState::SetupError, Some(reason))?;
                Ok(false)
            }
            Err(SetupError::Failed(reason)) => {
                error!("Error setting up entry {} for {}: {}", entry.title, entry.domain, reason);
                self.transition(entry_id, ConfigEntryState::SetupError, Some(reason))?;
                Ok(false)
            }
        }
    }

    /// Unload an entry
    ///
    /// Entries that are not loaded go straight back to `NotLoaded`.
    pub async fn unload(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry_id: &str,
    ) -> ConfigEntriesResult<bool> {
        let _lock = self.setup_lock.lock().await;
        self.unload_locked(opp, entry_id).await
    }

    async fn unload_locked(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry_id: &str,
    ) -> ConfigEntriesResult<bool> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        match entry.state {
            ConfigEntryState::NotLoaded => return Ok(true),
            ConfigEntryState::Loaded => {}
            state if state.is_recoverable() => {
                self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;
                self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
                return Ok(true);
            }
            state => return Err(ConfigEntriesError::CannotUnload(state)),
        }

        let integration = opp
            .integrations
            .get(&entry.domain)
            .filter(|i| i.supports_unload())
            .ok_or_else(|| ConfigEntriesError::UnloadNotSupported(entry.domain.clone()))?;

        self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;
        match integration.unload_entry(opp, &entry).await {
            Ok(true) => {
                self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
                info!("Unloaded config entry {} ({})", entry.title, entry.domain);
                Ok(true)
            }
            Ok(false) => {
                self.transition(entry_id, ConfigEntryState::FailedUnload, None)?;
                Ok(false)
            }
            Err(err) => {
                error!("Error unloading entry {} for {}: {}", entry.title, entry.domain, err);
                self.transition(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some(err.to_string()),
                )?;
                Ok(false)
            }
        }
    }

    /// Unload and set up an entry again
    pub async fn reload(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry_id: &str,
    ) -> ConfigEntriesResult<bool> {
        let _lock = self.setup_lock.lock().await;
        if !self.unload_locked(opp, entry_id).await? {
            return Ok(false);
        }
        self.setup_locked(opp, entry_id).await
    }

    /// Unload (if needed) and forget an entry
    pub async fn remove(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry_id: &str,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let _lock = self.setup_lock.lock().await;
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if entry.state == ConfigEntryState::Loaded {
            self.unload_locked(opp, entry_id).await?;
        }
        self.entries
            .remove(entry_id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }
}
