//! Live core configuration shared by the whole process

use chrono_tz::Tz;
use opp_core::events::CORE_CONFIG_UPDATE;
use opp_core::{Context, SharedCoreState};
use opp_event_bus::SharedEventBus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::core_config::{ConfigSource, CoreConfig, UnitSystemName};
use crate::error::{ConfigError, ConfigResult};
use crate::storage::{Storable, Store};
use crate::{validate_time_zone, VERSION};

/// Changes accepted by [`Config::update`]; `None` leaves a value alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation: Option<i32>,
    pub unit_system: Option<UnitSystemName>,
    pub location_name: Option<String>,
    pub time_zone: Option<String>,
    pub external_url: Option<String>,
    pub internal_url: Option<String>,
}

/// Values persisted in `.storage/core.config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredCoreConfig {
    latitude: f64,
    longitude: f64,
    elevation: i32,
    unit_system: UnitSystemName,
    location_name: String,
    time_zone: String,
    #[serde(default)]
    external_url: Option<String>,
    #[serde(default)]
    internal_url: Option<String>,
}

impl Storable for StoredCoreConfig {
    const KEY: &'static str = "core.config";
    const VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 1;
}

impl From<&CoreConfig> for StoredCoreConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            latitude: config.latitude,
            longitude: config.longitude,
            elevation: config.elevation,
            unit_system: config.unit_system,
            location_name: config.location_name.clone(),
            time_zone: config.time_zone.clone(),
            external_url: config.external_url.clone(),
            internal_url: config.internal_url.clone(),
        }
    }
}

fn apply<T: PartialEq + Serialize>(
    changed: &mut Map<String, Value>,
    key: &str,
    field: &mut T,
    value: Option<T>,
) {
    if let Some(value) = value {
        if *field != value {
            changed.insert(key.to_string(), serde_json::to_value(&value).unwrap_or_default());
            *field = value;
        }
    }
}

/// Core configuration of a running instance
///
/// Wraps a [`CoreConfig`] together with the bus used to announce changes
/// and the lifecycle state reported by [`Config::as_dict`].
pub struct Config {
    inner: RwLock<CoreConfig>,
    event_bus: SharedEventBus,
    core_state: SharedCoreState,
}

impl Config {
    pub fn new(core: CoreConfig, event_bus: SharedEventBus, core_state: SharedCoreState) -> Self {
        Self {
            inner: RwLock::new(core),
            event_bus,
            core_state,
        }
    }

    /// Copy of the current values
    pub async fn snapshot(&self) -> CoreConfig {
        self.inner.read().await.clone()
    }

    pub async fn time_zone(&self) -> Tz {
        let time_zone = self.inner.read().await.time_zone.clone();
        validate_time_zone(&time_zone).unwrap_or(Tz::UTC)
    }

    pub async fn config_dir(&self) -> Option<PathBuf> {
        self.inner.read().await.config_dir.clone()
    }

    pub async fn set_config_dir(&self, config_dir: impl Into<PathBuf>) {
        self.inner.write().await.config_dir = Some(config_dir.into());
    }

    pub async fn safe_mode(&self) -> bool {
        self.inner.read().await.safe_mode
    }

    /// Record a component as loaded
    pub async fn add_component(&self, component: impl Into<String>) {
        self.inner.write().await.components.insert(component.into());
    }

    pub async fn has_component(&self, component: &str) -> bool {
        self.inner.read().await.components.contains(component)
    }

    /// Path inside the config directory
    pub async fn path(&self, parts: &[&str]) -> ConfigResult<PathBuf> {
        let config_dir = self.config_dir().await.ok_or(ConfigError::NoConfigDir)?;
        Ok(parts.iter().fold(config_dir, |path, part| path.join(part)))
    }

    /// Whether `url` starts with one of the allowed external URLs
    pub async fn is_allowed_external_url(&self, url: &str) -> bool {
        let url = format!("{}/", url.trim_end_matches('/'));
        self.inner
            .read()
            .await
            .allowlist_external_urls
            .iter()
            .any(|allowed| url == *allowed || url.starts_with(allowed.as_str()))
    }

    /// Whether `path` lies inside one of the allowed external directories
    ///
    /// A path that does not exist yet is checked through its parent.
    pub async fn is_allowed_path(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let resolved = if path.exists() {
            path.canonicalize()
        } else {
            match path.parent() {
                Some(parent) => parent.canonicalize(),
                None => return false,
            }
        };
        let Ok(resolved) = resolved else {
            return false;
        };

        self.inner
            .read()
            .await
            .allowlist_external_dirs
            .iter()
            .any(|allowed| {
                let allowed = allowed.canonicalize().unwrap_or_else(|_| allowed.clone());
                resolved.starts_with(allowed)
            })
    }

    /// Dictionary form used by the API and diagnostics
    pub async fn as_dict(&self) -> Value {
        let config = self.inner.read().await;
        json!({
            "latitude": config.latitude,
            "longitude": config.longitude,
            "elevation": config.elevation,
            "unit_system": config.units(),
            "location_name": config.location_name,
            "time_zone": config.time_zone,
            "components": config.components,
            "config_dir": config.config_dir,
            "allowlist_external_dirs": config.allowlist_external_dirs,
            "allowlist_external_urls": config.allowlist_external_urls,
            "version": VERSION,
            "config_source": config.config_source.as_str(),
            "safe_mode": config.safe_mode,
            "state": self.core_state.get().as_str(),
            "external_url": config.external_url,
            "internal_url": config.internal_url,
        })
    }

    /// Apply changes, persist them and announce them
    ///
    /// The time zone is validated before anything changes. The
    /// `core_config_updated` event carries only the keys whose values
    /// changed. Persisting is skipped when no config directory is known.
    #[instrument(skip(self))]
    pub async fn update(&self, update: ConfigUpdate) -> ConfigResult<()> {
        if let Some(time_zone) = &update.time_zone {
            validate_time_zone(time_zone)?;
        }

        let mut changed = Map::new();
        let persist = {
            let mut config = self.inner.write().await;
            apply(&mut changed, "latitude", &mut config.latitude, update.latitude);
            apply(&mut changed, "longitude", &mut config.longitude, update.longitude);
            apply(&mut changed, "elevation", &mut config.elevation, update.elevation);
            apply(&mut changed, "unit_system", &mut config.unit_system, update.unit_system);
            apply(
                &mut changed,
                "location_name",
                &mut config.location_name,
                update.location_name,
            );
            apply(&mut changed, "time_zone", &mut config.time_zone, update.time_zone);
            apply(
                &mut changed,
                "external_url",
                &mut config.external_url,
                update.external_url.map(Some),
            );
            apply(
                &mut changed,
                "internal_url",
                &mut config.internal_url,
                update.internal_url.map(Some),
            );
            config.config_source = ConfigSource::Storage;
            config.config_dir.is_some()
        };

        if persist {
            self.store().await?;
        }

        debug!(changed = ?changed.keys().collect::<Vec<_>>(), "Core config updated");
        self.event_bus
            .fire_data(CORE_CONFIG_UPDATE, Value::Object(changed), Context::new());
        Ok(())
    }

    /// Load values stored by a previous [`Config::update`]
    ///
    /// Returns whether stored values were found. Nothing is announced.
    pub async fn load(&self) -> ConfigResult<bool> {
        let Some(config_dir) = self.config_dir().await else {
            return Ok(false);
        };
        let Some(stored) = Store::<StoredCoreConfig>::new(config_dir).load().await? else {
            return Ok(false);
        };
        validate_time_zone(&stored.time_zone)?;

        let mut config = self.inner.write().await;
        config.latitude = stored.latitude;
        config.longitude = stored.longitude;
        config.elevation = stored.elevation;
        config.unit_system = stored.unit_system;
        config.location_name = stored.location_name;
        config.time_zone = stored.time_zone;
        config.external_url = stored.external_url;
        config.internal_url = stored.internal_url;
        config.config_source = ConfigSource::Storage;
        Ok(true)
    }

    /// Persist the editable values to `.storage/core.config`
    pub async fn store(&self) -> ConfigResult<()> {
        let (config_dir, stored) = {
            let config = self.inner.read().await;
            let config_dir = config.config_dir.clone().ok_or(ConfigError::NoConfigDir)?;
            (config_dir, StoredCoreConfig::from(&*config))
        };
        Store::<StoredCoreConfig>::new(config_dir).save(&stored).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("core_state", &self.core_state.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opp_core::CoreState;
    use opp_event_bus::{EventBus, EventRef};
    use opp_scheduler::{Job, JobScheduler};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn make_config(core: CoreConfig) -> (Config, Arc<Mutex<Vec<Value>>>) {
        let bus = Arc::new(EventBus::new(Arc::new(JobScheduler::current())));
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        bus.listen(
            CORE_CONFIG_UPDATE,
            Job::callback(move |event: EventRef| {
                sink.lock().unwrap().push(event.data().clone());
                Ok(())
            }),
        );
        (Config::new(core, bus, SharedCoreState::new()), updates)
    }

    #[tokio::test]
    async fn test_update_fires_changed_keys() {
        let (config, updates) = make_config(CoreConfig::default());

        config
            .update(ConfigUpdate {
                latitude: Some(52.3),
                location_name: Some("Home".to_string()),
                time_zone: Some("Europe/Amsterdam".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let snapshot = config.snapshot().await;
        assert_eq!(snapshot.latitude, 52.3);
        assert_eq!(snapshot.time_zone, "Europe/Amsterdam");
        assert_eq!(snapshot.config_source, ConfigSource::Storage);
        assert_eq!(config.time_zone().await, chrono_tz::Europe::Amsterdam);
        assert_eq!(
            updates.lock().unwrap().as_slice(),
            &[json!({"latitude": 52.3, "time_zone": "Europe/Amsterdam"})]
        );
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_time_zone() {
        let (config, updates) = make_config(CoreConfig::default());

        let result = config
            .update(ConfigUpdate {
                latitude: Some(10.0),
                time_zone: Some("Not/AZone".to_string()),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(ConfigError::InvalidTimeZone(_))));
        assert_eq!(config.snapshot().await.latitude, 0.0);
        assert!(updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let core = CoreConfig {
            config_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let (config, _) = make_config(core.clone());
        assert_ok!(
            config
                .update(ConfigUpdate {
                    unit_system: Some(UnitSystemName::Imperial),
                    external_url: Some("https://example.com".to_string()),
                    ..Default::default()
                })
                .await
        );
        assert!(dir.path().join(".storage/core.config").exists());

        let (reloaded, updates) = make_config(core);
        assert!(assert_ok!(reloaded.load().await));
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.unit_system, UnitSystemName::Imperial);
        assert_eq!(snapshot.external_url.as_deref(), Some("https://example.com"));
        assert_eq!(snapshot.config_source, ConfigSource::Storage);
        assert!(updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_without_config_dir() {
        let (config, _) = make_config(CoreConfig::default());
        assert!(!config.load().await.unwrap());
        assert!(matches!(config.store().await, Err(ConfigError::NoConfigDir)));
        assert!(matches!(config.path(&["x"]).await, Err(ConfigError::NoConfigDir)));
    }

    #[tokio::test]
    async fn test_path() {
        let (config, _) = make_config(CoreConfig::default());
        config.set_config_dir("/test/config").await;

        assert_eq!(
            config.path(&["dir", "test.conf"]).await.unwrap(),
            PathBuf::from("/test/config/dir/test.conf")
        );
    }

    #[tokio::test]
    async fn test_is_allowed_path() {
        let allowed = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        std::fs::write(allowed.path().join("test.txt"), "x").unwrap();

        let mut core = CoreConfig::default();
        core.allowlist_external_dirs.insert(allowed.path().to_path_buf());
        let (config, _) = make_config(core);

        assert!(config.is_allowed_path(allowed.path().join("test.txt")).await);
        assert!(config.is_allowed_path(allowed.path().join("new.txt")).await);
        assert!(!config.is_allowed_path(other.path().join("test.txt")).await);
        assert!(!config.is_allowed_path(allowed.path().join("missing/deep.txt")).await);
    }

    #[tokio::test]
    async fn test_is_allowed_external_url() {
        let mut core = CoreConfig::default();
        core.allowlist_external_urls.insert("http://x.com/".to_string());
        core.allowlist_external_urls.insert("https://y.com/bla/".to_string());
        let (config, _) = make_config(core);

        for url in [
            "http://x.com/1.jpg",
            "http://x.com",
            "https://y.com/bla/",
            "https://y.com/bla/2.png",
        ] {
            assert!(config.is_allowed_external_url(url).await, "{url}");
        }
        for url in ["http://z.com", "https://y.com/bla_wrong", "https://y.com/"] {
            assert!(!config.is_allowed_external_url(url).await, "{url}");
        }
    }

    #[tokio::test]
    async fn test_as_dict() {
        let (config, _) = make_config(CoreConfig::default());
        config.add_component("light").await;
        config.core_state.set(CoreState::Running);

        let dict = config.as_dict().await;
        assert_eq!(dict["location_name"], "Home");
        assert_eq!(dict["unit_system"]["temperature"], "°C");
        assert_eq!(dict["components"], json!(["light"]));
        assert_eq!(dict["config_source"], "default");
        assert_eq!(dict["state"], "RUNNING");
        assert_eq!(dict["version"], VERSION);
        assert!(config.has_component("light").await);
    }
}
