//! Core configuration values
//!
//! Parses the `openpeerpower:` section from configuration.yaml

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};

/// Name of the core section in configuration.yaml
pub const CORE_SECTION: &str = "openpeerpower";

/// Unit system selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystemName {
    #[default]
    Metric,
    Imperial,
}

impl UnitSystemName {
    pub fn units(self) -> UnitSystem {
        match self {
            UnitSystemName::Metric => UnitSystem::metric(),
            UnitSystemName::Imperial => UnitSystem::imperial(),
        }
    }
}

/// Units used to present measurements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSystem {
    pub length: String,
    pub mass: String,
    pub pressure: String,
    pub temperature: String,
    pub volume: String,
}

impl UnitSystem {
    /// Create metric unit system
    pub fn metric() -> Self {
        Self {
            length: "km".to_string(),
            mass: "g".to_string(),
            pressure: "Pa".to_string(),
            temperature: "°C".to_string(),
            volume: "L".to_string(),
        }
    }

    /// Create imperial unit system
    pub fn imperial() -> Self {
        Self {
            length: "mi".to_string(),
            mass: "lb".to_string(),
            pressure: "psi".to_string(),
            temperature: "°F".to_string(),
            volume: "gal".to_string(),
        }
    }
}

/// Where the current core configuration came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    #[default]
    Default,
    Yaml,
    Storage,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Default => "default",
            ConfigSource::Yaml => "yaml",
            ConfigSource::Storage => "storage",
        }
    }
}

/// Core configuration from the `openpeerpower:` section
///
/// Fields marked `serde(skip)` are runtime values that never come from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Name of the location (e.g., "Home")
    #[serde(rename = "name", default = "default_name")]
    pub location_name: String,

    #[serde(default)]
    pub latitude: f64,

    #[serde(default)]
    pub longitude: f64,

    /// Elevation in meters
    #[serde(default)]
    pub elevation: i32,

    #[serde(default)]
    pub unit_system: UnitSystemName,

    /// IANA time zone (e.g., "America/Los_Angeles")
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    #[serde(default)]
    pub external_url: Option<String>,

    #[serde(default)]
    pub internal_url: Option<String>,

    /// Directories integrations may read from and write to
    #[serde(default)]
    pub allowlist_external_dirs: BTreeSet<PathBuf>,

    /// URL prefixes integrations may fetch from
    #[serde(default)]
    pub allowlist_external_urls: BTreeSet<String>,

    /// Named media source directories
    #[serde(default)]
    pub media_dirs: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub legacy_templates: bool,

    #[serde(skip)]
    pub config_dir: Option<PathBuf>,

    #[serde(skip)]
    pub config_source: ConfigSource,

    #[serde(skip)]
    pub safe_mode: bool,

    #[serde(skip)]
    pub skip_pip: bool,

    /// Loaded components
    #[serde(skip)]
    pub components: BTreeSet<String>,
}

fn default_name() -> String {
    "Home".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            location_name: default_name(),
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0,
            unit_system: UnitSystemName::Metric,
            time_zone: default_time_zone(),
            external_url: None,
            internal_url: None,
            allowlist_external_dirs: BTreeSet::new(),
            allowlist_external_urls: BTreeSet::new(),
            media_dirs: BTreeMap::new(),
            legacy_templates: false,
            config_dir: None,
            config_source: ConfigSource::Default,
            safe_mode: false,
            skip_pip: false,
            components: BTreeSet::new(),
        }
    }
}

impl CoreConfig {
    /// Load core configuration from `config_dir/configuration.yaml`
    ///
    /// A missing file yields the defaults. The config directory is
    /// recorded, `www` and the media directories are added to the allowed
    /// external directories, and `media` becomes the default media dir.
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let path = config_dir.join("configuration.yaml");

        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let yaml: Value = serde_yaml::from_str(&content).map_err(|source| {
                    ConfigError::ParseYaml {
                        path: path.clone(),
                        source,
                    }
                })?;
                Self::from_yaml(&yaml)?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::ReadFile { path, source }),
        };

        config.config_dir = Some(config_dir.to_path_buf());
        if config.media_dirs.is_empty() {
            config
                .media_dirs
                .insert("local".to_string(), config_dir.join("media"));
        }
        config.allowlist_external_dirs.insert(config_dir.join("www"));
        let media: Vec<PathBuf> = config.media_dirs.values().cloned().collect();
        config.allowlist_external_dirs.extend(media);

        Ok(config)
    }

    /// Parse core configuration from a YAML document
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        let mapping = match yaml {
            Value::Mapping(mapping) => mapping.clone(),
            Value::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "root".to_string(),
                    reason: "configuration must be a mapping".to_string(),
                })
            }
        };

        let section = match mapping.get(CORE_SECTION) {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(section) => section.clone(),
        };

        let config: CoreConfig =
            serde_yaml::from_value(section).map_err(|e| ConfigError::InvalidValue {
                key: CORE_SECTION.to_string(),
                reason: e.to_string(),
            })?;

        crate::validate_time_zone(&config.time_zone)?;

        Ok(Self {
            config_source: ConfigSource::Yaml,
            ..config
        })
    }

    /// Resolved unit system
    pub fn units(&self) -> UnitSystem {
        self.unit_system.units()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.location_name, "Home");
        assert_eq!(config.latitude, 0.0);
        assert_eq!(config.time_zone, "UTC");
        assert_eq!(config.config_source, ConfigSource::Default);
        assert_eq!(config.units(), UnitSystem::metric());
    }

    #[test]
    fn test_unit_systems() {
        let metric = UnitSystem::metric();
        assert_eq!(metric.temperature, "°C");
        assert_eq!(metric.volume, "L");

        let imperial = UnitSystem::imperial();
        assert_eq!(imperial.temperature, "°F");
        assert_eq!(imperial.mass, "lb");
    }

    #[test]
    fn test_parse_from_yaml() {
        let yaml: Value = serde_yaml::from_str(
            r#"
openpeerpower:
  name: Test Home
  latitude: 51.5074
  longitude: -0.1278
  elevation: 11
  unit_system: imperial
  time_zone: Europe/London
  allowlist_external_urls:
    - http://example.com/camera
"#,
        )
        .unwrap();

        let config = CoreConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.location_name, "Test Home");
        assert_eq!(config.latitude, 51.5074);
        assert_eq!(config.longitude, -0.1278);
        assert_eq!(config.elevation, 11);
        assert_eq!(config.unit_system, UnitSystemName::Imperial);
        assert_eq!(config.time_zone, "Europe/London");
        assert_eq!(config.config_source, ConfigSource::Yaml);
        assert!(config
            .allowlist_external_urls
            .contains("http://example.com/camera"));
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let yaml: Value = serde_yaml::from_str("light: []").unwrap();
        assert_eq!(CoreConfig::from_yaml(&yaml).unwrap(), CoreConfig::default());
        assert_eq!(CoreConfig::from_yaml(&Value::Null).unwrap(), CoreConfig::default());
    }

    #[test]
    fn test_invalid_yaml_values() {
        let not_a_mapping: Value = serde_yaml::from_str("- a\n- b").unwrap();
        assert!(matches!(
            CoreConfig::from_yaml(&not_a_mapping),
            Err(ConfigError::InvalidValue { .. })
        ));

        let bad_units: Value =
            serde_yaml::from_str("openpeerpower:\n  unit_system: cubits").unwrap();
        assert!(matches!(
            CoreConfig::from_yaml(&bad_units),
            Err(ConfigError::InvalidValue { .. })
        ));

        let bad_tz: Value = serde_yaml::from_str("openpeerpower:\n  time_zone: Mars/Base").unwrap();
        assert!(matches!(
            CoreConfig::from_yaml(&bad_tz),
            Err(ConfigError::InvalidTimeZone(_))
        ));
    }

    #[test]
    fn test_load_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("configuration.yaml"),
            "openpeerpower:\n  name: Cabin\n",
        )
        .unwrap();

        let config = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.location_name, "Cabin");
        assert_eq!(config.config_dir.as_deref(), Some(dir.path()));
        assert_eq!(config.media_dirs["local"], dir.path().join("media"));
        assert!(config.allowlist_external_dirs.contains(&dir.path().join("www")));
        assert!(config.allowlist_external_dirs.contains(&dir.path().join("media")));
    }

    #[test]
    fn test_load_without_file() {
        let dir = TempDir::new().unwrap();
        let config = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.location_name, "Home");
        assert_eq!(config.config_source, ConfigSource::Default);
    }
}
