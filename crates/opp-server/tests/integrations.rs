//! Integration setup and the config entry lifecycle

mod common;

use async_trait::async_trait;
use common::TestOpenPeerPower;
use opp_core::events::COMPONENT_LOADED;
use opp_core::ServiceCall;
use opp_scheduler::{HandlerResult, Job};
use opp_server::{
    retry_delay, ConfigEntriesError, ConfigEntry, ConfigEntryState, CoreError, Integration,
    OpenPeerPower, SetupError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Client object an entry keeps in the data registry
struct HueBridge {
    host: String,
}

struct MockIntegration {
    domain: &'static str,
    setup_result: Result<bool, SetupError>,
    entry_result: Mutex<Result<bool, SetupError>>,
    setup_config: Mutex<Option<serde_yaml::Value>>,
    setup_calls: AtomicUsize,
}

impl MockIntegration {
    fn new(domain: &'static str) -> Self {
        Self {
            domain,
            setup_result: Ok(true),
            entry_result: Mutex::new(Ok(true)),
            setup_config: Mutex::new(None),
            setup_calls: AtomicUsize::new(0),
        }
    }

    fn with_setup_result(mut self, result: Result<bool, SetupError>) -> Self {
        self.setup_result = result;
        self
    }

    fn set_entry_result(&self, result: Result<bool, SetupError>) {
        *self.entry_result.lock().unwrap() = result;
    }
}

#[async_trait]
impl Integration for MockIntegration {
    fn domain(&self) -> &str {
        self.domain
    }

    async fn setup(
        &self,
        _opp: &Arc<OpenPeerPower>,
        config: &serde_yaml::Value,
    ) -> Result<bool, SetupError> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        *self.setup_config.lock().unwrap() = Some(config.clone());
        self.setup_result.clone()
    }

    async fn setup_entry(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry: &ConfigEntry,
    ) -> Result<bool, SetupError> {
        let result = self.entry_result.lock().unwrap().clone();
        if result == Ok(true) {
            let host = entry
                .data
                .get("host")
                .and_then(|h| h.as_str())
                .unwrap_or_default()
                .to_string();
            opp.data.insert(entry.entry_id.clone(), HueBridge { host });
            opp.services.register(
                self.domain,
                "hue_activate_scene",
                Job::callback(|_: ServiceCall| -> HandlerResult { Ok(()) }),
                None,
            );
        }
        result
    }

    fn supports_unload(&self) -> bool {
        true
    }

    async fn unload_entry(
        &self,
        opp: &Arc<OpenPeerPower>,
        entry: &ConfigEntry,
    ) -> Result<bool, SetupError> {
        opp.data.remove::<HueBridge>(&entry.entry_id);
        opp.services.remove(self.domain, "hue_activate_scene");
        Ok(true)
    }
}

fn hue_entry() -> ConfigEntry {
    ConfigEntry::new("hue", "Living room bridge").with_data(
        [("host".to_string(), serde_json::json!("192.168.1.10"))]
            .into_iter()
            .collect(),
    )
}

#[tokio::test]
async fn test_setup_component_fires_component_loaded() {
    let test = TestOpenPeerPower::new();
    let hue = Arc::new(MockIntegration::new("hue"));
    test.opp.integrations.register(hue.clone());

    let config: serde_yaml::Value =
        serde_yaml::from_str("hue:\n  allow_unreachable: true\n").unwrap();
    assert!(test.opp.setup_component("hue", &config).await.unwrap());

    assert!(test.opp.config.has_component("hue").await);
    let events = test.events(COMPONENT_LOADED);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data()["component"], "hue");
    let section = hue.setup_config.lock().unwrap().clone().unwrap();
    assert_eq!(section["allow_unreachable"], serde_yaml::Value::Bool(true));

    // A loaded component is not set up again
    assert!(test.opp.setup_component("HUE", &config).await.unwrap());
    assert_eq!(hue.setup_calls.load(Ordering::SeqCst), 1);
    assert_eq!(test.events(COMPONENT_LOADED).len(), 1);
}

#[tokio::test]
async fn test_declined_setup_does_not_load() {
    let test = TestOpenPeerPower::new();
    test.opp
        .integrations
        .register(Arc::new(MockIntegration::new("hue").with_setup_result(Ok(false))));

    assert!(!test
        .opp
        .setup_component("hue", &serde_yaml::Value::Null)
        .await
        .unwrap());
    assert!(!test.opp.config.has_component("hue").await);
    assert!(test.events(COMPONENT_LOADED).is_empty());
}

#[tokio::test]
async fn test_failed_setup_is_reported() {
    let test = TestOpenPeerPower::new();
    test.opp.integrations.register(Arc::new(
        MockIntegration::new("hue").with_setup_result(Err(SetupError::Failed("no bridge".into()))),
    ));

    let err = test
        .opp
        .setup_component("hue", &serde_yaml::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Setup { domain, .. } if domain == "hue"));
}

#[tokio::test]
async fn test_setup_component_sets_up_entries() {
    let test = TestOpenPeerPower::new();
    test.opp.integrations.register(Arc::new(MockIntegration::new("hue")));
    let entry = test.opp.config_entries.add(hue_entry()).unwrap();

    test.opp
        .setup_component("hue", &serde_yaml::Value::Null)
        .await
        .unwrap();

    let entry = test.opp.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::Loaded);
    let bridge = test.opp.data.get::<HueBridge>(&entry.entry_id).unwrap();
    assert_eq!(bridge.host, "192.168.1.10");
    assert!(test.opp.services.has_service("hue", "hue_activate_scene"));
}

#[tokio::test]
async fn test_unload_releases_entry_resources() {
    let test = TestOpenPeerPower::new();
    test.opp.integrations.register(Arc::new(MockIntegration::new("hue")));
    let entry = test.opp.config_entries.add(hue_entry()).unwrap();
    assert!(test.opp.config_entries.setup(&test.opp, &entry.entry_id).await.unwrap());

    assert!(test.opp.config_entries.unload(&test.opp, &entry.entry_id).await.unwrap());

    let entry = test.opp.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::NotLoaded);
    assert!(!test.opp.data.contains(&entry.entry_id));
    assert!(!test.opp.services.has_service("hue", "hue_activate_scene"));
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_entry_is_retried_after_delay() {
    let test = TestOpenPeerPower::new();
    test.opp.start().await;
    let hue = Arc::new(MockIntegration::new("hue"));
    hue.set_entry_result(Err(SetupError::NotReady("bridge offline".into())));
    test.opp.integrations.register(hue.clone());
    let entry = test.opp.config_entries.add(hue_entry()).unwrap();

    assert!(!test.opp.config_entries.setup(&test.opp, &entry.entry_id).await.unwrap());
    let retrying = test.opp.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(retrying.state, ConfigEntryState::SetupRetry);
    assert_eq!(retrying.reason.as_deref(), Some("bridge offline"));
    assert_eq!(retrying.tries, 1);
    assert_eq!(test.opp.scheduler.pending_count(), 0);

    hue.set_entry_result(Ok(true));
    tokio::time::sleep(retry_delay(0) - Duration::from_secs(1)).await;
    let still_waiting = test.opp.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(still_waiting.state, ConfigEntryState::SetupRetry);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let loaded = test.opp.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(loaded.state, ConfigEntryState::Loaded);
    assert_eq!(loaded.reason, None);
}

#[tokio::test(start_paused = true)]
async fn test_retry_is_dropped_once_stopped() {
    let test = TestOpenPeerPower::new();
    test.opp.start().await;
    let hue = Arc::new(MockIntegration::new("hue"));
    hue.set_entry_result(Err(SetupError::NotReady("bridge offline".into())));
    test.opp.integrations.register(hue.clone());
    let entry = test.opp.config_entries.add(hue_entry()).unwrap();

    assert!(!test.opp.config_entries.setup(&test.opp, &entry.entry_id).await.unwrap());
    test.opp.stop(0).await;

    hue.set_entry_result(Ok(true));
    tokio::time::sleep(retry_delay(0) + Duration::from_secs(1)).await;
    let entry = test.opp.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::SetupRetry);
}

#[tokio::test]
async fn test_auth_failure_marks_setup_error() {
    let test = TestOpenPeerPower::new();
    let hue = Arc::new(MockIntegration::new("hue"));
    hue.set_entry_result(Err(SetupError::AuthFailed("invalid token".into())));
    test.opp.integrations.register(hue);
    let entry = test.opp.config_entries.add(hue_entry()).unwrap();

    assert!(!test.opp.config_entries.setup(&test.opp, &entry.entry_id).await.unwrap());

    let entry = test.opp.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::SetupError);
    assert_eq!(entry.reason.as_deref(), Some("invalid token"));
}

#[tokio::test]
async fn test_entry_without_integration() {
    let test = TestOpenPeerPower::new();
    let entry = test.opp.config_entries.add(ConfigEntry::new("zwave", "Stick")).unwrap();

    assert!(!test.opp.config_entries.setup(&test.opp, &entry.entry_id).await.unwrap());
    assert_eq!(
        test.opp.config_entries.get(&entry.entry_id).unwrap().state,
        ConfigEntryState::SetupError
    );
}

#[tokio::test]
async fn test_remove_unloads_first() {
    let test = TestOpenPeerPower::new();
    test.opp.integrations.register(Arc::new(MockIntegration::new("hue")));
    let entry = test.opp.config_entries.add(hue_entry()).unwrap();
    test.opp.config_entries.setup(&test.opp, &entry.entry_id).await.unwrap();

    let removed = test.opp.config_entries.remove(&test.opp, &entry.entry_id).await.unwrap();

    assert_eq!(removed.state, ConfigEntryState::NotLoaded);
    assert!(test.opp.config_entries.get(&entry.entry_id).is_none());
    assert!(!test.opp.data.contains(&entry.entry_id));
    assert!(matches!(
        test.opp.config_entries.remove(&test.opp, &entry.entry_id).await,
        Err(ConfigEntriesError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reload_sets_up_again() {
    let test = TestOpenPeerPower::new();
    test.opp.integrations.register(Arc::new(MockIntegration::new("hue")));
    let entry = test.opp.config_entries.add(hue_entry()).unwrap();
    test.opp.config_entries.setup(&test.opp, &entry.entry_id).await.unwrap();

    assert!(test.opp.config_entries.reload(&test.opp, &entry.entry_id).await.unwrap());
    assert_eq!(
        test.opp.config_entries.get(&entry.entry_id).unwrap().state,
        ConfigEntryState::Loaded
    );
}
