//! The Open Peer Power orchestrator
//!
//! [`OpenPeerPower`] owns the scheduler, event bus, state machine, service
//! registry and configuration, and drives the core lifecycle:
//!
//! ```text
//! NotRunning → Starting → Running → Stopping → FinalWrite → NotRunning → Stopped
//!                                 ↘ Restarting → FinalWrite → NotRunning → Starting
//! ```

use opp_config::{Config, ConfigError, CoreConfig, SharedConfig};
use opp_core::events::{
    COMPONENT_LOADED, CORE_CONFIG_UPDATE, OPENPEERPOWER_CLOSE, OPENPEERPOWER_FINAL_WRITE,
    OPENPEERPOWER_START, OPENPEERPOWER_STARTED, OPENPEERPOWER_STOP,
};
use opp_core::{Context, CoreState, SharedCoreState};
use opp_event_bus::{EventBus, SharedEventBus};
use opp_scheduler::{
    HandlerResult, Job, JobHandle, JobScheduler, SharedScheduler, BLOCK_LOG_TIMEOUT,
};
use opp_service_registry::{ServiceRegistry, SharedServiceRegistry};
use opp_state_machine::{SharedStateMachine, StateMachine};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::data::DataRegistry;
use crate::integration::{ConfigEntries, IntegrationTable, SetupError};
use crate::timer::start_timer;

/// Exit code asking the supervisor to start the process again
pub const RESTART_EXIT_CODE: i32 = 100;

/// How long the start event's listeners may take before startup continues
pub const START_TIMEOUT: Duration = Duration::from_secs(15);
pub const STAGE_1_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(100);
pub const STAGE_2_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);
pub const STAGE_3_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the orchestrator
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Open Peer Power is already running (state {0})")]
    AlreadyRunning(CoreState),

    #[error("Integration {0} not found")]
    IntegrationNotFound(String),

    #[error("Error during setup of component {domain}: {error}")]
    Setup { domain: String, error: SetupError },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Tunables of the orchestrator
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Interval of the "still waiting" diagnostics in `block_till_done`
    pub block_log_timeout: Duration,
    pub start_timeout: Duration,
    pub stage_1_shutdown_timeout: Duration,
    pub stage_2_shutdown_timeout: Duration,
    pub stage_3_shutdown_timeout: Duration,
    /// Start the `time_changed` clock once running
    pub run_timer: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            block_log_timeout: BLOCK_LOG_TIMEOUT,
            start_timeout: START_TIMEOUT,
            stage_1_shutdown_timeout: STAGE_1_SHUTDOWN_TIMEOUT,
            stage_2_shutdown_timeout: STAGE_2_SHUTDOWN_TIMEOUT,
            stage_3_shutdown_timeout: STAGE_3_SHUTDOWN_TIMEOUT,
            run_timer: true,
        }
    }
}

/// Root object of an Open Peer Power instance
pub struct OpenPeerPower {
    pub scheduler: SharedScheduler,
    pub bus: SharedEventBus,
    pub states: SharedStateMachine,
    pub services: SharedServiceRegistry,
    pub config: SharedConfig,
    /// Per-integration objects, keyed by domain
    pub data: DataRegistry,
    pub integrations: IntegrationTable,
    pub config_entries: ConfigEntries,
    state: SharedCoreState,
    options: CoreOptions,
    exit_code: AtomicI32,
    stopped: watch::Sender<bool>,
}

impl OpenPeerPower {
    /// Create an instance bound to the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(core: CoreConfig, options: CoreOptions) -> Arc<Self> {
        let scheduler =
            Arc::new(JobScheduler::current().with_block_log_timeout(options.block_log_timeout));
        let bus = Arc::new(EventBus::new(scheduler.clone()));
        let states = Arc::new(StateMachine::new(bus.clone()));
        let services = Arc::new(ServiceRegistry::new(bus.clone()));
        let state = SharedCoreState::new();
        let config = Arc::new(Config::new(core, bus.clone(), state.clone()));
        let (stopped, _) = watch::channel(false);

        Arc::new(Self {
            scheduler,
            bus,
            states,
            services,
            config,
            data: DataRegistry::new(),
            integrations: IntegrationTable::new(),
            config_entries: ConfigEntries::new(),
            state,
            options,
            exit_code: AtomicI32::new(0),
            stopped,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoreState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), CoreState::Starting | CoreState::Running)
    }

    pub fn is_stopping(&self) -> bool {
        matches!(
            self.state(),
            CoreState::Stopping | CoreState::FinalWrite | CoreState::Restarting
        )
    }

    /// Exit code recorded by the last `stop`
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    fn set_state(&self, state: CoreState) {
        let previous = self.state.set(state);
        debug!("Core state: {} -> {}", previous, state);
    }

    /// Schedule a job; see [`JobScheduler::add_job`]
    pub fn add_job<A, R>(&self, job: &Job<A, R>, arg: A) -> JobHandle<R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        self.scheduler.add_job(job, arg)
    }

    /// Track a future as a pending task
    pub fn create_task<F>(&self, name: impl AsRef<str>, fut: F) -> JobHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.scheduler.create_task(name, fut)
    }

    /// Run a blocking function on the worker pool
    pub fn add_executor_job<F, R>(&self, name: impl AsRef<str>, f: F) -> JobHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.scheduler.add_executor_job(name, f)
    }

    /// Wait until no tracked task is pending
    pub async fn block_till_done(&self) {
        self.scheduler.block_till_done().await;
    }

    fn fire_lifecycle(&self, event_type: &'static str) {
        self.bus.fire_data(event_type, json!({}), Context::new());
    }

    /// Start the instance and wait for the start event's listeners
    ///
    /// Listeners that take longer than `start_timeout` are left running.
    pub async fn start(&self) {
        info!("Starting Open Peer Power");
        self.set_state(CoreState::Starting);
        self.fire_lifecycle(CORE_CONFIG_UPDATE);
        self.fire_lifecycle(OPENPEERPOWER_START);

        if timeout(self.options.start_timeout, self.scheduler.block_till_done())
            .await
            .is_err()
        {
            warn!(
                "Something is blocking Open Peer Power from wrapping up the start up phase. \
                 We're going to continue anyway"
            );
            for task in self.scheduler.pending_tasks() {
                debug!(task = %task.name, age = ?task.age, "Still pending after start");
            }
        }

        // Give a concurrent stop the chance to run before declaring running
        tokio::task::yield_now().await;

        if self.state() != CoreState::Starting {
            warn!(
                "Open Peer Power startup has been interrupted. Its state may be inconsistent"
            );
            return;
        }

        self.set_state(CoreState::Running);
        self.fire_lifecycle(CORE_CONFIG_UPDATE);
        self.fire_lifecycle(OPENPEERPOWER_STARTED);

        if self.options.run_timer {
            let timer = start_timer(self.bus.clone()).abort_handle();
            self.bus.listen_once(
                OPENPEERPOWER_STOP,
                Job::callback(move |_| -> HandlerResult {
                    timer.abort();
                    Ok(())
                })
                .named("stop_timer"),
            );
        }
        info!("Open Peer Power started");
    }

    /// Start, then wait until stopped
    ///
    /// Returns the exit code given to [`stop`](Self::stop).
    pub async fn run(&self) -> Result<i32, CoreError> {
        let state = self.state();
        if state != CoreState::NotRunning {
            return Err(CoreError::AlreadyRunning(state));
        }

        self.stopped.send_replace(false);
        let mut stopped = self.stopped.subscribe();
        self.start().await;

        while !*stopped.borrow_and_update() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
        Ok(self.exit_code())
    }

    /// Wait for pending work, giving up after `limit`
    async fn drain(&self, stage: u8, limit: Duration) -> bool {
        if timeout(limit, self.scheduler.block_till_done()).await.is_ok() {
            return true;
        }
        warn!(
            "Timed out waiting for shutdown stage {} to complete, the shutdown will continue",
            stage
        );
        for task in self.scheduler.pending_tasks() {
            warn!(
                task = %task.name,
                age = ?task.age,
                "Task still pending at shutdown stage {}",
                stage
            );
        }
        false
    }

    /// Run the three shutdown stages
    ///
    /// Returns false when the request was ignored.
    async fn shutdown(&self, exit_code: i32, stopping: CoreState) -> bool {
        match self.state() {
            CoreState::NotRunning | CoreState::Stopped => {
                debug!("Stop requested while not running: ignored");
                return false;
            }
            CoreState::Stopping | CoreState::FinalWrite | CoreState::Restarting => {
                info!("Stop called twice: ignored");
                return false;
            }
            CoreState::Starting => {
                warn!("Stop called before startup is complete");
            }
            CoreState::Running => {}
        }

        // Stage 1: integrations stop their own work
        self.set_state(stopping);
        self.fire_lifecycle(OPENPEERPOWER_STOP);
        self.drain(1, self.options.stage_1_shutdown_timeout).await;

        // Stage 2: last chance to persist
        self.set_state(CoreState::FinalWrite);
        self.fire_lifecycle(OPENPEERPOWER_FINAL_WRITE);
        self.drain(2, self.options.stage_2_shutdown_timeout).await;

        // Stage 3: connections close, nothing new is accepted from other threads
        self.set_state(CoreState::NotRunning);
        self.fire_lifecycle(OPENPEERPOWER_CLOSE);
        self.scheduler.shutdown_run_callback_threadsafe();
        if !self.drain(3, self.options.stage_3_shutdown_timeout).await {
            let cancelled = self.scheduler.cancel_pending();
            warn!("Cancelled {} pending tasks at shutdown", cancelled.len());
        }

        self.exit_code.store(exit_code, Ordering::SeqCst);
        true
    }

    /// Stop the instance
    ///
    /// Ignored when not running or already stopping.
    pub async fn stop(&self, exit_code: i32) {
        if !self.shutdown(exit_code, CoreState::Stopping).await {
            return;
        }
        self.set_state(CoreState::Stopped);
        self.stopped.send_replace(true);
        info!("Open Peer Power stopped");
    }

    /// Shut down and start again in-process
    pub async fn restart(&self) {
        if !self.shutdown(RESTART_EXIT_CODE, CoreState::Restarting).await {
            return;
        }
        self.scheduler.resume_run_callback_threadsafe();
        self.start().await;
    }

    /// Set up an integration and its config entries
    ///
    /// `config` is the full configuration; the integration receives its own
    /// section (null when absent). Returns `Ok(false)` when the integration
    /// declined to load.
    pub async fn setup_component(
        self: &Arc<Self>,
        domain: &str,
        config: &serde_yaml::Value,
    ) -> Result<bool, CoreError> {
        let domain = domain.to_lowercase();
        if self.config.has_component(&domain).await {
            return Ok(true);
        }

        let integration = self
            .integrations
            .get(&domain)
            .ok_or_else(|| CoreError::IntegrationNotFound(domain.clone()))?;

        let section = config
            .get(domain.as_str())
            .cloned()
            .unwrap_or(serde_yaml::Value::Null);

        info!("Setting up {}", domain);
        match integration.setup(self, &section).await {
            Ok(true) => {}
            Ok(false) => {
                error!("Integration {} failed to initialize", domain);
                return Ok(false);
            }
            Err(error) => {
                error!("Error during setup of component {}: {}", domain, error);
                return Err(CoreError::Setup { domain, error });
            }
        }

        for entry in self.config_entries.entries(Some(&domain)) {
            if let Err(err) = self.config_entries.setup(self, &entry.entry_id).await {
                error!("Error setting up config entry {}: {}", entry.entry_id, err);
            }
        }

        self.config.add_component(domain.clone()).await;
        self.bus
            .fire_data(COMPONENT_LOADED, json!({ "component": domain }), Context::new());
        Ok(true)
    }
}

impl fmt::Debug for OpenPeerPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenPeerPower")
            .field("state", &self.state())
            .field("pending_tasks", &self.scheduler.pending_count())
            .field("integrations", &self.integrations.domains())
            .finish_non_exhaustive()
    }
}

/// Thread-safe wrapper for OpenPeerPower
pub type SharedOpenPeerPower = Arc<OpenPeerPower>;
