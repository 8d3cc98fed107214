//! Service registry for Open Peer Power
//!
//! This crate provides the ServiceRegistry, which manages all registered
//! services. Services are the primary way to control entities and trigger
//! actions. Every call is announced on the bus with a `call_service` event
//! before the handler runs.

mod schema;

pub use schema::{Coerce, FieldSchema, JsonSchema, Schema, SchemaError};

use dashmap::DashMap;
use opp_core::events::{CallServiceData, ServiceEventData, SERVICE_REGISTERED, SERVICE_REMOVED};
use opp_core::{Context, ServiceCall};
use opp_event_bus::SharedEventBus;
use opp_scheduler::{HandlerResult, Job, SchedulerError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Service handler job
pub type ServiceHandler = Job<ServiceCall, HandlerResult>;

/// Shared schema attached to a service
pub type SharedSchema = Arc<dyn Schema>;

/// Result type for service calls
pub type ServiceResult = Result<(), ServiceError>;

/// Errors that can occur when calling services
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unable to find service {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("Invalid data for {domain}.{service}: {error}")]
    InvalidData {
        domain: String,
        service: String,
        error: SchemaError,
    },

    #[error("Error executing service {service_id}: {error:#}")]
    Handler {
        service_id: String,
        error: anyhow::Error,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// A registered service
#[derive(Clone)]
pub struct Service {
    pub job: ServiceHandler,
    pub schema: Option<SharedSchema>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("job", &self.job)
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

/// The service registry manages all registered services
pub struct ServiceRegistry {
    /// Services by lowercase domain, then lowercase service name
    services: DashMap<String, HashMap<String, Service>>,
    event_bus: SharedEventBus,
}

impl ServiceRegistry {
    /// Create a registry announcing changes on `event_bus`
    pub fn new(event_bus: SharedEventBus) -> Self {
        Self {
            services: DashMap::new(),
            event_bus,
        }
    }

    /// Register a service, replacing any previous handler
    ///
    /// Fires `service_registered`.
    #[instrument(skip(self, handler, schema))]
    pub fn register(
        &self,
        domain: &str,
        service: &str,
        handler: ServiceHandler,
        schema: Option<SharedSchema>,
    ) {
        let domain = domain.to_lowercase();
        let service = service.to_lowercase();

        debug!(job = %handler.name(), "Registering service");

        self.services.entry(domain.clone()).or_default().insert(
            service.clone(),
            Service {
                job: handler,
                schema,
            },
        );

        self.fire_service_event(SERVICE_REGISTERED, domain, service);
    }

    /// Remove a service
    ///
    /// Fires `service_removed`. Removing an unknown service only logs.
    #[instrument(skip(self))]
    pub fn remove(&self, domain: &str, service: &str) {
        let domain = domain.to_lowercase();
        let service = service.to_lowercase();

        let removed = self
            .services
            .get_mut(&domain)
            .and_then(|mut services| services.remove(&service))
            .is_some();
        self.services
            .remove_if(&domain, |_, services| services.is_empty());

        if !removed {
            warn!("Unable to remove unknown service {domain}/{service}");
            return;
        }

        debug!("Removed service");
        self.fire_service_event(SERVICE_REMOVED, domain, service);
    }

    fn fire_service_event(&self, event_type: &str, domain: String, service: String) {
        let data = serde_json::to_value(ServiceEventData { domain, service }).unwrap_or_default();
        self.event_bus.fire_data(event_type, data, Context::new());
    }

    /// Check if a service exists
    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services
            .get(&domain.to_lowercase())
            .is_some_and(|services| services.contains_key(&service.to_lowercase()))
    }

    /// Snapshot of all services grouped by domain
    pub fn services(&self) -> HashMap<String, HashMap<String, Service>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Call a service
    ///
    /// Entries of `target` are merged into `service_data`, which is then
    /// validated against the service schema. The `call_service` event
    /// carries the data as sent, while the handler receives the validated
    /// data.
    ///
    /// A blocking call waits for the handler and returns its error; dropping
    /// the returned future cancels the handler. A non-blocking call runs the
    /// handler as a separate task, even a callback one, and logs its failures.
    #[instrument(skip(self, service_data, context, target))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        blocking: bool,
        context: Option<Context>,
        target: Option<Value>,
    ) -> ServiceResult {
        let domain = domain.to_lowercase();
        let service = service.to_lowercase();
        let context = context.unwrap_or_default();

        let handler = self
            .services
            .get(&domain)
            .and_then(|services| services.get(&service).cloned())
            .ok_or_else(|| {
                warn!("Unable to find service {domain}.{service}");
                ServiceError::NotFound {
                    domain: domain.clone(),
                    service: service.clone(),
                }
            })?;

        let mut service_data = service_data.unwrap_or_else(|| json!({}));
        if let (Some(Value::Object(target)), Some(data)) = (target, service_data.as_object_mut()) {
            data.extend(target);
        }

        let processed = match &handler.schema {
            Some(schema) => schema.validate(&service_data).map_err(|error| {
                warn!("Invalid data for service call {domain}.{service}: {error}");
                ServiceError::InvalidData {
                    domain: domain.clone(),
                    service: service.clone(),
                    error,
                }
            })?,
            None => service_data.clone(),
        };

        let call = ServiceCall::new(domain.clone(), service.clone(), processed, context.clone());

        self.event_bus.fire_typed(
            CallServiceData {
                domain,
                service,
                service_data,
            },
            context,
        );

        let service_id = call.service_id();
        let scheduler = self.event_bus.scheduler();
        if !blocking {
            scheduler.spawn_detached(&handler.job, call, &service_id);
            return Ok(());
        }

        debug!("Calling service");
        scheduler
            .add_job(&handler.job, call)
            .cancel_on_drop()
            .await?
            .map_err(|error| ServiceError::Handler { service_id, error })
    }
}

/// Thread-safe wrapper for ServiceRegistry
pub type SharedServiceRegistry = Arc<ServiceRegistry>;
