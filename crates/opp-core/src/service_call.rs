//! Service call type handed to service handlers

use crate::Context;
use serde::{Deserialize, Serialize};

/// A call to a registered service
///
/// `data` holds the service data after schema validation, so handlers see
/// coerced values while the `call_service` event keeps what the caller sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// The domain the service belongs to (e.g., "light")
    pub domain: String,

    /// The service name (e.g., "turn_on")
    pub service: String,

    /// Validated service data
    pub data: serde_json::Value,

    /// Context tracking who initiated this call
    pub context: Context,
}

impl ServiceCall {
    /// Create a new service call, lowercasing domain and service
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        data: serde_json::Value,
        context: Context,
    ) -> Self {
        Self {
            domain: domain.into().to_lowercase(),
            service: service.into().to_lowercase(),
            data,
            context,
        }
    }

    /// Full service identifier (domain.service)
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Get a typed value from the service data
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Entity ids targeted by the call, accepting a single string or a list
    pub fn entity_ids(&self) -> Vec<String> {
        match self.data.get("entity_id") {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }
}
