//! State type representing an entity's current state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dt::{isoformat, parse_datetime};
use crate::{Context, EntityId, OppError, MAX_LENGTH_STATE_STATE};

/// Attribute mapping carried by a state
pub type Attributes = HashMap<String, serde_json::Value>;

/// Test if a state value is valid
pub fn valid_state(state: &str) -> bool {
    state.chars().count() <= MAX_LENGTH_STATE_STATE
}

/// Immutable snapshot of an entity at a point in time
///
/// `last_changed` only moves when the state value changes, `last_updated`
/// moves on every write; `last_changed <= last_updated` always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: Attributes,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last written
    pub last_updated: DateTime<Utc>,

    /// Context of the change that created this state
    pub context: Context,
}

impl State {
    /// Create a new state stamped with the current time
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> Result<Self, OppError> {
        let now = Utc::now();
        Self::with_timestamps(entity_id, state, attributes, now, now, context)
    }

    /// Create a state with explicit timestamps
    ///
    /// `last_changed` is clamped so that it never lies after `last_updated`.
    pub fn with_timestamps(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        last_changed: DateTime<Utc>,
        last_updated: DateTime<Utc>,
        context: Context,
    ) -> Result<Self, OppError> {
        let state = state.into();
        if !valid_state(&state) {
            return Err(OppError::InvalidState {
                entity_id: entity_id.to_string(),
                state,
            });
        }

        Ok(Self {
            entity_id,
            state,
            attributes,
            last_changed: last_changed.min(last_updated),
            last_updated,
            context,
        })
    }

    /// Domain of the entity
    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }

    /// Object id of the entity
    pub fn object_id(&self) -> &str {
        self.entity_id.object_id()
    }

    /// Friendly name, falling back to the object id with spaces
    pub fn name(&self) -> String {
        self.attributes
            .get("friendly_name")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| self.object_id().replace('_', " "))
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Dictionary representation of the state
    pub fn as_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "entity_id": self.entity_id.to_string(),
            "state": self.state,
            "attributes": self.attributes,
            "last_changed": isoformat(&self.last_changed),
            "last_updated": isoformat(&self.last_updated),
            "context": self.context.as_dict(),
        })
    }

    /// Rebuild a state from its dictionary representation
    ///
    /// Returns `None` when required keys are missing or invalid.
    pub fn from_dict(value: &serde_json::Value) -> Option<Self> {
        let entity_id: EntityId = value.get("entity_id")?.as_str()?.parse().ok()?;
        let state = value.get("state")?.as_str()?;

        let attributes = match value.get("attributes") {
            Some(serde_json::Value::Object(map)) => {
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            _ => Attributes::new(),
        };

        let last_changed = value
            .get("last_changed")
            .and_then(|v| v.as_str())
            .and_then(parse_datetime);
        let last_updated = value
            .get("last_updated")
            .and_then(|v| v.as_str())
            .and_then(parse_datetime);
        let (last_changed, last_updated) = match (last_changed, last_updated) {
            (Some(changed), Some(updated)) => (changed, updated),
            (Some(changed), None) => (changed, changed),
            (None, Some(updated)) => (updated, updated),
            (None, None) => {
                let now = Utc::now();
                (now, now)
            }
        };

        let context = match value.get("context") {
            Some(ctx) if ctx.is_object() => serde_json::from_value(ctx.clone()).ok()?,
            _ => Context::new(),
        };

        Self::with_timestamps(
            entity_id,
            state,
            attributes,
            last_changed,
            last_updated,
            context,
        )
        .ok()
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
            && self.context == other.context
    }
}
