//! Context type for tracking request origin and causality

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Context for tracking the origin and causality of events and service calls
///
/// Every event, state change and service call carries a Context that
/// identifies who initiated the action and allows tracing the chain of
/// actions that resulted from it. A Context is never mutated once built;
/// the `with_*` helpers consume and return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// Parent context ID for tracking causality chains
    #[serde(default)]
    pub parent_id: Option<String>,

    /// User ID that initiated this action (if any)
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self::with_id(Ulid::new().to_string())
    }

    /// Create a context with a caller supplied ID
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            user_id: None,
        }
    }

    /// Create a new context triggered by the given user
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self::new().with_user_id(user_id)
    }

    /// Attach a user id
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a parent context id
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Create a child context inheriting the user, with this context as parent
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: Some(self.id.clone()),
            user_id: self.user_id.clone(),
        }
    }

    /// Dictionary representation used in event and state payloads
    pub fn as_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "parent_id": self.parent_id,
            "user_id": self.user_id,
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
