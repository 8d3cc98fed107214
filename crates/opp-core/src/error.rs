//! Error taxonomy shared by the core registries

use std::fmt;

use thiserror::Error;

use crate::Context;

/// Result type for core operations
pub type OppResult<T> = Result<T, OppError>;

/// Errors raised synchronously by the core registries
#[derive(Debug, Clone, Error)]
pub enum OppError {
    /// Entity id does not match `<domain>.<object_id>`
    #[error("Invalid entity id encountered: {0}. Format should be <domain>.<object_id>")]
    InvalidEntityFormat(String),

    /// State value longer than the allowed maximum
    #[error(
        "Invalid state encountered for entity id: {entity_id}. State max length is {} characters.",
        crate::MAX_LENGTH_STATE_STATE
    )]
    InvalidState { entity_id: String, state: String },

    #[error(transparent)]
    Unauthorized(#[from] Unauthorized),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// Catch-all for misuse of the core API
    #[error("{0}")]
    Generic(String),
}

/// Permission failure with enough detail to render an actionable message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unauthorized {
    pub context: Option<Context>,
    pub user_id: Option<String>,
    pub entity_id: Option<String>,
    pub config_entry_id: Option<String>,
    pub perm_category: Option<String>,
    pub permission: Option<String>,
}

impl Unauthorized {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: Context) -> Self {
        if self.user_id.is_none() {
            self.user_id = context.user_id.clone();
        }
        self.context = Some(context);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_config_entry_id(mut self, config_entry_id: impl Into<String>) -> Self {
        self.config_entry_id = Some(config_entry_id.into());
        self
    }

    pub fn with_permission(
        mut self,
        perm_category: impl Into<String>,
        permission: impl Into<String>,
    ) -> Self {
        self.perm_category = Some(perm_category.into());
        self.permission = Some(permission.into());
        self
    }
}

impl fmt::Display for Unauthorized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unauthorized")?;
        let details: Vec<String> = [
            ("user_id", &self.user_id),
            ("entity_id", &self.entity_id),
            ("config_entry_id", &self.config_entry_id),
            ("perm_category", &self.perm_category),
            ("permission", &self.permission),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| format!("{key}={v}")))
        .collect();

        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for Unauthorized {}

/// Structured condition evaluation failure
///
/// Composite conditions (`and`, `or`, `not`) wrap the failures of their
/// children so the rendered output shows exactly which leaf failed:
///
/// ```text
/// In 'and' (item 2 of 2):
///   In 'state' condition: unknown entity light.missing
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// Leaf failure of a single condition
    Message { kind: String, message: String },

    /// Failure of one item inside a composite condition
    Index {
        kind: String,
        index: usize,
        total: usize,
        error: Box<ConditionError>,
    },

    /// Several failures reported together
    Container {
        kind: String,
        errors: Vec<ConditionError>,
    },
}

impl ConditionError {
    pub fn message(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ConditionError::Message {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wrap `error` as item `index` (zero based) of `total`
    pub fn index(
        kind: impl Into<String>,
        index: usize,
        total: usize,
        error: ConditionError,
    ) -> Self {
        ConditionError::Index {
            kind: kind.into(),
            index,
            total,
            error: Box::new(error),
        }
    }

    pub fn container(kind: impl Into<String>, errors: Vec<ConditionError>) -> Self {
        ConditionError::Container {
            kind: kind.into(),
            errors,
        }
    }

    /// Rendered lines, indented two spaces per nesting level
    pub fn output(&self, indent: usize) -> Vec<String> {
        let pad = "  ".repeat(indent);
        match self {
            ConditionError::Message { kind, message } => {
                vec![format!("{pad}In '{kind}' condition: {message}")]
            }
            ConditionError::Index {
                kind,
                index,
                total,
                error,
            } => {
                let header = if *total > 1 {
                    format!("{pad}In '{kind}' (item {} of {total}):", index + 1)
                } else {
                    format!("{pad}In '{kind}':")
                };
                let mut lines = vec![header];
                lines.extend(error.output(indent + 1));
                lines
            }
            ConditionError::Container { errors, .. } => {
                errors.iter().flat_map(|e| e.output(indent)).collect()
            }
        }
    }
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.output(0).join("\n"))
    }
}

impl std::error::Error for ConditionError {}
