//! `<domain>.<object_id>` identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityIdPart {
    Domain,
    ObjectId,
}

impl fmt::Display for EntityIdPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityIdPart::Domain => "domain",
            EntityIdPart::ObjectId => "object id",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("{0:?} is not of the form <domain>.<object_id>")]
    NotDotted(String),

    #[error("{part} {segment:?} may only use a-z, 0-9 and single inner underscores")]
    BadSegment { part: EntityIdPart, segment: String },
}

/// Validated entity id, e.g. `light.living_room`
///
/// Kept as one string so it can be borrowed as `&str` without formatting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    full: String,
    dot: usize,
}

impl EntityId {
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let mut full = domain.into();
        let dot = full.len();
        full.push('.');
        full.push_str(&object_id.into());
        Self::checked(full, dot)
    }

    /// Lowercase before validating, so `LIGHT.Bowl` names `light.bowl`
    pub fn parse_lenient(s: &str) -> Result<Self, EntityIdError> {
        s.to_lowercase().try_into()
    }

    pub fn domain(&self) -> &str {
        &self.full[..self.dot]
    }

    pub fn object_id(&self) -> &str {
        &self.full[self.dot + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    fn checked(full: String, dot: usize) -> Result<Self, EntityIdError> {
        let (domain, object_id) = (&full[..dot], &full[dot + 1..]);
        if object_id.contains('.') {
            return Err(EntityIdError::NotDotted(full));
        }
        let segments = [
            (EntityIdPart::Domain, domain),
            (EntityIdPart::ObjectId, object_id),
        ];
        for (part, segment) in segments {
            if !segment_ok(segment) {
                return Err(EntityIdError::BadSegment {
                    part,
                    segment: segment.to_string(),
                });
            }
        }
        Ok(Self { full, dot })
    }
}

// Non-empty, [a-z0-9_] only, underscores strictly between other characters
fn segment_ok(segment: &str) -> bool {
    segment.split('_').all(|word| {
        !word.is_empty()
            && word
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    })
}

pub fn valid_entity_id(entity_id: &str) -> bool {
    entity_id.parse::<EntityId>().is_ok()
}

/// Split at the first `.` without validating either side
pub fn split_entity_id(entity_id: &str) -> Option<(&str, &str)> {
    entity_id.split_once('.')
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_string().try_into()
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(full: String) -> Result<Self, Self::Error> {
        match full.find('.') {
            Some(dot) => Self::checked(full, dot),
            None => Err(EntityIdError::NotDotted(full)),
        }
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.full
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}
