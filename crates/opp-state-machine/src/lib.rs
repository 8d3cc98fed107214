//! State machine with domain indexing for Open Peer Power
//!
//! This crate provides the StateMachine, which tracks the current state of
//! all entities. Every write that changes something replaces the entity's
//! immutable [`State`] and fires `state_changed` with the old and new
//! snapshot. Entity ids can be reserved before their first state is
//! written so that two integrations cannot claim the same id.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opp_core::events::{StateChangedData, STATE_CHANGED};
use opp_core::{Attributes, Context, EntityId, Event, OppError, OppResult, State};
use opp_event_bus::SharedEventBus;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Which domains a query covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DomainFilter {
    /// Every domain
    #[default]
    All,
    /// Only these (lowercased) domains
    Domains(Vec<String>),
}

impl DomainFilter {
    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainFilter::All => true,
            DomainFilter::Domains(domains) => domains.iter().any(|d| d == domain),
        }
    }
}

impl From<&str> for DomainFilter {
    fn from(domain: &str) -> Self {
        DomainFilter::Domains(vec![domain.to_lowercase()])
    }
}

impl From<&[&str]> for DomainFilter {
    fn from(domains: &[&str]) -> Self {
        DomainFilter::Domains(domains.iter().map(|d| d.to_lowercase()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for DomainFilter {
    fn from(domains: [&str; N]) -> Self {
        DomainFilter::from(&domains[..])
    }
}

impl From<Vec<String>> for DomainFilter {
    fn from(domains: Vec<String>) -> Self {
        DomainFilter::Domains(domains.into_iter().map(|d| d.to_lowercase()).collect())
    }
}

/// Content of one entity id slot
enum Slot {
    /// Claimed by `reserve`, no state written yet
    Reserved,
    Populated(State),
}

/// The state machine tracks all entity states
pub struct StateMachine {
    /// Entity slots keyed by lowercase entity_id
    states: DashMap<String, Slot>,
    /// Populated entity_ids by domain, in insertion order
    domain_index: DashMap<String, Vec<String>>,
    /// Event bus for firing state change events
    event_bus: SharedEventBus,
}

impl StateMachine {
    /// Create a new state machine with the given event bus
    pub fn new(event_bus: SharedEventBus) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            event_bus,
        }
    }

    /// Set the state of an entity
    ///
    /// See [`StateMachine::set_with`].
    pub fn set(
        &self,
        entity_id: &str,
        new_state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> OppResult<State> {
        self.set_with(entity_id, new_state, Some(attributes), false, Some(context))
    }

    /// Set the state of an entity with every option
    ///
    /// The entity id is lowercased first. When neither the state value nor
    /// the attributes differ from the current snapshot (and `force_update`
    /// is false) nothing is written and no event fires; the current state
    /// is returned. Otherwise `last_changed` moves only if the value
    /// changed (or `force_update` is set), `last_updated` always moves, and
    /// `state_changed` is fired.
    #[instrument(skip(self, new_state, attributes, context))]
    pub fn set_with(
        &self,
        entity_id: &str,
        new_state: impl Into<String>,
        attributes: Option<Attributes>,
        force_update: bool,
        context: Option<Context>,
    ) -> OppResult<State> {
        let key = entity_id.to_lowercase();
        let parsed: EntityId = key
            .parse()
            .map_err(|_| OppError::InvalidEntityFormat(entity_id.to_string()))?;
        let new_state = new_state.into();
        let attributes = attributes.unwrap_or_default();

        let (old_state, state) = match self.states.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let old = match slot.get() {
                    Slot::Populated(old) => Some(old.clone()),
                    Slot::Reserved => None,
                };

                let (last_changed, last_updated) = match &old {
                    Some(old) => {
                        let same_state = old.state == new_state && !force_update;
                        if same_state && old.attributes == attributes {
                            trace!("State unchanged, skipping write");
                            return Ok(old.clone());
                        }
                        let now = Utc::now().max(old.last_updated);
                        (if same_state { old.last_changed } else { now }, now)
                    }
                    None => {
                        let now = Utc::now();
                        (now, now)
                    }
                };

                let state = State::with_timestamps(
                    parsed,
                    new_state,
                    attributes,
                    last_changed,
                    last_updated,
                    context.unwrap_or_default(),
                )?;
                slot.insert(Slot::Populated(state.clone()));
                (old, state)
            }
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let state = State::with_timestamps(
                    parsed,
                    new_state,
                    attributes,
                    now,
                    now,
                    context.unwrap_or_default(),
                )?;
                slot.insert(Slot::Populated(state.clone()));
                (None, state)
            }
        };

        if old_state.is_none() {
            self.domain_index
                .entry(state.domain().to_string())
                .or_default()
                .push(key);
        }

        debug!(
            state = %state.state,
            changed = old_state.as_ref().map(|s| s.state != state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.fire_state_changed(
            state.entity_id.clone(),
            old_state,
            Some(state.clone()),
            state.context.clone(),
        );
        Ok(state)
    }

    fn fire_state_changed(
        &self,
        entity_id: EntityId,
        old_state: Option<State>,
        new_state: Option<State>,
        context: Context,
    ) {
        let time_fired = new_state
            .as_ref()
            .map(|s| s.last_updated)
            .unwrap_or_else(Utc::now);
        let data = StateChangedData {
            entity_id,
            old_state,
            new_state,
        };
        let data = serde_json::to_value(&data).unwrap_or_default();
        self.event_bus
            .fire(Event::new(STATE_CHANGED, data, context).with_time_fired(time_fired));
    }

    /// Remove an entity, or release its reservation
    ///
    /// Fires `state_changed` with `new_state` set to null when a state was
    /// removed. Returns false if the entity had no state.
    #[instrument(skip(self, context))]
    pub fn remove(&self, entity_id: &str, context: Option<Context>) -> bool {
        let key = entity_id.to_lowercase();

        let old_state = match self.states.remove(&key) {
            Some((_, Slot::Populated(state))) => state,
            Some((_, Slot::Reserved)) => {
                trace!("Released reservation");
                return false;
            }
            None => return false,
        };

        if let Some(mut ids) = self.domain_index.get_mut(old_state.domain()) {
            ids.retain(|id| id != &key);
        }
        self.domain_index
            .remove_if(old_state.domain(), |_, ids| ids.is_empty());

        trace!("Removed entity state");
        self.fire_state_changed(
            old_state.entity_id.clone(),
            Some(old_state),
            None,
            context.unwrap_or_default(),
        );
        true
    }

    /// Claim an entity id before its first state is written
    ///
    /// Fails when the id is already reserved or has a state.
    pub fn reserve(&self, entity_id: &str) -> OppResult<()> {
        match self.states.entry(entity_id.to_lowercase()) {
            Entry::Occupied(_) => Err(OppError::Generic(format!(
                "entity id {entity_id} is already reserved or in use"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Reserved);
                Ok(())
            }
        }
    }

    /// Whether an entity id is neither reserved nor in use
    pub fn available(&self, entity_id: &str) -> bool {
        !self.states.contains_key(&entity_id.to_lowercase())
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        match self.states.get(&entity_id.to_lowercase()).as_deref() {
            Some(Slot::Populated(state)) => Some(state.clone()),
            _ => None,
        }
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get(entity_id).is_some_and(|s| s.state == state)
    }

    /// Entity ids, optionally restricted to some domains
    pub fn entity_ids(&self, filter: impl Into<DomainFilter>) -> Vec<String> {
        match filter.into() {
            DomainFilter::All => self
                .states
                .iter()
                .filter(|entry| matches!(entry.value(), Slot::Populated(_)))
                .map(|entry| entry.key().clone())
                .collect(),
            DomainFilter::Domains(domains) => domains
                .iter()
                .flat_map(|domain| {
                    self.domain_index
                        .get(domain)
                        .map(|ids| ids.clone())
                        .unwrap_or_default()
                })
                .collect(),
        }
    }

    /// Number of entities, optionally restricted to some domains
    pub fn entity_ids_count(&self, filter: impl Into<DomainFilter>) -> usize {
        match filter.into() {
            DomainFilter::All => self
                .states
                .iter()
                .filter(|entry| matches!(entry.value(), Slot::Populated(_)))
                .count(),
            DomainFilter::Domains(domains) => domains
                .iter()
                .map(|domain| self.domain_index.get(domain).map_or(0, |ids| ids.len()))
                .sum(),
        }
    }

    /// All states, optionally restricted to some domains
    pub fn all(&self, filter: impl Into<DomainFilter>) -> Vec<State> {
        let filter = filter.into();
        self.states
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Populated(state) if filter.matches(state.domain()) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Domains with at least one entity
    pub fn domains(&self) -> Vec<String> {
        self.domain_index.iter().map(|r| r.key().clone()).collect()
    }
}

/// Thread-safe wrapper for StateMachine
pub type SharedStateMachine = Arc<StateMachine>;
