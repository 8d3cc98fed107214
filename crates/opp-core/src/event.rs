//! Event types for the event bus

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dt::isoformat;
use crate::Context;

/// Payload with a fixed event type, fired through the typed bus API
pub trait EventData: Clone + Send + Sync + 'static {
    fn event_type() -> &'static str;
}

/// Name of an event, `*` listens to all of them
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn match_all() -> Self {
        crate::MATCH_ALL.into()
    }

    pub fn is_match_all(&self) -> bool {
        self == crate::MATCH_ALL
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl PartialEq<str> for EventType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the event was fired on this instance or received from elsewhere
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOrigin {
    #[default]
    Local,
    Remote,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Local => "LOCAL",
            EventOrigin::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event fired on the event bus
///
/// Events are immutable once built; fields are read through accessors. The
/// dictionary form returned by [`Event::as_dict`] is computed on first use
/// and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    event_type: EventType,
    data: T,
    origin: EventOrigin,
    time_fired: DateTime<Utc>,
    context: Context,

    #[serde(skip)]
    dict: OnceLock<serde_json::Value>,
}

impl<T> Event<T> {
    /// Create a new local event stamped with the current time
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: EventOrigin::Local,
            time_fired: Utc::now(),
            context,
            dict: OnceLock::new(),
        }
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self.dict = OnceLock::new();
        self
    }

    pub fn with_time_fired(mut self, time_fired: DateTime<Utc>) -> Self {
        self.time_fired = time_fired;
        self.dict = OnceLock::new();
        self
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn origin(&self) -> EventOrigin {
        self.origin
    }

    pub fn time_fired(&self) -> DateTime<Utc> {
        self.time_fired
    }

    /// Context of the change that caused this event
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T: EventData> Event<T> {
    /// Create a typed event from EventData
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}

impl<T: Serialize> Event<T> {
    /// Dictionary representation of the event
    ///
    /// Repeated calls return the same cached value.
    pub fn as_dict(&self) -> &serde_json::Value {
        self.dict.get_or_init(|| {
            serde_json::json!({
                "event_type": self.event_type.as_str(),
                "data": serde_json::to_value(&self.data).unwrap_or(serde_json::Value::Null),
                "origin": self.origin.to_string(),
                "time_fired": isoformat(&self.time_fired),
                "context": self.context.as_dict(),
            })
        })
    }
}

impl Event<serde_json::Value> {
    /// Deserialize the JSON payload into a typed structure
    pub fn data_as<D: DeserializeOwned>(&self) -> Option<D> {
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Get a single value from the payload
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

impl<T: PartialEq> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        self.event_type == other.event_type
            && self.data == other.data
            && self.origin == other.origin
            && self.time_fired == other.time_fired
            && self.context == other.context
    }
}

impl<T: fmt::Debug> fmt::Display for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            EventOrigin::Local => "L",
            EventOrigin::Remote => "R",
        };
        write!(f, "<Event {}[{}]: {:?}>", self.event_type, origin, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_dict_is_cached() {
        let event = Event::new("some_type", json!({"some": "attr"}), Context::new());

        let first = event.as_dict();
        let second = event.as_dict();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first["event_type"], "some_type");
        assert_eq!(first["data"]["some"], "attr");
        assert_eq!(first["origin"], "LOCAL");
        assert_eq!(first["context"]["id"], json!(event.context().id));
    }

    #[test]
    fn test_equality_ignores_cache() {
        let now = Utc::now();
        let ctx = Context::new();
        let a = Event::new("t", json!({"a": 1}), ctx.clone()).with_time_fired(now);
        let b = Event::new("t", json!({"a": 1}), ctx).with_time_fired(now);

        let _ = a.as_dict();
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_origin(EventOrigin::Remote));
    }

    #[test]
    fn test_accessors_agree_with_dict() {
        let ctx = Context::new();
        let event = Event::new("t", json!({"n": 1}), ctx.clone()).with_origin(EventOrigin::Remote);
        let dict = event.as_dict().clone();

        assert_eq!(event.event_type(), "t");
        assert_eq!(event.data(), &dict["data"]);
        assert_eq!(event.origin(), EventOrigin::Remote);
        assert_eq!(event.context(), &ctx);
        assert_eq!(dict["time_fired"], isoformat(&event.time_fired()));
        assert_eq!(event.into_data(), json!({"n": 1}));
    }

    #[test]
    fn test_remote_origin_in_dict() {
        let event = Event::new("t", json!({}), Context::new()).with_origin(EventOrigin::Remote);
        assert_eq!(event.as_dict()["origin"], "REMOTE");
    }

    #[test]
    fn test_display() {
        let event = Event::new("test_event", json!({"x": 1}), Context::new());
        assert!(event.to_string().starts_with("<Event test_event[L]:"));
    }
}
