//! # Configuration
//!
//! Two kinds of configuration live here:
//! - [`UnitConfig`]: how a unit is wired, fixed at construction.
//! - [`ConfigStore`]: runtime key/value settings pushed by peers through the
//!   `registerConfig` action. Merges are last-write-wins per key.

use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use unitwire::Role;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Construction-time settings of a unit.
///
/// Deserializable so a host process can load it from JSON; durations are in
/// milliseconds on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnitConfig {
    /// The role this unit plays.
    pub role: Role,
    /// Whether this unit accepts and multiplexes inbound connections.
    pub hub: bool,
    /// The role of the supervising unit that receives readiness announcements.
    pub parent_role: Role,
    /// The role a hub addresses its connections as.
    pub peer_role: Role,
    /// The application this unit belongs to, reported during the hub handshake.
    pub application: Option<String>,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Upper bound on outstanding requests. `None` leaves it unbounded.
    pub max_in_flight: Option<usize>,
    /// Buffer size of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            role: Role::Worker,
            hub: false,
            parent_role: Role::Main,
            peer_role: Role::Renderer,
            application: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_in_flight: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// `registerConfig` payloads must be JSON objects.
    NotAnObject(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject(kind) => write!(f, "config payload must be an object, got {}", kind),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Runtime settings of one unit.
#[derive(Debug, Default)]
pub struct ConfigStore {
    values: RwLock<Map<String, Value>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges the keys of `payload` into the store, overwriting shared keys.
    pub fn merge(&self, payload: Value) -> Result<()> {
        let incoming = match payload {
            Value::Object(map) => map,
            Value::Null => return Err(Error::NotAnObject("null")),
            Value::Bool(_) => return Err(Error::NotAnObject("bool")),
            Value::Number(_) => return Err(Error::NotAnObject("number")),
            Value::String(_) => return Err(Error::NotAnObject("string")),
            Value::Array(_) => return Err(Error::NotAnObject("array")),
        };

        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.extend(incoming);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
