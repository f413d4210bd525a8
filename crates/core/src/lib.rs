//! Vigil core types: change events, resource snapshots, errors, clock.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod prelude {
    pub use super::{ChangeEvent, Clock, Error, Op, ResourceId, ResourceSnapshot, SystemClock};
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot compare {left} against {right}: kinds differ")]
    InvalidComparison { left: String, right: String },
    #[error("unsupported event shape: {0}")]
    UnsupportedEventShape(String),
    #[error("malformed change event: {0}")]
    InvalidEvent(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
}

/// Stable identity of a resource across its snapshots over time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub namespace: Option<String>,
    pub name: String,
    pub kind: String,
}

/// One point-in-time state of a named, namespaced resource.
///
/// Holds the raw object as received from the watch stream and exposes the
/// handful of metadata fields the engine cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    raw: Value,
}

impl ResourceSnapshot {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn kind(&self) -> &str {
        self.raw.get("kind").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.meta_str("name").unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace")
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            namespace: self.namespace().map(|s| s.to_string()),
            name: self.name().to_string(),
            kind: self.kind().to_string(),
        }
    }

    pub fn labels(&self) -> Vec<(&str, &str)> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name of the first owner reference, if the object has any.
    pub fn owner_name(&self) -> Option<&str> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|o| o.as_array())
            .and_then(|a| a.first())
            .and_then(|r| r.get("name"))
            .and_then(|n| n.as_str())
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
    }
}

/// A state change for one resource, with the snapshot before the change when
/// one exists. `previous` is absent exactly for `Create`.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: Op,
    pub current: ResourceSnapshot,
    pub previous: Option<ResourceSnapshot>,
}

impl ChangeEvent {
    pub fn new(
        op: Op,
        current: ResourceSnapshot,
        previous: Option<ResourceSnapshot>,
    ) -> Result<Self, Error> {
        match (op, previous.is_some()) {
            (Op::Create, true) => Err(Error::InvalidEvent(
                "create event carries a previous snapshot".into(),
            )),
            (Op::Update, false) => Err(Error::InvalidEvent(
                "update event missing previous snapshot".into(),
            )),
            _ => Ok(Self { op, current, previous }),
        }
    }

    pub fn created(current: ResourceSnapshot) -> Self {
        Self { op: Op::Create, current, previous: None }
    }

    pub fn updated(current: ResourceSnapshot, previous: ResourceSnapshot) -> Self {
        Self { op: Op::Update, current, previous: Some(previous) }
    }

    pub fn deleted(current: ResourceSnapshot, previous: Option<ResourceSnapshot>) -> Self {
        Self { op: Op::Delete, current, previous }
    }
}

/// Time source for cooldown accounting. Injectable so tests can drive it.
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch.
    fn now_secs(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}
