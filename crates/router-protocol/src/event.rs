//! Events observed by bus subscribers.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::MessageKind;

/// Session notice published when the kernel goes away.
pub const DISCONNECTED: &str = "DISCONNECTED";

/// Status of the session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session created yet
    Unattached,
    /// Session created, kernel not ready yet
    Starting,
    /// Kernel attached and ready
    Ready,
    /// Kernel is restarting
    Restarting,
    /// Kernel lost or detached
    Disconnected,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Unattached => write!(f, "unattached"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Restarting => write!(f, "restarting"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One event on the router bus.
///
/// Serialized as `{"type": ..., "data": ...}`; `Dispose` carries no data.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// Current session path, or [`DISCONNECTED`].
    Session(String),
    /// Session status transition.
    Status(SessionStatus),
    /// The model changed; carries the full current id set.
    Model { ids: Vec<String> },
    /// A side-channel frame or a forwarded action, tagged by kind.
    Message { kind: MessageKind, data: Value },
    /// The owning component is being disposed.
    Dispose,
}

impl RouterEvent {
    /// The `type` string subscribers filter on.
    pub fn event_type(&self) -> String {
        match self {
            RouterEvent::Session(_) => "session".to_string(),
            RouterEvent::Status(_) => "status".to_string(),
            RouterEvent::Model { .. } => "model".to_string(),
            RouterEvent::Message { kind, .. } => kind.to_string(),
            RouterEvent::Dispose => "Dispose".to_string(),
        }
    }

    /// Whether this event's `type` equals `ty`.
    pub fn is(&self, ty: &str) -> bool {
        self.event_type() == ty
    }

    /// The `data` payload, if any.
    pub fn data(&self) -> Option<Value> {
        match self {
            RouterEvent::Session(path) => Some(Value::String(path.clone())),
            RouterEvent::Status(status) => Some(Value::String(status.to_string())),
            RouterEvent::Model { ids } => Some(Value::from(ids.clone())),
            RouterEvent::Message { data, .. } => Some(data.clone()),
            RouterEvent::Dispose => None,
        }
    }
}

impl Serialize for RouterEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.data();
        let mut map = serializer.serialize_map(Some(if data.is_some() { 2 } else { 1 }))?;
        map.serialize_entry("type", &self.event_type())?;
        if let Some(data) = data {
            map.serialize_entry("data", &data)?;
        }
        map.end()
    }
}
