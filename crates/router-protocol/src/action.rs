//! Subscriber-originated actions.
//!
//! Wire format: `{"action": "...", "content": ..., "target": "..."}`.
//! Parsing is infallible. Anything outside the fixed vocabulary, or a known
//! action whose content is malformed, lands in a fallback variant that the
//! router reports and ignores.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A request published by a subscriber for the router to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Submit code to the kernel, fire-and-forget.
    Execute { code: String },
    /// Insert or overwrite a model entry.
    ModelAdd { rid: String, data: Value },
    /// Remove a model entry.
    ModelRemove { rid: String },
    /// Re-tag `content` as `target` and republish to all subscribers.
    Forward { target: String, content: Value },
    /// An action name outside the vocabulary.
    Unrecognized { action: String, payload: Value },
    /// A known action name with unusable content, or no action name at all.
    Invalid { action: String, reason: String },
}

/// Intermediate struct for deserializing actions before validation.
#[derive(Debug, Deserialize)]
struct RawAction {
    action: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteContent {
    code: String,
}

#[derive(Debug, Deserialize)]
struct ModelAddContent {
    rid: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ModelRemoveContent {
    rid: String,
}

impl Action {
    pub fn execute(code: impl Into<String>) -> Self {
        Action::Execute { code: code.into() }
    }

    pub fn model_add(rid: impl Into<String>, data: Value) -> Self {
        Action::ModelAdd {
            rid: rid.into(),
            data,
        }
    }

    pub fn model_remove(rid: impl Into<String>) -> Self {
        Action::ModelRemove { rid: rid.into() }
    }

    pub fn forward(target: impl Into<String>, content: Value) -> Self {
        Action::Forward {
            target: target.into(),
            content,
        }
    }

    /// Parse an action from its wire JSON.
    pub fn from_value(value: Value) -> Self {
        let raw: RawAction = match serde_json::from_value(value.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                return Action::Invalid {
                    action: String::new(),
                    reason: e.to_string(),
                }
            }
        };

        let Some(name) = raw.action else {
            return Action::Invalid {
                action: String::new(),
                reason: "missing `action` field".to_string(),
            };
        };

        let invalid = |e: serde_json::Error| Action::Invalid {
            action: name.clone(),
            reason: e.to_string(),
        };

        match name.as_str() {
            "execute" => match serde_json::from_value::<ExecuteContent>(raw.content) {
                Ok(c) => Action::Execute { code: c.code },
                Err(e) => invalid(e),
            },
            "model-add" => match serde_json::from_value::<ModelAddContent>(raw.content) {
                Ok(c) => Action::ModelAdd {
                    rid: c.rid,
                    data: c.data,
                },
                Err(e) => invalid(e),
            },
            "model-remove" => match serde_json::from_value::<ModelRemoveContent>(raw.content) {
                Ok(c) => Action::ModelRemove { rid: c.rid },
                Err(e) => invalid(e),
            },
            "forward" => match raw.target {
                Some(target) => Action::Forward {
                    target,
                    content: raw.content,
                },
                None => Action::Invalid {
                    action: name.clone(),
                    reason: "missing `target` field".to_string(),
                },
            },
            _ => Action::Unrecognized {
                action: name.clone(),
                payload: value,
            },
        }
    }

    /// The action name as it appears on the wire.
    pub fn name(&self) -> &str {
        match self {
            Action::Execute { .. } => "execute",
            Action::ModelAdd { .. } => "model-add",
            Action::ModelRemove { .. } => "model-remove",
            Action::Forward { .. } => "forward",
            Action::Unrecognized { action, .. } | Action::Invalid { action, .. } => action,
        }
    }

    /// Wire JSON for this action.
    pub fn to_value(&self) -> Value {
        match self {
            Action::Execute { code } => json!({"action": "execute", "content": {"code": code}}),
            Action::ModelAdd { rid, data } => {
                json!({"action": "model-add", "content": {"rid": rid, "data": data}})
            }
            Action::ModelRemove { rid } => {
                json!({"action": "model-remove", "content": {"rid": rid}})
            }
            Action::Forward { target, content } => {
                json!({"action": "forward", "target": target, "content": content})
            }
            Action::Unrecognized { payload, .. } => payload.clone(),
            Action::Invalid { action, .. } => json!({ "action": action }),
        }
    }
}

impl Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Deserializes through [`Action::from_value`], so this never fails on
/// well-formed JSON.
impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Action::from_value(value))
    }
}
