//! Classification of inbound side-channel payloads.

use serde_json::Value;

use crate::MessageKind;

/// Key of the tag that selects the consumer of an inbound frame.
pub const TAG_KEY: &str = "widget";

/// An inbound side-channel payload after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Nlp(Value),
    Gfx(Value),
    Info(Value),
    /// Replacement content for the structured-data display (the frame's `data`).
    EditorUpdate(Value),
    /// A tag outside the fixed set. Logged and dropped by the router.
    Unrecognized { tag: String, payload: Value },
    /// No tag at all, e.g. handshake greetings.
    Untagged(Value),
}

impl InboundFrame {
    /// Classify a raw payload by its `widget` tag.
    ///
    /// `NLP`, `GFX` and `INFO` frames keep the whole payload as their body.
    /// A non-string tag is treated as unrecognized.
    pub fn classify(payload: Value) -> Self {
        let tag = match payload.get(TAG_KEY) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => return InboundFrame::Untagged(payload),
            Some(other) => {
                return InboundFrame::Unrecognized {
                    tag: other.to_string(),
                    payload,
                }
            }
        };

        match MessageKind::from(tag.as_str()) {
            MessageKind::Nlp => InboundFrame::Nlp(payload),
            MessageKind::Gfx => InboundFrame::Gfx(payload),
            MessageKind::Info => InboundFrame::Info(payload),
            MessageKind::JsonEditor => {
                InboundFrame::EditorUpdate(payload.get("data").cloned().unwrap_or(Value::Null))
            }
            MessageKind::Other(tag) => InboundFrame::Unrecognized { tag, payload },
        }
    }

    /// Split into `(kind, body)`. Untagged frames have no kind.
    pub fn into_parts(self) -> Option<(MessageKind, Value)> {
        match self {
            InboundFrame::Nlp(body) => Some((MessageKind::Nlp, body)),
            InboundFrame::Gfx(body) => Some((MessageKind::Gfx, body)),
            InboundFrame::Info(body) => Some((MessageKind::Info, body)),
            InboundFrame::EditorUpdate(body) => Some((MessageKind::JsonEditor, body)),
            InboundFrame::Unrecognized { tag, payload } => Some((MessageKind::Other(tag), payload)),
            InboundFrame::Untagged(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_known_tags_keep_whole_payload() {
        let payload = json!({"widget": "NLP", "data": {"query": "show neurons"}});
        assert_eq!(
            InboundFrame::classify(payload.clone()),
            InboundFrame::Nlp(payload)
        );

        let payload = json!({"widget": "GFX", "data": {"messageType": "render"}});
        assert_eq!(
            InboundFrame::classify(payload.clone()),
            InboundFrame::Gfx(payload)
        );

        let payload = json!({"widget": "INFO", "data": "summary"});
        assert_eq!(
            InboundFrame::classify(payload.clone()),
            InboundFrame::Info(payload)
        );
    }

    #[test]
    fn test_classify_editor_update_extracts_data() {
        let frame = InboundFrame::classify(json!({"widget": "JSONEditor", "data": {"a": 1}}));
        assert_eq!(frame, InboundFrame::EditorUpdate(json!({"a": 1})));

        let frame = InboundFrame::classify(json!({"widget": "JSONEditor"}));
        assert_eq!(frame, InboundFrame::EditorUpdate(Value::Null));
    }

    #[test]
    fn test_classify_unknown_tag() {
        let frame = InboundFrame::classify(json!({"widget": "Neu3D", "data": 1}));
        assert!(matches!(frame, InboundFrame::Unrecognized { ref tag, .. } if tag == "Neu3D"));
        assert_eq!(
            frame.into_parts().map(|(kind, _)| kind),
            Some(MessageKind::Other("Neu3D".into()))
        );
    }

    #[test]
    fn test_classify_non_string_tag_is_unrecognized() {
        let frame = InboundFrame::classify(json!({"widget": 7}));
        assert!(matches!(frame, InboundFrame::Unrecognized { ref tag, .. } if tag == "7"));
    }

    #[test]
    fn test_classify_untagged_shapes() {
        assert_eq!(
            InboundFrame::classify(json!("comm established")),
            InboundFrame::Untagged(json!("comm established"))
        );
        assert_eq!(
            InboundFrame::classify(json!({"status": "ok"})),
            InboundFrame::Untagged(json!({"status": "ok"}))
        );
        assert!(InboundFrame::classify(json!({"widget": null}))
            .into_parts()
            .is_none());
    }

    #[test]
    fn test_into_parts() {
        let (kind, body) = InboundFrame::classify(json!({"widget": "INFO", "x": 2}))
            .into_parts()
            .unwrap();
        assert_eq!(kind, MessageKind::Info);
        assert_eq!(body["x"], 2);
    }
}
