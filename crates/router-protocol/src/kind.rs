//! Message kinds carried in the `widget` tag of side-channel frames.
//!
//! Unknown values are preserved via `Other(String)` so that forwarded
//! events with arbitrary targets keep their tag verbatim.

/// Tag of a side-channel message or bus event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Natural-language query results.
    Nlp,
    /// Graphics / visualization events.
    Gfx,
    /// Informational status.
    Info,
    /// Structured-data-editor updates.
    JsonEditor,
    /// Any other tag, preserved as sent.
    Other(String),
}

// ── Serde ────────────────────────────────────────────────────────────

impl serde::Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageKind::from(s.as_str()))
    }
}

// ── Display / FromStr ───────────────────────────────────────────────

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Nlp => write!(f, "NLP"),
            MessageKind::Gfx => write!(f, "GFX"),
            MessageKind::Info => write!(f, "INFO"),
            MessageKind::JsonEditor => write!(f, "JSONEditor"),
            MessageKind::Other(s) => write!(f, "{}", s),
        }
    }
}

// Tags are case-sensitive on the wire.
impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "NLP" => MessageKind::Nlp,
            "GFX" => MessageKind::Gfx,
            "INFO" => MessageKind::Info,
            "JSONEditor" => MessageKind::JsonEditor,
            _ => MessageKind::Other(s.to_string()),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(MessageKind::from(s))
    }
}
