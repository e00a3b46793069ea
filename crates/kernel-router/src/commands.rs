//! Toolbar commands, expressed as router actions.
//!
//! Each command expands to the [`Action`]s the toolbar button would emit,
//! against the kernel-side client variable.

use router_protocol::Action;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ToolbarCommand {
    Compile,
    Simulate,
    Layout,
    LayoutSimple,
    TogglePlotter,
    ListInputs,
    /// Push the whole model to the kernel, then ask subscribers to save.
    Sync,
    /// Natural-language query.
    Query { text: String },
}

impl ToolbarCommand {
    /// Expand into actions. `model` is the current model snapshot, used by
    /// [`ToolbarCommand::Sync`].
    pub fn to_actions(&self, client: &str, model: &Value) -> Vec<Action> {
        match self {
            ToolbarCommand::Compile => vec![Action::execute(format!("{client}.prepareCircuit()"))],
            ToolbarCommand::Simulate => vec![Action::forward(
                "GFX",
                json!({"messageType": "simulate", "data": {}}),
            )],
            ToolbarCommand::Layout => vec![Action::execute(format!(
                r#"{client}.runLayouting("frontend")"#
            ))],
            ToolbarCommand::LayoutSimple => vec![Action::execute(format!(
                r#"{client}.runLayouting("frontend", model="simple")"#
            ))],
            ToolbarCommand::TogglePlotter => vec![Action::forward(
                "GFX",
                json!({"messageType": "togglePlotter", "data": {}}),
            )],
            ToolbarCommand::ListInputs => vec![Action::execute(format!("{client}.listInputs()"))],
            ToolbarCommand::Sync => vec![
                Action::execute(format!(
                    r#"{client}.updateBackend(type="WholeCircuit", data={})"#,
                    python_string(&model.to_string())
                )),
                Action::forward("INFO", json!("save")),
            ],
            ToolbarCommand::Query { text } => {
                if text.trim().is_empty() {
                    return Vec::new();
                }
                vec![
                    Action::execute(format!(
                        "{client}.executeNLPquery(query={})",
                        python_string(text)
                    )),
                    Action::forward("GFX", json!({"messageType": "GFXquery", "data": text})),
                ]
            }
        }
    }
}

/// Double-quoted Python string literal for `s`.
fn python_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cmd: ToolbarCommand = serde_json::from_str(r#"{"command": "layout-simple"}"#).unwrap();
        assert_eq!(cmd, ToolbarCommand::LayoutSimple);

        let cmd: ToolbarCommand =
            serde_json::from_str(r#"{"command": "query", "text": "show T4a"}"#).unwrap();
        assert_eq!(
            cmd,
            ToolbarCommand::Query {
                text: "show T4a".into()
            }
        );

        assert!(serde_json::from_str::<ToolbarCommand>(r#"{"command": "explode"}"#).is_err());
    }

    #[test]
    fn test_kernel_commands_use_client_variable() {
        let actions = ToolbarCommand::Compile.to_actions("nm", &json!({}));
        assert_eq!(actions, vec![Action::execute("nm.prepareCircuit()")]);

        let actions = ToolbarCommand::LayoutSimple.to_actions("nm", &json!({}));
        assert_eq!(
            actions,
            vec![Action::execute(r#"nm.runLayouting("frontend", model="simple")"#)]
        );
    }

    #[test]
    fn test_simulate_is_forwarded_only() {
        let actions = ToolbarCommand::Simulate.to_actions("nm", &json!({}));
        assert_eq!(
            actions,
            vec![Action::forward(
                "GFX",
                json!({"messageType": "simulate", "data": {}})
            )]
        );
    }

    #[test]
    fn test_sync_embeds_model_and_saves() {
        let model = json!({"n1": {"name": "T4a"}});
        let actions = ToolbarCommand::Sync.to_actions("nm", &model);

        assert_eq!(actions.len(), 2);
        let Action::Execute { code } = &actions[0] else {
            panic!("expected execute");
        };
        assert!(code.starts_with(r#"nm.updateBackend(type="WholeCircuit", data=""#));
        assert!(code.contains(r#"{\"n1\":{\"name\":\"T4a\"}}"#));
        assert_eq!(actions[1], Action::forward("INFO", json!("save")));
    }

    #[test]
    fn test_query_escapes_and_skips_blank() {
        let text = "show \"T4\" \\ neurons\nnow".to_string();
        let actions = ToolbarCommand::Query { text: text.clone() }.to_actions("nm", &json!({}));
        assert_eq!(
            actions[0],
            Action::execute(r#"nm.executeNLPquery(query="show \"T4\" \\ neurons\nnow")"#)
        );
        assert_eq!(
            actions[1],
            Action::forward("GFX", json!({"messageType": "GFXquery", "data": text}))
        );

        let blank = ToolbarCommand::Query { text: "  ".into() };
        assert!(blank.to_actions("nm", &json!({})).is_empty());
    }
}
