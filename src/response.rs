//! Uniform API response envelope and its renderers.
//!
//! Every operation, whether it entered through the CLI or the bus, returns
//! the same envelope: `{ "data": ..., "error": bool, "transaction": id }`.
//! On success `data` carries at least a human-readable `message` plus typed
//! sub-fields; on failure `data.message` carries the error text.

use clap::ValueEnum;
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Where and how the envelope is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Ornamental tree on the terminal.
    #[default]
    Text,
    /// Indented JSON on stdout.
    Json,
    /// JSON on stdout plus a notification signal on the bus.
    Dbus,
}

impl OutputFormat {
    /// Machine formats bypass the interactive dialog gate.
    pub fn is_machine(self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Dbus)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::Dbus => "dbus",
        };
        write!(f, "{name}")
    }
}

/// The response envelope, bit-exact across all delivery modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub data: Value,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

impl Envelope {
    /// Successful envelope. `data` must be a JSON object; a bare value is
    /// wrapped under `message`.
    pub fn success(data: Value, transaction: &str) -> Self {
        let data = match data {
            Value::Object(_) => data,
            other => json!({ "message": other }),
        };
        Self {
            data,
            error: false,
            transaction: some_transaction(transaction),
        }
    }

    /// Failed envelope with the error text under `data.message`.
    pub fn failure(message: impl AsRef<str>, transaction: &str) -> Self {
        Self {
            data: json!({ "message": message.as_ref() }),
            error: true,
            transaction: some_transaction(transaction),
        }
    }

    /// Render the printable form for the given output format.
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_tree(),
            OutputFormat::Json | OutputFormat::Dbus => self.render_json(),
        }
    }

    /// Indented JSON. On success the redundant `message` key is suppressed
    /// when typed sub-fields are present.
    pub fn render_json(&self) -> String {
        let mut clone = self.clone();
        if !clone.error
            && let Value::Object(map) = &mut clone.data
            && map.len() > 1
        {
            map.remove("message");
        }
        serde_json::to_string_pretty(&clone).unwrap_or_else(|_| "{}".to_string())
    }

    /// The exact wire form sent over the bus.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    fn render_tree(&self) -> String {
        let root = if self.error {
            "Error".red().bold().to_string()
        } else {
            "Done".green().bold().to_string()
        };
        let mut out = String::new();
        out.push_str(&root);
        out.push('\n');
        render_object(&self.data, "", &mut out);
        out
    }
}

fn some_transaction(transaction: &str) -> Option<String> {
    if transaction.is_empty() {
        None
    } else {
        Some(transaction.to_string())
    }
}

/// Order object keys for the tree: `message` first, the rest alphabetized.
fn ordered_keys(map: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    if let Some(pos) = keys.iter().position(|k| *k == "message") {
        let message = keys.remove(pos);
        keys.insert(0, message);
    }
    keys
}

fn render_object(value: &Value, prefix: &str, out: &mut String) {
    let Value::Object(map) = value else {
        out.push_str(&format!("{}└── {}\n", prefix, scalar(value)));
        return;
    };
    let keys = ordered_keys(map);
    let count = keys.len();
    for (idx, key) in keys.into_iter().enumerate() {
        let last = idx + 1 == count;
        render_entry(key, &map[key], prefix, last, out);
    }
}

fn render_entry(key: &str, value: &Value, prefix: &str, last: bool, out: &mut String) {
    let branch = if last { "└── " } else { "├── " };
    let child_prefix = format!("{}{}", prefix, if last { "    " } else { "│   " });
    match value {
        Value::Object(map) if !map.is_empty() => {
            out.push_str(&format!("{}{}{}\n", prefix, branch, key.cyan()));
            render_object(value, &child_prefix, out);
        }
        Value::Array(items) if !items.is_empty() => {
            out.push_str(&format!("{}{}{}\n", prefix, branch, key.cyan()));
            for (idx, item) in items.iter().enumerate() {
                let item_last = idx + 1 == items.len();
                let item_branch = if item_last { "└── " } else { "├── " };
                match item {
                    Value::Object(_) => {
                        out.push_str(&format!(
                            "{}{}{}\n",
                            child_prefix,
                            item_branch,
                            format!("{})", idx + 1)
                        ));
                        let nested = format!(
                            "{}{}",
                            child_prefix,
                            if item_last { "    " } else { "│   " }
                        );
                        render_object(item, &nested, out);
                    }
                    other => {
                        out.push_str(&format!(
                            "{}{}{}) {}\n",
                            child_prefix,
                            item_branch,
                            idx + 1,
                            scalar(other)
                        ));
                    }
                }
            }
        }
        other => {
            out.push_str(&format!(
                "{}{}{}: {}\n",
                prefix,
                branch,
                key.cyan(),
                scalar(other)
            ));
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        Value::Array(items) if items.is_empty() => "[]".to_string(),
        Value::Object(map) if map.is_empty() => "{}".to_string(),
        other => other.to_string(),
    }
}

/// Render any serializable record as tree data by round-tripping through
/// JSON, preserving the envelope conventions.
pub fn to_data<T: Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_wraps_bare_value_under_message() {
        let env = Envelope::success(json!("all good"), "t1");
        assert!(!env.error);
        assert_eq!(env.data["message"], "all good");
        assert_eq!(env.transaction.as_deref(), Some("t1"));
    }

    #[test]
    fn empty_transaction_is_omitted_from_wire() {
        let env = Envelope::failure("boom", "");
        let wire = env.to_wire();
        assert!(!wire.contains("transaction"));
        assert!(wire.contains("\"error\":true"));
    }

    #[test]
    fn json_render_suppresses_message_when_typed_fields_present() {
        let env = Envelope::success(json!({ "message": "ok", "count": 3 }), "t");
        let rendered = env.render_json();
        assert!(!rendered.contains("\"message\""));
        assert!(rendered.contains("\"count\": 3"));
    }

    #[test]
    fn json_render_keeps_message_on_error() {
        let env = Envelope::failure("broken", "t");
        let rendered = env.render_json();
        assert!(rendered.contains("\"message\": \"broken\""));
    }

    #[test]
    fn tree_lists_message_first_then_alphabetical() {
        let env = Envelope::success(
            json!({ "zeta": 1, "alpha": 2, "message": "done" }),
            "t",
        );
        let tree = env.render(OutputFormat::Text);
        let message_at = tree.find("message").unwrap();
        let alpha_at = tree.find("alpha").unwrap();
        let zeta_at = tree.find("zeta").unwrap();
        assert!(message_at < alpha_at);
        assert!(alpha_at < zeta_at);
    }

    #[test]
    fn tree_enumerates_list_items() {
        let env = Envelope::success(
            json!({ "message": "ok", "packages": ["zip", "unzip"] }),
            "t",
        );
        let tree = env.render(OutputFormat::Text);
        assert!(tree.contains("1) zip"));
        assert!(tree.contains("2) unzip"));
    }

    #[test]
    fn machine_formats_bypass_gate() {
        assert!(OutputFormat::Json.is_machine());
        assert!(OutputFormat::Dbus.is_machine());
        assert!(!OutputFormat::Text.is_machine());
    }
}
