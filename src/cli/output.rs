//! Output formatting utilities for CLI

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

/// Enum to hold different formatter types
pub enum OutputFormatter {
    Json(JsonFormatter),
    Human(HumanFormatter),
}

pub fn create_formatter(json: bool) -> OutputFormatter {
    if json {
        OutputFormatter::Json(JsonFormatter)
    } else {
        OutputFormatter::Human(HumanFormatter)
    }
}

impl OutputFormatter {
    /// Format a success message
    pub fn format_success(&self, message: &str, data: Option<Value>) -> String {
        match self {
            OutputFormatter::Json(f) => f.format_success(message, data),
            OutputFormatter::Human(f) => f.format_success(message, data),
        }
    }

    /// Format an error message
    pub fn format_error(&self, error: &str) -> String {
        match self {
            OutputFormatter::Json(f) => f.format_error(error),
            OutputFormatter::Human(f) => f.format_error(error),
        }
    }

    /// Format a list of items
    pub fn format_list<T: Serialize>(&self, items: &[T], title: &str) -> String {
        match self {
            OutputFormatter::Json(f) => f.format_list(items, title),
            OutputFormatter::Human(f) => f.format_list(items, title),
        }
    }
}

/// JSON output formatter
pub struct JsonFormatter;

impl JsonFormatter {
    pub fn format_success(&self, message: &str, data: Option<Value>) -> String {
        let mut result = serde_json::json!({
            "status": "success",
            "message": message
        });
        if let Some(data) = data {
            result["data"] = data;
        }
        serde_json::to_string_pretty(&result).unwrap_or_else(|_| message.to_string())
    }

    pub fn format_error(&self, error: &str) -> String {
        let result = serde_json::json!({
            "status": "error",
            "error": error
        });
        serde_json::to_string_pretty(&result).unwrap_or_else(|_| error.to_string())
    }

    pub fn format_list<T: Serialize>(&self, items: &[T], title: &str) -> String {
        let result = serde_json::json!({
            "title": title,
            "count": items.len(),
            "items": items,
        });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }
}

/// Human-readable output formatter
pub struct HumanFormatter;

impl HumanFormatter {
    pub fn format_success(&self, message: &str, data: Option<Value>) -> String {
        let mut out = format!("{} {}", "✓".green(), message);
        if let Some(data) = data {
            if let Ok(pretty) = serde_json::to_string_pretty(&data) {
                out.push('\n');
                out.push_str(&pretty);
            }
        }
        out
    }

    pub fn format_error(&self, error: &str) -> String {
        format!("{} {}", "✗".red(), error)
    }

    pub fn format_list<T: Serialize>(&self, items: &[T], title: &str) -> String {
        let mut out = format!("{} ({})", title.bold(), items.len());
        for item in items {
            let line = serde_json::to_value(item)
                .ok()
                .map(summarize_value)
                .unwrap_or_default();
            out.push_str(&format!("\n  - {}", line));
        }
        out
    }
}

fn summarize_value(value: Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}={}", k, compact(v)))
            .collect::<Vec<_>>()
            .join(" "),
        other => compact(&other),
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_success() {
        let f = JsonFormatter;
        let out = f.format_success("created", Some(serde_json::json!({"id": "x"})));
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["id"], "x");
    }

    #[test]
    fn test_json_list_count() {
        let f = JsonFormatter;
        let out = f.format_list(&["a", "b"], "things");
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["count"], 2);
    }

    #[test]
    fn test_human_error_contains_message() {
        let f = HumanFormatter;
        assert!(f.format_error("boom").contains("boom"));
    }
}
