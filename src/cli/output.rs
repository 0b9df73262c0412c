//! Output formatting utilities for the CLI.

use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;
    fn to_json(&self) -> Value;
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate a string to a maximum number of characters, appending "..." if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Borderless table with upper-cased headers.
pub fn list_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h.to_uppercase()).set_alignment(CellAlignment::Left)),
        );
    table
}

/// Render a JSON value compactly for a table cell.
pub fn cell_text(value: &Value, max_len: usize) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => truncate(s, max_len),
        other => truncate(&other.to_string(), max_len),
    }
}

/// Key/value table for the top level of a JSON object; other values print as JSON.
pub fn value_table(value: &Value) -> String {
    let Value::Object(map) = value else {
        return serde_json::to_string_pretty(value).unwrap_or_default();
    };
    if map.is_empty() {
        return "(empty)".to_string();
    }
    let mut table = list_table(&["field", "value"]);
    for (key, value) in map {
        table.add_row(vec![key.clone(), cell_text(value, 80)]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer string", 8), "a lon...");
        assert_eq!(truncate("héllo wörld", 6), "hél...");
    }

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(&Value::Null, 10), "-");
        assert_eq!(cell_text(&json!("x"), 10), "x");
        assert_eq!(cell_text(&json!({"a": 1}), 20), r#"{"a":1}"#);
    }

    #[test]
    fn test_value_table_lists_fields() {
        let rendered = value_table(&json!({"status": "ok", "locks": 2}));
        assert!(rendered.contains("FIELD"));
        assert!(rendered.contains("status"));
        assert!(rendered.contains("ok"));
        assert_eq!(value_table(&json!({})), "(empty)");
        assert_eq!(value_table(&json!([1])), "[\n  1\n]");
    }
}
