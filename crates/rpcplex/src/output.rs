use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CallOutput<'a> {
    pub proxy: &'a str,
    pub method: &'a str,
    pub id: u64,
    pub elapsed_ms: u128,
    pub result: Value,
}

#[derive(Debug, Serialize)]
pub struct NotifyOutput<'a> {
    pub proxy: &'a str,
    pub method: &'a str,
    pub sent: bool,
}

pub fn print_call(out: &CallOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PROXY", "METHOD", "ID", "ELAPSED", "RESULT"])
                .add_row(vec![
                    out.proxy.to_string(),
                    out.method.to_string(),
                    out.id.to_string(),
                    format!("{} ms", out.elapsed_ms),
                    render_value(&out.result),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{}.{} -> {} ({} ms)",
                out.proxy,
                out.method,
                render_value(&out.result),
                out.elapsed_ms
            );
        }
    }
}

pub fn print_notify(out: &NotifyOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PROXY", "METHOD", "SENT"])
                .add_row(vec![
                    out.proxy.to_string(),
                    out.method.to_string(),
                    out.sent.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{}.{} notified", out.proxy, out.method),
    }
}

fn print_json(out: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Human rendering of a result: strings unquoted, everything else as JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn renders_strings_without_quotes() {
        assert_eq!(render_value(&json!("hello")), "hello");
        assert_eq!(render_value(&json!(5)), "5");
        assert_eq!(render_value(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
        assert_eq!(render_value(&Value::Null), "null");
    }

    #[test]
    fn call_output_serializes_result_field() {
        let out = CallOutput {
            proxy: "math",
            method: "add",
            id: 1,
            elapsed_ms: 3,
            result: json!(5),
        };
        let encoded: Value = serde_json::to_value(&out).unwrap();
        assert_eq!(encoded["result"], json!(5));
        assert_eq!(encoded["proxy"], json!("math"));
    }
}
