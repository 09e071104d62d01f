use std::io::Write;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    /// Just the value, as a script would want it.
    Raw,
}

/// Print the result of a command.
///
/// `raw` is the line printed in raw mode; `None` prints nothing there.
pub fn print_report<T: Serialize>(report: &T, raw: Option<&str>, format: OutputFormat) {
    let value = serde_json::to_value(report).unwrap_or(Value::Null);
    match format {
        OutputFormat::Json => println!("{value}"),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (key, field) in fields(&value) {
                table.add_row(vec![key, field]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line: Vec<String> = fields(&value)
                .into_iter()
                .map(|(key, field)| format!("{key}={field}"))
                .collect();
            println!("{}", line.join(" "));
        }
        OutputFormat::Raw => {
            if let Some(raw) = raw {
                println!("{raw}");
            }
        }
    }
}

/// Write bytes to stdout unchanged.
pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn fields(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, field)| {
                let text = match field {
                    Value::String(s) => s.clone(),
                    Value::Null => "-".to_string(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect(),
        other => vec![("value".to_string(), other.to_string())],
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fields_flatten_objects() {
        let value = json!({"status": 0, "data": "dead", "missing": null});
        let mut got = fields(&value);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("data".to_string(), "dead".to_string()),
                ("missing".to_string(), "-".to_string()),
                ("status".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn scalars_get_a_value_field() {
        assert_eq!(fields(&json!(3)), vec![("value".to_string(), "3".to_string())]);
    }
}
