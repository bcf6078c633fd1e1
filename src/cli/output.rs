//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};

use crate::cli::args::{OutputFormat, SortMergeArgs};
use crate::error::Result;
use crate::posting::Posting;

/// Result structure for dumping an index.
#[derive(Debug, Serialize, Deserialize)]
pub struct DumpResult {
    pub postings: Vec<Posting>,
    pub truncated: bool,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &SortMergeArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &SortMergeArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }

    let value = serde_json::to_value(result)?;
    print_fields(&value, 0);
    Ok(())
}

/// Print the fields of an object as `key: value` lines, nesting objects.
fn print_fields(value: &serde_json::Value, indent: usize) {
    let spaces = " ".repeat(indent);
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                if val.is_object() {
                    println!("{spaces}{}:", humanize_key(key));
                    print_fields(val, indent + 2);
                } else {
                    println!("{spaces}{}: {}", humanize_key(key), format_value(val));
                }
            }
        }
        other => println!("{spaces}{}", format_value(other)),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &SortMergeArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{json}");
    Ok(())
}

/// Print postings in the `term doc` input format.
pub fn output_postings(postings: &[Posting]) {
    for posting in postings {
        println!("{} {}", posting.term, posting.doc);
    }
}

/// Turn a snake_case field name into a label.
fn humanize_key(key: &str) -> String {
    let mut label = key.replace('_', " ");
    if let Some(first) = label.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    label
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(_) => "[object]".to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}
