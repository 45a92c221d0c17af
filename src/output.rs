//! Text rendering for document values.
//!
//! Two formats are provided:
//!
//! - **Shell text** via [`to_shell`] (and `Display` for [`Value`]) - the canonical
//!   single-line form stages are compared by: `{ $match : { X : { $in : [1, 2, 3] } } }`.
//!   Keys are bare when identifier-like and single-quoted otherwise, strings are
//!   single-quoted, and numeric widths are explicit (`NumberLong(1)`, `1.0`,
//!   `NumberDecimal('1.5')`).
//! - **JSON** via [`to_json`] / [`to_json_pretty`] - relaxed extended JSON used
//!   for query results.
//!
//! Both are deterministic: document fields are printed in insertion order.
//!
//! # Examples
//!
//! ```
//! use docstage::{Value, doc};
//! use docstage::output::{to_json, to_shell};
//!
//! let value = Value::Document(doc! { "_v" => 1.0, "a.b" => Value::Int64(2) });
//! assert_eq!(to_shell(&value), "{ _v : 1.0, 'a.b' : NumberLong(2) }");
//! assert_eq!(to_json(&value), r#"{"_v":1.0,"a.b":2}"#);
//! ```

use std::fmt;

use crate::value::{Document, Value};

/// Output format of a [`Printer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Shell,
    Json,
}

pub struct Printer {
    format: Format,
    pretty: bool,
}

impl Printer {
    pub fn new(format: Format, pretty: bool) -> Self {
        Printer { format, pretty }
    }

    pub fn print(&self, value: &Value) -> String {
        let mut out = String::new();
        self.print_value(value, 0, &mut out);
        out
    }

    fn print_value(&self, value: &Value, indent: usize, out: &mut String) {
        match value {
            Value::Null => out.push_str("null"),
            Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int32(n) => out.push_str(&n.to_string()),
            Value::Int64(n) => match self.format {
                Format::Shell => out.push_str(&format!("NumberLong({})", n)),
                Format::Json => out.push_str(&n.to_string()),
            },
            Value::Double(n) => out.push_str(&format_double(*n, self.format)),
            Value::Decimal(d) => match self.format {
                Format::Shell => out.push_str(&format!("NumberDecimal('{}')", d)),
                Format::Json => out.push_str(&format!("{{\"$numberDecimal\":\"{}\"}}", d)),
            },
            Value::String(s) => self.print_string(s, out),
            Value::Regex { pattern, options } => match self.format {
                Format::Shell => out.push_str(&format!("/{}/{}", pattern, options)),
                Format::Json => {
                    out.push_str("{\"$regularExpression\":{\"pattern\":");
                    self.print_string(pattern, out);
                    out.push_str(",\"options\":");
                    self.print_string(options, out);
                    out.push_str("}}");
                }
            },
            Value::DateTime(ms) => {
                let text = chrono::DateTime::from_timestamp_millis(*ms)
                    .map(|d| d.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
                    .unwrap_or_else(|| ms.to_string());
                match self.format {
                    Format::Shell => out.push_str(&format!("ISODate('{}')", text)),
                    Format::Json => out.push_str(&format!("{{\"$date\":\"{}\"}}", text)),
                }
            }
            Value::Array(items) => self.print_array(items, indent, out),
            Value::Document(doc) => self.print_document(doc, indent, out),
        }
    }

    fn print_array(&self, items: &[Value], indent: usize, out: &mut String) {
        if items.is_empty() {
            out.push_str("[]");
            return;
        }
        if self.pretty {
            out.push_str("[\n");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(",\n");
                }
                out.push_str(&self.indent(indent + 1));
                self.print_value(item, indent + 1, out);
            }
            out.push('\n');
            out.push_str(&self.indent(indent));
            out.push(']');
            return;
        }
        out.push('[');
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(match self.format {
                    Format::Shell => ", ",
                    Format::Json => ",",
                });
            }
            self.print_value(item, indent, out);
        }
        out.push(']');
    }

    fn print_document(&self, doc: &Document, indent: usize, out: &mut String) {
        if doc.is_empty() {
            out.push_str(match self.format {
                Format::Shell => "{ }",
                Format::Json => "{}",
            });
            return;
        }
        let separator = match self.format {
            Format::Shell => " : ",
            Format::Json if self.pretty => ": ",
            Format::Json => ":",
        };
        if self.pretty {
            out.push_str("{\n");
            for (i, (key, value)) in doc.iter().enumerate() {
                if i > 0 {
                    out.push_str(",\n");
                }
                out.push_str(&self.indent(indent + 1));
                self.print_key(key, out);
                out.push_str(separator);
                self.print_value(value, indent + 1, out);
            }
            out.push('\n');
            out.push_str(&self.indent(indent));
            out.push('}');
            return;
        }
        out.push_str(match self.format {
            Format::Shell => "{ ",
            Format::Json => "{",
        });
        for (i, (key, value)) in doc.iter().enumerate() {
            if i > 0 {
                out.push_str(match self.format {
                    Format::Shell => ", ",
                    Format::Json => ",",
                });
            }
            self.print_key(key, out);
            out.push_str(separator);
            self.print_value(value, indent, out);
        }
        out.push_str(match self.format {
            Format::Shell => " }",
            Format::Json => "}",
        });
    }

    fn print_key(&self, key: &str, out: &mut String) {
        match self.format {
            Format::Shell if is_bare_key(key) => out.push_str(key),
            _ => self.print_string(key, out),
        }
    }

    fn print_string(&self, s: &str, out: &mut String) {
        let quote = match self.format {
            Format::Shell => '\'',
            Format::Json => '"',
        };
        out.push(quote);
        for ch in s.chars() {
            match ch {
                c if c == quote => {
                    out.push('\\');
                    out.push(c);
                }
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        }
        out.push(quote);
    }

    fn indent(&self, level: usize) -> String {
        "  ".repeat(level)
    }
}

/// Keys made of `$`, `_`, ASCII letters and digits (not starting with a digit) print unquoted.
fn is_bare_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c == '$' || c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '$' || c == '_' || c.is_ascii_alphanumeric())
}

fn format_double(n: f64, format: Format) -> String {
    if n.is_nan() {
        return match format {
            Format::Shell => "NaN".to_string(),
            Format::Json => "{\"$numberDouble\":\"NaN\"}".to_string(),
        };
    }
    if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        return match format {
            Format::Shell => text.to_string(),
            Format::Json => format!("{{\"$numberDouble\":\"{}\"}}", text),
        };
    }
    if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        n.to_string()
    }
}

/// Canonical single-line shell text of a value.
pub fn to_shell(value: &Value) -> String {
    Printer::new(Format::Shell, false).print(value)
}

/// Compact JSON.
pub fn to_json(value: &Value) -> String {
    Printer::new(Format::Json, false).print(value)
}

/// Pretty JSON with 2-space indentation.
pub fn to_json_pretty(value: &Value) -> String {
    Printer::new(Format::Json, true).print(value)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_shell(self))
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        Printer::new(Format::Shell, false).print_document(self, 0, &mut out);
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use rust_decimal::Decimal;

    #[test]
    fn shell_numbers_keep_their_width() {
        assert_eq!(to_shell(&Value::Int32(3)), "3");
        assert_eq!(to_shell(&Value::Int64(3)), "NumberLong(3)");
        assert_eq!(to_shell(&Value::Double(1000.0)), "1000.0");
        assert_eq!(to_shell(&Value::Double(1.25)), "1.25");
        assert_eq!(to_shell(&Value::Decimal(Decimal::new(15, 1))), "NumberDecimal('1.5')");
    }

    #[test]
    fn shell_keys_and_strings() {
        let d = doc! { "$in" => "it's", "field.1" => Value::Null, "_id" => 0 };
        assert_eq!(to_shell(&Value::Document(d)), "{ $in : 'it\\'s', 'field.1' : null, _id : 0 }");
        assert_eq!(to_shell(&Value::Document(Document::new())), "{ }");
    }

    #[test]
    fn shell_regex() {
        let regex = Value::Regex { pattern: "^abc$".to_string(), options: "i".to_string() };
        assert_eq!(to_shell(&regex), "/^abc$/i");
    }

    #[test]
    fn pretty_json_indents_nested_values() {
        let d = doc! { "a" => vec![Value::from(1)] };
        assert_eq!(to_json_pretty(&Value::Document(d)), "{\n  \"a\": [\n    1\n  ]\n}");
    }
}
