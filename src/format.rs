//! Template-based custom column renderers
//!
//! A data set can show selected columns through a template instead of the raw value,
//! e.g. `{'name': '<b>{}</b>'}` in the configuration. Placeholders:
//! - `{}` - the value as-is
//! - `{:UPPER}` / `{:lower}` / `{:Title}` - change case
//! - `{:time %fmt}` - strftime formatting of dates and timestamps (`{:time %b %Y}` -> "Jan 2024")
//! - `{:num %fmt}` - printf formatting of numbers (`{:num %.2f}` -> "25.50")

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::Deserialize;
use std::ops::Range;
use std::sync::OnceLock;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
enum Placeholder {
    Plain,
    Upper,
    Lower,
    Title,
    /// strftime format
    Time(String),
    /// printf format
    Number(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    placeholder: Placeholder,
    /// Byte range of the `{...}` token in the template
    range: Range<usize>,
}

fn slot_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^}]*)\}").expect("Invalid placeholder regex"))
}

fn parse_slots(template: &str) -> Vec<Slot> {
    slot_regex()
        .captures_iter(template)
        .map(|cap| {
            let inner = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
            let placeholder = if let Some(fmt) = inner.strip_prefix(":time ") {
                Placeholder::Time(fmt.to_string())
            } else if let Some(fmt) = inner.strip_prefix(":num ") {
                Placeholder::Number(fmt.to_string())
            } else {
                match inner {
                    ":UPPER" => Placeholder::Upper,
                    ":lower" => Placeholder::Lower,
                    ":Title" => Placeholder::Title,
                    // `{}` and anything unknown
                    _ => Placeholder::Plain,
                }
            };
            Slot {
                placeholder,
                range: cap.get(0).map(|m| m.range()).unwrap_or_default(),
            }
        })
        .collect()
}

/// A compiled rendering template for one column
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "String")]
pub struct ColumnRenderer {
    template: String,
    slots: Vec<Slot>,
}

impl ColumnRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        let slots = parse_slots(&template);
        Self { template, slots }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render a cell. A template without placeholders renders as itself.
    ///
    /// The value is substituted once per slot; braces inside the value stay literal.
    pub fn render(&self, value: &Value) -> String {
        let text = value.to_string();
        let mut result = String::with_capacity(self.template.len() + text.len());
        let mut last = 0;
        for slot in &self.slots {
            result.push_str(&self.template[last..slot.range.start]);
            result.push_str(&transform(&text, &slot.placeholder));
            last = slot.range.end;
        }
        result.push_str(&self.template[last..]);
        result
    }
}

impl From<String> for ColumnRenderer {
    fn from(template: String) -> Self {
        ColumnRenderer::new(template)
    }
}

fn transform(value: &str, placeholder: &Placeholder) -> String {
    match placeholder {
        Placeholder::Plain => value.to_string(),
        Placeholder::Upper => value.to_uppercase(),
        Placeholder::Lower => value.to_lowercase(),
        Placeholder::Title => title_case(value),
        Placeholder::Time(fmt) => format_time(value, fmt),
        Placeholder::Number(fmt) => format_number(value, fmt),
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// strftime formatting; values that are not dates are returned unchanged
fn format_time(value: &str, fmt: &str) -> String {
    const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    for pattern in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, pattern) {
            return dt.format(fmt).to_string();
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return d.format(fmt).to_string();
    }
    if let Ok(t) = NaiveTime::parse_from_str(value, "%H:%M:%S%.f") {
        return t.format(fmt).to_string();
    }
    value.to_string()
}

/// printf formatting; values that are not numbers are returned unchanged
fn format_number(value: &str, fmt: &str) -> String {
    match value.parse::<f64>() {
        Ok(n) => sprintf::sprintf!(fmt, n).unwrap_or_else(|_| value.to_string()),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_plain_placeholder() {
        let renderer = ColumnRenderer::new("<b>{}</b>");
        assert_eq!(renderer.render(&text("acme")), "<b>acme</b>");
        assert_eq!(renderer.render(&Value::Int(25)), "<b>25</b>");
    }

    #[test]
    fn test_case_placeholders() {
        assert_eq!(ColumnRenderer::new("{:UPPER}").render(&text("north")), "NORTH");
        assert_eq!(ColumnRenderer::new("{:lower}").render(&text("HELLO")), "hello");
        assert_eq!(
            ColumnRenderer::new("Region: {:Title}").render(&text("us east")),
            "Region: Us East"
        );
    }

    #[test]
    fn test_time_placeholder() {
        let renderer = ColumnRenderer::new("{:time %b %Y}");
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(renderer.render(&date), "Jan 2024");
        assert_eq!(renderer.render(&text("2024-02-15 10:30:00")), "Feb 2024");
    }

    #[test]
    fn test_time_placeholder_falls_back() {
        let renderer = ColumnRenderer::new("{:time %Y}");
        assert_eq!(renderer.render(&text("not-a-date")), "not-a-date");
    }

    #[test]
    fn test_number_placeholder() {
        assert_eq!(
            ColumnRenderer::new("${:num %.2f}").render(&Value::Float(25.5)),
            "$25.50"
        );
        assert_eq!(
            ColumnRenderer::new("{:num %.0f} items").render(&Value::Float(25.7)),
            "26 items"
        );
        assert_eq!(
            ColumnRenderer::new("{:num %.2f}").render(&text("hello")),
            "hello"
        );
    }

    #[test]
    fn test_multiple_placeholders() {
        let renderer = ColumnRenderer::new("{} - {:UPPER}");
        assert_eq!(renderer.render(&text("hello")), "hello - HELLO");
    }

    #[test]
    fn test_braces_in_value_are_not_expanded() {
        let renderer = ColumnRenderer::new("{} / {:UPPER}");
        assert_eq!(renderer.render(&text("a{}b")), "a{}b / A{}B");
        assert_eq!(
            ColumnRenderer::new("<{}>").render(&text("{:lower}")),
            "<{:lower}>"
        );
    }

    #[test]
    fn test_no_placeholder_is_literal() {
        let renderer = ColumnRenderer::new("Constant");
        assert_eq!(renderer.render(&text("A")), "Constant");
    }

    #[test]
    fn test_deserialize_from_string() {
        let renderer: ColumnRenderer = serde_json::from_str("\"<i>{}</i>\"").unwrap();
        assert_eq!(renderer.template(), "<i>{}</i>");
        assert_eq!(renderer.render(&text("x")), "<i>x</i>");
    }
}
