//! Connection-string parsing.
//!
//! Subscribe commands carry settings as `key=value` pairs separated by
//! semicolons. Values may be wrapped in `{}` to carry delimiters verbatim,
//! e.g. `filterExpression={FILTER ActiveMeasurements WHERE SignalType='FREQ'}`.
//! Keys are case-insensitive.

use std::collections::HashMap;

use crate::error::{PublisherError, Result};

/// Parsed connection-string settings with case-insensitive key lookup.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|value| {
            matches!(value.to_lowercase().as_str(), "true" | "yes" | "on" | "1")
        })
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parses `key=value;key={quoted value};…` with the default delimiters.
pub fn parse_key_value_pairs(input: &str) -> Result<Settings> {
    parse_key_value_pairs_with(input, ';', '=', '{', '}')
}

/// Parses a key/value connection string with explicit delimiters.
///
/// Empty segments are skipped. An unterminated quote or a segment with no
/// key/value delimiter is a configuration error.
pub fn parse_key_value_pairs_with(
    input: &str,
    pair_delimiter: char,
    key_value_delimiter: char,
    start_quote: char,
    end_quote: char,
) -> Result<Settings> {
    let mut values = HashMap::new();
    let chars: Vec<char> = input.chars().collect();
    let mut position = 0;

    while position < chars.len() {
        // Key runs up to the key/value delimiter.
        let key_start = position;
        while position < chars.len()
            && chars[position] != key_value_delimiter
            && chars[position] != pair_delimiter
        {
            position += 1;
        }

        let key: String = chars[key_start..position].iter().collect();
        let key = key.trim().to_lowercase();

        if position >= chars.len() || chars[position] == pair_delimiter {
            position += 1;
            if key.is_empty() {
                continue;
            }
            return Err(PublisherError::Configuration(format!(
                "connection string segment \"{key}\" has no value"
            )));
        }

        position += 1; // consume the key/value delimiter

        // Skip leading whitespace before the value.
        while position < chars.len() && chars[position].is_whitespace() {
            position += 1;
        }

        let value = if position < chars.len() && chars[position] == start_quote {
            position += 1;
            let value_start = position;
            while position < chars.len() && chars[position] != end_quote {
                position += 1;
            }
            if position >= chars.len() {
                return Err(PublisherError::Configuration(format!(
                    "unterminated quoted value for key \"{key}\""
                )));
            }
            let value: String = chars[value_start..position].iter().collect();
            position += 1; // consume the end quote
            // Skip to the next pair delimiter.
            while position < chars.len() && chars[position] != pair_delimiter {
                position += 1;
            }
            value
        } else {
            let value_start = position;
            while position < chars.len() && chars[position] != pair_delimiter {
                position += 1;
            }
            let value: String = chars[value_start..position].iter().collect();
            value.trim().to_string()
        };

        position += 1; // consume the pair delimiter if present

        if !key.is_empty() {
            values.insert(key, value);
        }
    }

    Ok(Settings { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_pairs() {
        let settings = parse_key_value_pairs("throttled=true; publishInterval=1000").unwrap();
        assert_eq!(settings.get("Throttled"), Some("true"));
        assert_eq!(settings.get_bool("THROTTLED"), Some(true));
        assert_eq!(settings.get_i64("publishinterval"), Some(1000));
    }

    #[test]
    fn test_quoted_value_keeps_delimiters() {
        let settings = parse_key_value_pairs(
            "filterExpression={FILTER ActiveMeasurements WHERE SignalType='FREQ'};includeTime=true",
        )
        .unwrap();
        assert_eq!(
            settings.get("filterexpression"),
            Some("FILTER ActiveMeasurements WHERE SignalType='FREQ'")
        );
        assert_eq!(settings.get_bool("includeTime"), Some(true));
    }

    #[test]
    fn test_quoted_value_with_semicolons() {
        let settings =
            parse_key_value_pairs("assemblyInfo={source=Test; version=1.2.3; buildDate=today}")
                .unwrap();
        assert_eq!(
            settings.get("assemblyinfo"),
            Some("source=Test; version=1.2.3; buildDate=today")
        );
    }

    #[test]
    fn test_empty_segments_skipped() {
        let settings = parse_key_value_pairs(";;a=1;;b=2;").unwrap();
        assert_eq!(settings.len(), 2);
    }

    #[test]
    fn test_unterminated_quote_fails() {
        assert!(parse_key_value_pairs("filterExpression={oops").is_err());
    }

    #[test]
    fn test_key_without_value_fails() {
        assert!(parse_key_value_pairs("danglingKey").is_err());
    }

    #[test]
    fn test_empty_input() {
        let settings = parse_key_value_pairs("").unwrap();
        assert!(settings.is_empty());
    }

    #[test]
    fn test_custom_delimiters() {
        let settings =
            parse_key_value_pairs_with("a:1|b:[x;y]|c:3", '|', ':', '[', ']').unwrap();
        assert_eq!(settings.get("a"), Some("1"));
        assert_eq!(settings.get("b"), Some("x;y"));
        assert_eq!(settings.get("c"), Some("3"));
    }
}
