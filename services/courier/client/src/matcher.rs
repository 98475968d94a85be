//! Content matchers for subscriptions.
//!
//! A matcher is a JSON object; every member is an equality test on a message
//! field and all of them must hold. Values are strings or integers. The empty
//! object matches every message.

use courier_wire::{Message, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expected {
    Str(String),
    Long(i64),
}

/// Parsed conjunction of field equality tests
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Matcher {
    fields: BTreeMap<String, Expected>,
}

impl Matcher {
    /// Parse a matcher; an empty string is the same as `{}`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::default());
        }

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ClientError::InvalidMatcher(format!("{}: {}", text, e)))?;
        let object = parsed
            .as_object()
            .ok_or_else(|| ClientError::InvalidMatcher(format!("{}: not a JSON object", text)))?;

        let mut fields = BTreeMap::new();
        for (name, value) in object {
            if name.is_empty() {
                return Err(ClientError::InvalidMatcher("empty field name".to_string()));
            }
            let expected = match value {
                serde_json::Value::String(s) => Expected::Str(s.clone()),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(v) => Expected::Long(v),
                    None => {
                        return Err(ClientError::InvalidMatcher(format!(
                            "field {}: only integer numbers are supported",
                            name
                        )))
                    }
                },
                other => {
                    return Err(ClientError::InvalidMatcher(format!(
                        "field {}: unsupported value {}",
                        name, other
                    )))
                }
            };
            fields.insert(name.clone(), expected);
        }
        Ok(Self { fields })
    }

    /// Whether `message` satisfies every field test
    pub fn matches(&self, message: &Message) -> bool {
        self.fields.iter().all(|(name, expected)| {
            match (expected, message.get(name)) {
                (Expected::Str(want), Some(Value::String(have))) => want == have,
                (Expected::Long(want), Some(Value::Long(have))) => want == have,
                _ => false,
            }
        })
    }

    /// Whether this matcher accepts everything
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Canonical JSON form with members sorted by name; sent to the server
impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(name, expected)| {
                let value = match expected {
                    Expected::Str(s) => serde_json::Value::from(s.as_str()),
                    Expected::Long(v) => serde_json::Value::from(*v),
                };
                (name.clone(), value)
            })
            .collect();
        write!(f, "{}", serde_json::Value::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new()
            .with_destination("sample")
            .with("type", "example")
            .with("long", 101i64)
            .with("ratio", 0.5f64)
    }

    #[test]
    fn test_empty_matches_everything() {
        assert!(Matcher::parse("{}").unwrap().matches(&sample()));
        assert!(Matcher::parse("").unwrap().matches(&Message::new()));
        assert!(Matcher::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_conjunction() {
        let matcher = Matcher::parse(r#"{"type":"example","long":101}"#).unwrap();
        assert!(matcher.matches(&sample()));

        let matcher = Matcher::parse(r#"{"type":"example","long":102}"#).unwrap();
        assert!(!matcher.matches(&sample()));

        let matcher = Matcher::parse(r#"{"missing":"x"}"#).unwrap();
        assert!(!matcher.matches(&sample()));
    }

    #[test]
    fn test_kind_must_match() {
        let matcher = Matcher::parse(r#"{"long":"101"}"#).unwrap();
        assert!(!matcher.matches(&sample()));
    }

    #[test]
    fn test_invalid_matchers() {
        for text in [
            "not json",
            "[1,2]",
            "\"type\"",
            r#"{"ratio":0.5}"#,
            r#"{"flag":true}"#,
            r#"{"nested":{"a":1}}"#,
            r#"{"":"x"}"#,
        ] {
            assert!(
                matches!(Matcher::parse(text), Err(ClientError::InvalidMatcher(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_canonical_form() {
        let matcher = Matcher::parse(r#"{ "type" : "example", "long": 101 }"#).unwrap();
        assert_eq!(matcher.to_string(), r#"{"long":101,"type":"example"}"#);
        assert_eq!(Matcher::parse("").unwrap().to_string(), "{}");
    }
}
