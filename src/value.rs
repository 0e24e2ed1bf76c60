//! Value coercion
//!
//! Decoded payload values arrive loosely typed. [`PayloadValue`] tags them
//! once at the boundary and [`coerce`] turns them into a float according to
//! the metric configuration.

use serde_json::Value as JsonValue;

use crate::config::MetricConfig;
use crate::error::{BridgeError, Result};

/// A decoded payload value
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Bool(bool),
    String(String),
    Number(f64),
    /// Any other decoded shape, carrying its type name
    Unsupported(&'static str),
}

impl From<&JsonValue> for PayloadValue {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Bool(b) => PayloadValue::Bool(*b),
            JsonValue::String(s) => PayloadValue::String(s.clone()),
            JsonValue::Number(n) => match n.as_f64() {
                Some(f) => PayloadValue::Number(f),
                None => PayloadValue::Unsupported("number"),
            },
            JsonValue::Null => PayloadValue::Unsupported("null"),
            JsonValue::Array(_) => PayloadValue::Unsupported("array"),
            JsonValue::Object(_) => PayloadValue::Unsupported("object"),
        }
    }
}

/// Convert a payload value into a float
pub fn coerce(config: &MetricConfig, value: &PayloadValue) -> Result<f64> {
    match value {
        PayloadValue::Bool(true) => Ok(1.0),
        PayloadValue::Bool(false) => Ok(0.0),
        PayloadValue::String(s) => match config.string_value_mapping {
            Some(ref mapping) => match mapping.map.get(s.as_str()) {
                Some(mapped) => Ok(*mapped),
                None => mapping
                    .error_value
                    .ok_or_else(|| BridgeError::UnmappedStringValue { value: s.clone() }),
            },
            None => s
                .parse::<f64>()
                .map_err(|_| BridgeError::UnparsableNumber { value: s.clone() }),
        },
        PayloadValue::Number(n) => Ok(*n),
        PayloadValue::Unsupported(kind) => Err(BridgeError::UnsupportedValueType { kind }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StringValueMapping;
    use serde_json::json;

    fn mapped(error_value: Option<f64>) -> MetricConfig {
        MetricConfig {
            string_value_mapping: Some(StringValueMapping {
                error_value,
                map: [("foo".to_string(), 112.0), ("bar".to_string(), 2.0)]
                    .into_iter()
                    .collect(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_bool_values() {
        let config = MetricConfig::default();
        assert_eq!(coerce(&config, &PayloadValue::Bool(true)).unwrap(), 1.0);
        assert_eq!(coerce(&config, &PayloadValue::Bool(false)).unwrap(), 0.0);
    }

    #[test]
    fn test_number_passthrough() {
        let config = MetricConfig::default();
        assert_eq!(coerce(&config, &PayloadValue::Number(12.6)).unwrap(), 12.6);
    }

    #[test]
    fn test_string_parsed_as_float() {
        let config = MetricConfig::default();
        let value = PayloadValue::String("12.6".to_string());
        assert_eq!(coerce(&config, &value).unwrap(), 12.6);
    }

    #[test]
    fn test_unparsable_string() {
        let config = MetricConfig::default();
        let value = PayloadValue::String("12.6.5".to_string());
        assert!(matches!(
            coerce(&config, &value),
            Err(BridgeError::UnparsableNumber { .. })
        ));
    }

    #[test]
    fn test_padded_string_rejected() {
        let config = MetricConfig::default();
        let value = PayloadValue::String(" 12.6".to_string());
        assert!(matches!(
            coerce(&config, &value),
            Err(BridgeError::UnparsableNumber { .. })
        ));
    }

    #[test]
    fn test_string_mapping() {
        let config = mapped(None);
        let value = PayloadValue::String("foo".to_string());
        assert_eq!(coerce(&config, &value).unwrap(), 112.0);
    }

    #[test]
    fn test_unmapped_string_with_error_value() {
        let config = mapped(Some(12333.0));
        let value = PayloadValue::String("baz".to_string());
        assert_eq!(coerce(&config, &value).unwrap(), 12333.0);
    }

    #[test]
    fn test_unmapped_string_without_error_value() {
        let config = mapped(None);
        let value = PayloadValue::String("baz".to_string());
        assert_eq!(
            coerce(&config, &value),
            Err(BridgeError::UnmappedStringValue {
                value: "baz".to_string()
            })
        );
    }

    #[test]
    fn test_mapping_does_not_parse_numbers() {
        let config = mapped(None);
        let value = PayloadValue::String("1.5".to_string());
        assert!(coerce(&config, &value).is_err());
    }

    #[test]
    fn test_from_json() {
        assert_eq!(PayloadValue::from(&json!(true)), PayloadValue::Bool(true));
        assert_eq!(PayloadValue::from(&json!(4.9)), PayloadValue::Number(4.9));
        assert_eq!(PayloadValue::from(&json!(7)), PayloadValue::Number(7.0));
        assert_eq!(
            PayloadValue::from(&json!("on")),
            PayloadValue::String("on".to_string())
        );
        assert_eq!(
            PayloadValue::from(&json!({"a": 1})),
            PayloadValue::Unsupported("object")
        );
    }

    #[test]
    fn test_unsupported_type() {
        let config = MetricConfig::default();
        assert_eq!(
            coerce(&config, &PayloadValue::Unsupported("array")),
            Err(BridgeError::UnsupportedValueType { kind: "array" })
        );
    }
}
