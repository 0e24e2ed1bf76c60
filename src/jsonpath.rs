//! Path lookups into decoded JSON documents
//!
//! A path is a list of segments joined by a configurable separator. Object
//! members are addressed by key, array elements by index (`3` or `[3]`).

use serde_json::Value;

/// Find the value at `path` inside `document`
///
/// Returns `None` if any segment is missing.
pub fn find<'a>(document: &'a Value, path: &str, separator: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(document);
    }
    path.split(separator)
        .try_fold(document, |current, segment| step(current, segment))
}

fn step<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => {
            let index = segment
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .unwrap_or(segment);
            index.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_with_custom_separator() {
        let doc = json!({"SDS0X1": {"PM2": {"5": 4.9}}});
        assert_eq!(find(&doc, "SDS0X1->PM2->5", "->"), Some(&json!(4.9)));
    }

    #[test]
    fn test_dots_in_key() {
        let doc = json!({"SDS0X1": {"PM2.5": 4.9, "PM10": 8.5}});
        assert_eq!(find(&doc, "SDS0X1->PM2.5", "->"), Some(&json!(4.9)));
        assert_eq!(find(&doc, "SDS0X1.PM2.5", "."), None);
    }

    #[test]
    fn test_top_level() {
        let doc = json!({"temperature": 8.5});
        assert_eq!(find(&doc, "temperature", "."), Some(&json!(8.5)));
    }

    #[test]
    fn test_missing() {
        let doc = json!({"a": {"b": 1}});
        assert_eq!(find(&doc, "a.c", "."), None);
        assert_eq!(find(&doc, "a.b.c", "."), None);
    }

    #[test]
    fn test_array_index() {
        let doc = json!({"sensors": [{"t": 1.0}, {"t": 2.0}]});
        assert_eq!(find(&doc, "sensors.1.t", "."), Some(&json!(2.0)));
        assert_eq!(find(&doc, "sensors.[0].t", "."), Some(&json!(1.0)));
        assert_eq!(find(&doc, "sensors.5.t", "."), None);
    }
}
