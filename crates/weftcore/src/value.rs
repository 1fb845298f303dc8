use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dynamic value type for step parameters, variables and outputs.
///
/// Serialized untagged, so workflow files and persisted state are plain JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Loose truthiness used by step conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty() && s != "false" && s != "False",
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        }
    }

    /// Walk a dotted path. Objects are indexed by key, arrays by position.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            let segment = segment.as_ref();
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Canonical text form substituted into templates.
    ///
    /// Floats always carry a fractional part (`1.0`), integers never do, and
    /// bools are capitalised (`True`). Inside arrays and objects values keep
    /// their JSON spelling.
    pub fn to_template_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => format_float(*n),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn format_float(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        n.to_string()
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_strings() {
        assert_eq!(Value::Number(1.0).to_template_string(), "1.0");
        assert_eq!(Value::Number(2.5).to_template_string(), "2.5");
        assert_eq!(Value::Integer(42).to_template_string(), "42");
        assert_eq!(Value::Bool(true).to_template_string(), "True");
        assert_eq!(Value::Bool(false).to_template_string(), "False");
        assert_eq!(Value::Null.to_template_string(), "null");
        assert_eq!(
            Value::Array(vec![Value::Integer(1), "a".into()]).to_template_string(),
            r#"[1,"a"]"#
        );
    }

    #[test]
    fn plain_json_round_trips_through_untagged_enum() {
        let parsed: Value = serde_json::from_value(json!({
            "url": "http://x",
            "count": 3,
            "ratio": 0.5,
            "ok": true,
            "tags": ["a", null]
        }))
        .unwrap();

        assert_eq!(parsed.get_path(&["count"]), Some(&Value::Integer(3)));
        assert_eq!(parsed.get_path(&["ratio"]), Some(&Value::Number(0.5)));
        assert_eq!(parsed.get_path(&["tags", "1"]), Some(&Value::Null));
        assert_eq!(parsed.get_path(&["tags", "9"]), None);
        assert_eq!(parsed.get_path(&["url", "deeper"]), None);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::String("false".into()).is_truthy());
        assert!(!Value::String("False".into()).is_truthy());
        assert!(Value::Integer(2).is_truthy());
        assert!(Value::Array(vec![Value::Null]).is_truthy());
    }
}
