use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A value in the live data model. References yield these; the output
/// tree stores the rendered copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    Record(HashMap<String, Value>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null | Value::Bool(false) => false,
            Value::Bool(true) => true,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Record(_) => true,
        }
    }

    /// Field lookup on records; anything else yields Null.
    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Record(fields) => fields.get(name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Flat text form used for iteration keys. Composite values key by
    /// their display form, which is stable for unchanged data.
    pub fn key_text(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if *n == (*n as i64) as f64 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Text(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                let mut keys: Vec<&String> = fields.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, fields[*k])?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_whole_numbers_without_decimal() {
        assert_eq!(Value::Number(42.0).to_string(), "42");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Text(String::new()).truthy());
        assert!(Value::Number(1.0).truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::List(vec![]).truthy());
    }

    #[test]
    fn field_on_non_record_is_null() {
        assert_eq!(Value::Number(1.0).field("x"), Value::Null);
        let mut fields = HashMap::new();
        fields.insert("x".to_string(), Value::Number(7.0));
        assert_eq!(Value::Record(fields).field("x"), Value::Number(7.0));
    }

    #[test]
    fn record_display_is_key_sorted() {
        let mut fields = HashMap::new();
        fields.insert("b".to_string(), Value::Number(2.0));
        fields.insert("a".to_string(), Value::Number(1.0));
        assert_eq!(Value::Record(fields).to_string(), "{a: 1, b: 2}");
    }
}
