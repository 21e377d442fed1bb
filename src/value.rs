use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::environment::LoadedTemplate;

/// A runtime value flowing through a render.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// A missing variable or attribute in lenient mode.
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A string that is already safe for output and never escaped again.
    Markup(String),
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// A loaded template, as produced by `import` or `template_from_string`.
    Template(TemplateRef),
}

/// Handle on a loaded template stored inside a [`Value`].
#[derive(Debug, Clone)]
pub struct TemplateRef(pub(crate) Arc<LoadedTemplate>);

impl TemplateRef {
    pub fn name(&self) -> &str {
        self.0.unit.name()
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) | Value::Markup(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Template(_) => true,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// `null` and undefined both count as "nothing" for tests and `??`.
    pub fn is_none(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Value::Markup(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) | Value::Markup(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "mapping",
            Value::Template(_) => "template",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Markup(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.as_number()? {
            Number::Int(i) => Some(i),
            Number::Float(f) if f.fract() == 0.0 => Some(f as i64),
            Number::Float(_) => None,
        }
    }

    /// Text written to the output by a print statement.
    pub fn render(&self) -> Result<String, String> {
        match self {
            Value::Array(_) | Value::Map(_) => Err(format!(
                "Cannot render a value of type \"{}\".",
                self.type_name()
            )),
            other => Ok(other.to_string()),
        }
    }

    pub fn length(&self) -> usize {
        match self {
            Value::Undefined | Value::Null => 0,
            Value::String(s) | Value::Markup(s) => s.chars().count(),
            Value::Array(a) => a.len(),
            Value::Map(m) => m.len(),
            other => other.to_string().chars().count(),
        }
    }

    /// Looks up `key` as a mapping key, sequence index or string offset.
    pub fn get_item(&self, key: &Value) -> Option<Value> {
        match self {
            Value::Map(m) => m.get(&key.to_string()).cloned(),
            Value::Array(a) => {
                let index = key.as_i64()?;
                let index = if index < 0 { a.len() as i64 + index } else { index };
                usize::try_from(index).ok().and_then(|i| a.get(i)).cloned()
            }
            Value::String(s) | Value::Markup(s) => {
                let index = usize::try_from(key.as_i64()?).ok()?;
                s.chars().nth(index).map(|c| Value::String(c.to_string()))
            }
            _ => None,
        }
    }

    /// Key/value pairs visited by a `for` loop. Anything else iterates as empty.
    pub fn iter_pairs(&self) -> Vec<(Value, Value)> {
        match self {
            Value::Array(a) => a
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v.clone()))
                .collect(),
            Value::Map(m) => m
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Value::Undefined | Value::Null => Some(Number::Int(0)),
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            Value::String(s) | Value::Markup(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Some(Number::Int(i))
                } else {
                    s.parse::<f64>().ok().map(Number::Float)
                }
            }
            _ => None,
        }
    }

    fn numbers(&self, other: &Value, op: &str) -> Result<(Number, Number), String> {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(format!(
                "Unsupported operand types for \"{op}\": \"{}\" and \"{}\".",
                self.type_name(),
                other.type_name()
            )),
        }
    }

    pub(crate) fn add(&self, other: &Value) -> Result<Value, String> {
        Ok(match self.numbers(other, "+")? {
            (Number::Int(a), Number::Int(b)) => a
                .checked_add(b)
                .map(Value::Int)
                .unwrap_or(Value::Float(a as f64 + b as f64)),
            (a, b) => Value::Float(a.as_f64() + b.as_f64()),
        })
    }

    pub(crate) fn sub(&self, other: &Value) -> Result<Value, String> {
        Ok(match self.numbers(other, "-")? {
            (Number::Int(a), Number::Int(b)) => a
                .checked_sub(b)
                .map(Value::Int)
                .unwrap_or(Value::Float(a as f64 - b as f64)),
            (a, b) => Value::Float(a.as_f64() - b.as_f64()),
        })
    }

    pub(crate) fn mul(&self, other: &Value) -> Result<Value, String> {
        Ok(match self.numbers(other, "*")? {
            (Number::Int(a), Number::Int(b)) => a
                .checked_mul(b)
                .map(Value::Int)
                .unwrap_or(Value::Float(a as f64 * b as f64)),
            (a, b) => Value::Float(a.as_f64() * b.as_f64()),
        })
    }

    pub(crate) fn div(&self, other: &Value) -> Result<Value, String> {
        let (a, b) = self.numbers(other, "/")?;
        if b.as_f64() == 0.0 {
            return Err("Division by zero.".to_string());
        }
        Ok(match (a, b) {
            (Number::Int(a), Number::Int(b)) if a.checked_rem(b) == Some(0) => a
                .checked_div(b)
                .map(Value::Int)
                .unwrap_or(Value::Float(a as f64 / b as f64)),
            (a, b) => Value::Float(a.as_f64() / b.as_f64()),
        })
    }

    pub(crate) fn floor_div(&self, other: &Value) -> Result<Value, String> {
        let (a, b) = self.numbers(other, "//")?;
        if b.as_f64() == 0.0 {
            return Err("Division by zero.".to_string());
        }
        Ok(Value::Int((a.as_f64() / b.as_f64()).floor() as i64))
    }

    pub(crate) fn rem(&self, other: &Value) -> Result<Value, String> {
        match self.numbers(other, "%")? {
            (_, Number::Int(0)) => Err("Modulo by zero.".to_string()),
            (Number::Int(a), Number::Int(b)) => Ok(Value::Int(a.wrapping_rem(b))),
            (a, b) => Ok(Value::Float(a.as_f64() % b.as_f64())),
        }
    }

    pub(crate) fn pow(&self, other: &Value) -> Result<Value, String> {
        Ok(match self.numbers(other, "**")? {
            (Number::Int(a), Number::Int(b)) if (0..=u32::MAX as i64).contains(&b) => a
                .checked_pow(b as u32)
                .map(Value::Int)
                .unwrap_or(Value::Float((a as f64).powf(b as f64))),
            (a, b) => Value::Float(a.as_f64().powf(b.as_f64())),
        })
    }

    pub(crate) fn neg(&self) -> Result<Value, String> {
        match self.as_number() {
            Some(Number::Int(i)) => Ok(i.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(i as f64)))),
            Some(Number::Float(f)) => Ok(Value::Float(-f)),
            None => Err(format!(
                "Unsupported operand type for unary \"-\": \"{}\".",
                self.type_name()
            )),
        }
    }

    pub(crate) fn pos(&self) -> Result<Value, String> {
        match self.as_number() {
            Some(Number::Int(i)) => Ok(Value::Int(i)),
            Some(Number::Float(f)) => Ok(Value::Float(f)),
            None => Err(format!(
                "Unsupported operand type for unary \"+\": \"{}\".",
                self.type_name()
            )),
        }
    }

    pub(crate) fn bit_op(&self, other: &Value, op: &str, f: fn(i64, i64) -> i64) -> Result<Value, String> {
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) => Ok(Value::Int(f(a, b))),
            _ => Err(format!(
                "Unsupported operand types for \"{op}\": \"{}\" and \"{}\".",
                self.type_name(),
                other.type_name()
            )),
        }
    }

    /// Equality used by `==`: numbers compare by value, numeric strings
    /// compare as numbers, null equals undefined.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_none() && b.is_none() => true,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.loose_eq(w)))
            }
            (a, b) => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a, b) {
                    (Value::Bool(x), y) | (y, Value::Bool(x)) => *x == y.is_truthy(),
                    _ => a.compare(b) == Some(Ordering::Equal),
                },
            },
        }
    }

    /// Ordering used by `<`, `>`, `<=>`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_str(), other.as_str()) {
            if let (Some(x), Some(y)) = (self.as_number(), other.as_number()) {
                return x.as_f64().partial_cmp(&y.as_f64());
            }
            return Some(a.cmp(b));
        }
        match (self.as_number(), other.as_number()) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => Some(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            _ => None,
        }
    }

    /// Strict identity used by the `same as` test.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Template(a), Value::Template(b)) => Arc::ptr_eq(&a.0, &b.0),
            (a, b) if a.type_name() == b.type_name() => a == b,
            _ => false,
        }
    }

    /// `needle in self`.
    pub fn contains(&self, needle: &Value) -> bool {
        match self {
            Value::String(s) | Value::Markup(s) => s.contains(&needle.to_string()),
            Value::Array(a) => a.iter().any(|v| v.loose_eq(needle)),
            Value::Map(m) => m.values().any(|v| v.loose_eq(needle)),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) | (Value::Markup(a), Value::Markup(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Template(a), Value::Template(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined | Value::Null => Ok(()),
            Value::Bool(true) => f.write_str("1"),
            Value::Bool(false) => Ok(()),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.fract() == 0.0 && x.abs() < 1e15 => write!(f, "{}", *x as i64),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) | Value::Markup(s) => f.write_str(s),
            Value::Array(_) => f.write_str("Array"),
            Value::Map(_) => f.write_str("Mapping"),
            Value::Template(t) => f.write_str(t.name()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::String(s) | Value::Markup(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Template(t) => serializer.serialize_str(t.name()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(entries) => {
                Value::Map(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(entries: IndexMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("0").is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(Value::from(vec![1]).is_truthy());
    }

    #[test]
    fn output_text() {
        assert_eq!(Value::Bool(true).to_string(), "1");
        assert_eq!(Value::Bool(false).to_string(), "");
        assert_eq!(Value::Float(3.0).to_string(), "3");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert!(Value::from(vec![1]).render().is_err());
    }

    #[test]
    fn arithmetic_promotes_to_float() {
        assert_eq!(Value::from(1).add(&Value::from(2)), Ok(Value::Int(3)));
        assert_eq!(Value::from(1).add(&Value::from(0.5)), Ok(Value::Float(1.5)));
        assert_eq!(Value::from(7).div(&Value::from(2)), Ok(Value::Float(3.5)));
        assert_eq!(Value::from(7).floor_div(&Value::from(2)), Ok(Value::Int(3)));
        assert_eq!(Value::from("4").mul(&Value::from(2)), Ok(Value::Int(8)));
        assert!(Value::from(1).div(&Value::from(0)).is_err());
        assert!(Value::from(vec![1]).add(&Value::from(1)).is_err());
    }

    #[test]
    fn integer_overflow_falls_back_to_float() {
        let min = Value::from(i64::MIN);
        assert_eq!(min.div(&Value::from(-1)), Ok(Value::Float(-(i64::MIN as f64))));
        assert_eq!(min.rem(&Value::from(-1)), Ok(Value::Int(0)));
        assert_eq!(min.neg(), Ok(Value::Float(-(i64::MIN as f64))));
        assert_eq!(Value::from(i64::MAX).add(&Value::from(1)), Ok(Value::Float(i64::MAX as f64 + 1.0)));
        assert_eq!(Value::from(-6).div(&Value::from(3)), Ok(Value::Int(-2)));
    }

    #[test]
    fn loose_equality() {
        assert!(Value::from(1).loose_eq(&Value::from(1.0)));
        assert!(Value::from("1").loose_eq(&Value::from(1)));
        assert!(Value::Null.loose_eq(&Value::Undefined));
        assert!(!Value::from("a").loose_eq(&Value::from("b")));
        assert!(!Value::from(1).same_as(&Value::from(1.0)));
    }

    #[test]
    fn item_lookup() {
        let list = Value::from(vec!["a", "b"]);
        assert_eq!(list.get_item(&Value::from(1)), Some(Value::from("b")));
        assert_eq!(list.get_item(&Value::from(-1)), Some(Value::from("b")));
        assert_eq!(list.get_item(&Value::from(5)), None);

        let json: Value = serde_json::json!({"role": "user"}).into();
        assert_eq!(json.get_item(&Value::from("role")), Some(Value::from("user")));
    }
}
