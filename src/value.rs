//! Field values and tuples.

use std::fmt;

/// A single typed field value.
///
/// Values are totally ordered so relations can be scanned in a
/// deterministic order and tuples can live in ordered sets.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Bool(_) => ColumnType::Bool,
            Value::Int(_) => ColumnType::Int,
            Value::Str(_) => ColumnType::Str,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
        }
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Declared type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Int,
    Str,
    /// Accepts values of any type
    Any,
}

impl ColumnType {
    /// Does `value` fit in a column of this type?
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            ColumnType::Any => true,
            ty => *ty == value.column_type(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Str => "str",
            ColumnType::Any => "any",
        };
        f.write_str(name)
    }
}

/// An ordered, fixed-arity row of values.
pub type Tuple = Vec<Value>;

/// Build a tuple from anything convertible to values.
///
/// ```
/// use rse_engine::value::{tuple, Value};
/// assert_eq!(tuple([5, 10]), vec![Value::Int(5), Value::Int(10)]);
/// ```
pub fn tuple<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Tuple {
    values.into_iter().map(Into::into).collect()
}

/// Render a tuple as `(a, b, c)` for log and error messages.
pub fn display_tuple(tuple: &[Value]) -> String {
    let fields: Vec<String> = tuple.iter().map(|v| v.to_string()).collect();
    format!("({})", fields.join(", "))
}
