//! Tagged runtime value.
//!
//! The VM operates on a closed sum of five shapes. Coercions are total: any
//! value can be read as any primitive, with nulls acting as 0/false/"" and
//! bools as 1/0 in numeric context. Mixed numeric operands promote to float;
//! the promotion ladder (String > Float > Int) lives in the comparison
//! helpers here so the VM and the debugger agree on it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Int,
    Float,
    Bool,
    String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Int(i32),
    Float(f32),
    Bool(bool),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
        }
    }

    pub fn as_int(&self) -> i32 {
        match self {
            Value::Null => 0,
            Value::Int(v) => *v,
            Value::Float(v) => *v as i32,
            Value::Bool(b) => *b as i32,
            Value::String(s) => s.trim().parse().unwrap_or(0),
        }
    }

    pub fn as_float(&self) -> f32 {
        match self {
            Value::Null => 0.0,
            Value::Int(v) => *v as f32,
            Value::Float(v) => *v,
            Value::Bool(b) => *b as i32 as f32,
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    /// Type-aware equality. Null equals only Null; strings compare textually
    /// (coercing the other side); bools compare as bools; otherwise the
    /// numeric ladder applies.
    pub fn loose_eq(&self, other: &Value) -> bool {
        use ValueType::*;
        match (self.value_type(), other.value_type()) {
            (Null, Null) => true,
            (Null, _) | (_, Null) => false,
            (String, _) | (_, String) => self.as_string() == other.as_string(),
            (Bool, Bool) => self.as_bool() == other.as_bool(),
            (Float, _) | (_, Float) => self.as_float() == other.as_float(),
            _ => self.as_int() == other.as_int(),
        }
    }

    /// Type-aware ordering predicate used by LT/LE/GT/GE. Strings order
    /// lexicographically; everything else goes through the numeric ladder
    /// (null = 0, bool = 0/1).
    pub fn loose_lt(&self, other: &Value) -> bool {
        use ValueType::*;
        match (self.value_type(), other.value_type()) {
            (String, _) | (_, String) => self.as_string() < other.as_string(),
            (Float, _) | (_, Float) => self.as_float() < other.as_float(),
            _ => self.as_int() < other.as_int(),
        }
    }

    pub fn loose_le(&self, other: &Value) -> bool {
        use ValueType::*;
        match (self.value_type(), other.value_type()) {
            (String, _) | (_, String) => self.as_string() <= other.as_string(),
            (Float, _) | (_, Float) => self.as_float() <= other.as_float(),
            _ => self.as_int() <= other.as_int(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::String(s) => write!(f, "{s}"),
        }
    }
}
