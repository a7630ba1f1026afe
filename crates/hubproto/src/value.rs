//! Typed keyword values and the converters that produce them.

use serde::{Deserialize, Serialize};

/// A converted keyword value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Numeric view; integers widen to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Str(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Conversion failure for a single token
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {token:?} to {kind}")]
pub struct ConvertError {
    pub token: String,
    pub kind: &'static str,
}

/// Per-position conversion applied to raw keyword tokens.
///
/// The `*OrNone` variants treat an empty token as "no value" instead of an
/// error; actors leave a field empty when, for example, a camera saved no file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Converter {
    Str,
    Int,
    Float,
    Bool,
    IntOrNone,
    FloatOrNone,
}

impl Converter {
    pub fn name(self) -> &'static str {
        match self {
            Converter::Str => "str",
            Converter::Int => "int",
            Converter::Float => "float",
            Converter::Bool => "bool",
            Converter::IntOrNone => "int or none",
            Converter::FloatOrNone => "float or none",
        }
    }

    /// Convert one present token.
    pub fn convert(self, token: &str) -> Result<Option<Value>, ConvertError> {
        let t = token.trim();
        let fail = || ConvertError {
            token: token.to_string(),
            kind: self.name(),
        };

        match self {
            Converter::Str => Ok(Some(Value::Str(token.to_string()))),
            Converter::IntOrNone | Converter::FloatOrNone if t.is_empty() => Ok(None),
            Converter::Int | Converter::IntOrNone => {
                t.parse::<i64>().map(|v| Some(Value::Int(v))).map_err(|_| fail())
            }
            Converter::Float | Converter::FloatOrNone => {
                t.parse::<f64>().map(|v| Some(Value::Float(v))).map_err(|_| fail())
            }
            Converter::Bool => parse_bool(t).map(|v| Some(Value::Bool(v))).ok_or_else(fail),
        }
    }

    /// Convert a token that may already be absent (`?` on the wire).
    pub fn convert_opt(self, token: Option<&str>) -> Result<Option<Value>, ConvertError> {
        match token {
            Some(t) => self.convert(t),
            None => Ok(None),
        }
    }
}

fn parse_bool(t: &str) -> Option<bool> {
    match t.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" => Some(true),
        "0" | "f" | "false" | "n" | "no" => Some(false),
        _ => None,
    }
}
