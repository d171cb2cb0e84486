use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// A single typed channel value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Integer(i32),
    Long(i64),
    Float(f64),
    Boolean(bool),
    Enum(i32),
}

/// Declared semantic type of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Long,
    Float,
    Boolean,
    Enum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString)]
pub enum Unit {
    #[default]
    #[strum(serialize = "")]
    None,
    #[strum(serialize = "W")]
    Watt,
    #[strum(serialize = "var")]
    Var,
    #[strum(serialize = "VA")]
    VoltAmpere,
    #[strum(serialize = "Wh")]
    WattHours,
    #[strum(serialize = "%")]
    Percent,
    #[strum(serialize = "V")]
    Volt,
    #[strum(serialize = "A")]
    Ampere,
    #[strum(serialize = "°C")]
    Celsius,
    #[strum(serialize = "ms")]
    Millisecond,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Integer(_) => ValueType::Integer,
            Value::Long(_) => ValueType::Long,
            Value::Float(_) => ValueType::Float,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Enum(_) => ValueType::Enum,
        }
    }

    /// Numeric view of the value. Booleans map to 0/1.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Integer(v) | Value::Enum(v) => v as f64,
            Value::Long(v) => v as f64,
            Value::Float(v) => v,
            Value::Boolean(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Integral view of the value; floats round half away from zero.
    pub fn as_i64(&self) -> i64 {
        match *self {
            Value::Integer(v) | Value::Enum(v) => v as i64,
            Value::Long(v) => v,
            Value::Float(v) => v.round() as i64,
            Value::Boolean(v) => v as i64,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Boolean(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Long(_) | Value::Float(_))
    }

    /// Converts into the given type. Returns `None` when the kinds are incompatible
    /// (booleans only convert to booleans, enums accept integers).
    pub fn coerce(self, target: ValueType) -> Option<Value> {
        match (target, self) {
            (ValueType::Boolean, Value::Boolean(v)) => Some(Value::Boolean(v)),
            (ValueType::Boolean, _) | (_, Value::Boolean(_)) => None,
            (ValueType::Enum, Value::Enum(v) | Value::Integer(v)) => Some(Value::Enum(v)),
            (ValueType::Enum, _) => None,
            (_, Value::Enum(_)) => None,
            (ValueType::Integer, v) => {
                let n = v.as_i64().clamp(i32::MIN as i64, i32::MAX as i64);
                Some(Value::Integer(n as i32))
            }
            (ValueType::Long, v) => Some(Value::Long(v.as_i64())),
            (ValueType::Float, v) => Some(Value::Float(v.as_f64())),
        }
    }

    /// Clamps a numeric value into `[min, max]`. Returns the value and whether it changed.
    pub(crate) fn clamp_to(self, min: Option<f64>, max: Option<f64>) -> (Value, bool) {
        if !self.is_numeric() {
            return (self, false);
        }
        let raw = self.as_f64();
        let mut bounded = raw;
        if let Some(max) = max {
            bounded = bounded.min(max);
        }
        if let Some(min) = min {
            bounded = bounded.max(min);
        }
        if bounded == raw {
            return (self, false);
        }
        let clamped = match self {
            Value::Integer(_) => Value::Integer(bounded.round() as i32),
            Value::Long(_) => Value::Long(bounded.round() as i64),
            _ => Value::Float(bounded),
        };
        (clamped, true)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) | Value::Enum(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:.3}"),
            Value::Boolean(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}
