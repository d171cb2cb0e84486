//! Channel model and the double-buffered process image.
//!
//! Every measured or commanded quantity of every component lives in a
//! channel addressed by `component/channel` and described by a [`ChannelDoc`]. Drivers and the
//! engine write into the *next* slot; [`ProcessImage::swap`] promotes all next
//! values at once and publishes an immutable [`Snapshot`] that stays valid for
//! the whole cycle.

pub mod process_image;
pub mod value;

pub use process_image::{ProcessImage, Snapshot, SwapReport};
pub use value::{Unit, Value, ValueType};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ChannelError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelAddress),
    #[error("Channel {address} expects {expected}, got {actual}")]
    TypeMismatch {
        address: ChannelAddress,
        expected: ValueType,
        actual: ValueType,
    },
    #[error("Value {value} out of range [{min:?}, {max:?}] for {address}")]
    OutOfRange {
        address: ChannelAddress,
        value: Value,
        min: Option<f64>,
        max: Option<f64>,
    },
    #[error("Channel {0} is read-only")]
    ReadOnly(ChannelAddress),
    #[error("Invalid channel address: {0}")]
    InvalidAddress(String),
}

/// Identity of a channel: owning component plus channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelAddress {
    pub component_id: String,
    pub channel_id: String,
}

impl ChannelAddress {
    pub fn new(component_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.component_id, self.channel_id)
    }
}

impl FromStr for ChannelAddress {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((component, channel)) if !component.is_empty() && !channel.is_empty() => {
                Ok(Self::new(component, channel))
            }
            _ => Err(ChannelError::InvalidAddress(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// What happens to a numeric write outside of the declared bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WritePolicy {
    #[default]
    Clamp,
    Reject,
}

/// Declared metadata of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDoc {
    pub value_type: ValueType,
    pub unit: Unit,
    pub access: AccessMode,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub policy: WritePolicy,
}

impl ChannelDoc {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            unit: Unit::None,
            access: AccessMode::ReadOnly,
            min: None,
            max: None,
            policy: WritePolicy::Clamp,
        }
    }

    pub fn integer() -> Self {
        Self::new(ValueType::Integer)
    }

    pub fn long() -> Self {
        Self::new(ValueType::Long)
    }

    pub fn float() -> Self {
        Self::new(ValueType::Float)
    }

    pub fn boolean() -> Self {
        Self::new(ValueType::Boolean)
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn read_write(mut self) -> Self {
        self.access = AccessMode::ReadWrite;
        self
    }

    pub fn bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn reject_out_of_range(mut self) -> Self {
        self.policy = WritePolicy::Reject;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access == AccessMode::ReadWrite
    }

    /// Validates a value against type and write bounds.
    pub fn validate(&self, address: &ChannelAddress, value: Value) -> Result<Value, ChannelError> {
        let typed = value
            .coerce(self.value_type)
            .ok_or_else(|| ChannelError::TypeMismatch {
                address: address.clone(),
                expected: self.value_type,
                actual: value.value_type(),
            })?;

        let (bounded, changed) = typed.clamp_to(self.min, self.max);
        if changed && self.policy == WritePolicy::Reject {
            return Err(ChannelError::OutOfRange {
                address: address.clone(),
                value: typed,
                min: self.min,
                max: self.max,
            });
        }
        Ok(bounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip_display() {
        let addr: ChannelAddress = "ess0/ActivePower".parse().unwrap();
        assert_eq!(addr, ChannelAddress::new("ess0", "ActivePower"));
        assert_eq!(addr.to_string(), "ess0/ActivePower");
        assert!("ess0".parse::<ChannelAddress>().is_err());
        assert!("/x".parse::<ChannelAddress>().is_err());
    }

    #[test]
    fn test_validate_clamps_by_default() {
        let addr = ChannelAddress::new("ess0", "SetActivePowerEquals");
        let doc = ChannelDoc::integer().read_write().bounds(-5000.0, 5000.0);
        assert_eq!(doc.validate(&addr, Value::Integer(9000)), Ok(Value::Integer(5000)));
        assert_eq!(doc.validate(&addr, Value::Float(-7000.4)), Ok(Value::Integer(-5000)));
    }

    #[test]
    fn test_validate_reject_policy() {
        let addr = ChannelAddress::new("ess0", "Mode");
        let doc = ChannelDoc::integer().bounds(0.0, 3.0).reject_out_of_range();
        assert!(matches!(
            doc.validate(&addr, Value::Integer(4)),
            Err(ChannelError::OutOfRange { .. })
        ));
        assert_eq!(doc.validate(&addr, Value::Integer(2)), Ok(Value::Integer(2)));
    }

    #[test]
    fn test_validate_type_mismatch() {
        let addr = ChannelAddress::new("meter0", "Relay");
        let doc = ChannelDoc::boolean();
        assert!(matches!(
            doc.validate(&addr, Value::Integer(1)),
            Err(ChannelError::TypeMismatch { .. })
        ));
    }
}
