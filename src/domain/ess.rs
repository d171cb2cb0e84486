use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};

use super::types::{Phase, Pwr};
use crate::channel::{ChannelAddress, ChannelDoc, ProcessImage, Snapshot, Unit};

/// Physical capability of an energy storage system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EssKind {
    /// Three-phase device accepting a single setpoint
    #[default]
    Symmetric,
    /// Device accepting individual setpoints per phase
    Asymmetric,
}

/// How callers want to dispatch an ESS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseMode {
    #[default]
    Symmetric,
    Asymmetric,
}

/// Channels every ESS component exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
pub enum EssChannel {
    Soc,
    ActivePower,
    ReactivePower,
    MaxApparentPower,
    AllowedChargePower,
    AllowedDischargePower,
    SetActivePowerEquals,
    SetReactivePowerEquals,
    SetActivePowerL1Equals,
    SetActivePowerL2Equals,
    SetActivePowerL3Equals,
    SetReactivePowerL1Equals,
    SetReactivePowerL2Equals,
    SetReactivePowerL3Equals,
    DebugSetActivePower,
    DebugSetReactivePower,
}

impl EssChannel {
    pub fn doc(self) -> ChannelDoc {
        use EssChannel::*;
        match self {
            Soc => ChannelDoc::integer().unit(Unit::Percent),
            ActivePower | AllowedChargePower | AllowedDischargePower | DebugSetActivePower => {
                ChannelDoc::integer().unit(Unit::Watt)
            }
            ReactivePower | DebugSetReactivePower => ChannelDoc::integer().unit(Unit::Var),
            MaxApparentPower => ChannelDoc::integer().unit(Unit::VoltAmpere),
            SetActivePowerEquals | SetActivePowerL1Equals | SetActivePowerL2Equals
            | SetActivePowerL3Equals => ChannelDoc::integer().unit(Unit::Watt).read_write(),
            SetReactivePowerEquals | SetReactivePowerL1Equals | SetReactivePowerL2Equals
            | SetReactivePowerL3Equals => ChannelDoc::integer().unit(Unit::Var).read_write(),
        }
    }

    /// Measured channels a driver is expected to refresh every cycle.
    pub fn is_measurement(self) -> bool {
        use EssChannel::*;
        matches!(
            self,
            Soc | ActivePower
                | ReactivePower
                | MaxApparentPower
                | AllowedChargePower
                | AllowedDischargePower
        )
    }

    pub fn is_setpoint(self) -> bool {
        self.doc().is_writable()
    }

    /// Setpoint channel for a power type, optionally for one phase.
    pub fn setpoint(pwr: Pwr, phase: Option<Phase>) -> Self {
        use EssChannel::*;
        match (pwr, phase) {
            (Pwr::Active, None) => SetActivePowerEquals,
            (Pwr::Active, Some(Phase::L1)) => SetActivePowerL1Equals,
            (Pwr::Active, Some(Phase::L2)) => SetActivePowerL2Equals,
            (Pwr::Active, Some(Phase::L3)) => SetActivePowerL3Equals,
            (Pwr::Reactive, None) => SetReactivePowerEquals,
            (Pwr::Reactive, Some(Phase::L1)) => SetReactivePowerL1Equals,
            (Pwr::Reactive, Some(Phase::L2)) => SetReactivePowerL2Equals,
            (Pwr::Reactive, Some(Phase::L3)) => SetReactivePowerL3Equals,
        }
    }

    pub fn debug_setpoint(pwr: Pwr) -> Self {
        match pwr {
            Pwr::Active => EssChannel::DebugSetActivePower,
            Pwr::Reactive => EssChannel::DebugSetReactivePower,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::iter().find(|c| c.as_ref() == id)
    }
}

/// Power limits of an ESS for the current cycle, in W / VA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EssLimits {
    pub max_apparent_power: i64,
    /// Always <= 0 (charging is negative)
    pub allowed_charge_power: i64,
    /// Always >= 0
    pub allowed_discharge_power: i64,
}

impl EssLimits {
    pub fn new(max_apparent_power: i64, allowed_charge_power: i64, allowed_discharge_power: i64) -> Self {
        Self {
            max_apparent_power: max_apparent_power.abs(),
            allowed_charge_power: -allowed_charge_power.abs(),
            allowed_discharge_power: allowed_discharge_power.max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ess {
    pub id: String,
    pub kind: EssKind,
}

impl Ess {
    pub fn new(id: impl Into<String>, kind: EssKind) -> Self {
        Self { id: id.into(), kind }
    }

    pub fn address(&self, channel: EssChannel) -> ChannelAddress {
        ChannelAddress::new(self.id.clone(), channel.as_ref())
    }

    pub fn register_channels(&self, image: &ProcessImage) {
        for channel in EssChannel::iter() {
            image.register(self.address(channel), channel.doc());
        }
    }

    /// Reads the dispatch limits. Undefined channels count as zero, which
    /// keeps a device without fresh limits at standstill.
    pub fn limits(&self, snapshot: &Snapshot) -> EssLimits {
        let read = |c: EssChannel| snapshot.get_i64(&self.id, c.as_ref()).unwrap_or(0);
        EssLimits::new(
            read(EssChannel::MaxApparentPower),
            read(EssChannel::AllowedChargePower),
            read(EssChannel::AllowedDischargePower),
        )
    }

    pub fn soc(&self, snapshot: &Snapshot) -> Option<i64> {
        snapshot.get_i64(&self.id, EssChannel::Soc.as_ref())
    }

    pub fn active_power(&self, snapshot: &Snapshot) -> Option<i64> {
        snapshot.get_i64(&self.id, EssChannel::ActivePower.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Value;

    #[test]
    fn test_limits_normalise_signs() {
        let limits = EssLimits::new(10_000, 4_000, 6_000);
        assert_eq!(limits.allowed_charge_power, -4_000);
        assert_eq!(limits.allowed_discharge_power, 6_000);

        let limits = EssLimits::new(-10_000, -4_000, -1);
        assert_eq!(limits.max_apparent_power, 10_000);
        assert_eq!(limits.allowed_charge_power, -4_000);
        assert_eq!(limits.allowed_discharge_power, 0);
    }

    #[test]
    fn test_limits_from_snapshot() {
        let image = ProcessImage::default();
        let ess = Ess::new("ess0", EssKind::Symmetric);
        ess.register_channels(&image);
        image.set_next(&ess.address(EssChannel::MaxApparentPower), Value::Integer(9000)).unwrap();
        image.set_next(&ess.address(EssChannel::AllowedChargePower), Value::Integer(-5000)).unwrap();
        image.swap(1);

        let limits = ess.limits(&image.snapshot());
        assert_eq!(limits, EssLimits::new(9000, -5000, 0));
    }

    #[test]
    fn test_setpoint_channel_lookup() {
        assert_eq!(EssChannel::setpoint(Pwr::Active, None), EssChannel::SetActivePowerEquals);
        assert_eq!(
            EssChannel::setpoint(Pwr::Reactive, Some(Phase::L2)),
            EssChannel::SetReactivePowerL2Equals
        );
        assert!(EssChannel::SetActivePowerL3Equals.is_setpoint());
        assert!(!EssChannel::DebugSetActivePower.is_setpoint());
        assert_eq!(EssChannel::from_id("Soc"), Some(EssChannel::Soc));
    }
}
