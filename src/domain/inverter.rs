use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::ess::{Ess, EssKind, EssLimits, PhaseMode};
use super::types::{Phase, Pwr};

/// Whether an inverter represents a whole device or one of its legs.
///
/// Chosen once at construction from device capability and phase mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InverterKind {
    ThreePhase,
    SinglePhase(Phase),
}

impl InverterKind {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            InverterKind::ThreePhase => None,
            InverterKind::SinglePhase(phase) => Some(*phase),
        }
    }

    /// Converts a device total into this inverter's share.
    ///
    /// Single-phase legs get a third of the device total. This is a
    /// conservative approximation: real devices may allow more imbalance.
    fn share(&self, device_total: i64) -> i64 {
        match self {
            InverterKind::ThreePhase => device_total,
            InverterKind::SinglePhase(_) => device_total / 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InverterId {
    pub ess_id: String,
    pub kind: InverterKind,
}

impl InverterId {
    pub fn three_phase(ess_id: impl Into<String>) -> Self {
        Self {
            ess_id: ess_id.into(),
            kind: InverterKind::ThreePhase,
        }
    }

    pub fn single_phase(ess_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            ess_id: ess_id.into(),
            kind: InverterKind::SinglePhase(phase),
        }
    }
}

impl fmt::Display for InverterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            InverterKind::ThreePhase => write!(f, "{}", self.ess_id),
            InverterKind::SinglePhase(phase) => write!(f, "{}/{}", self.ess_id, phase),
        }
    }
}

/// Dispatch unit fronting one ESS or one phase of it. Powers in W / var,
/// positive = discharge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inverter {
    pub id: InverterId,
    pub weight: u32,
    pub min_p: i64,
    pub max_p: i64,
    pub min_q: i64,
    pub max_q: i64,
    pub last_p: i64,
    pub next_p: i64,
    pub last_q: i64,
    pub next_q: i64,
    /// State of charge of the fronted ESS as of the last capture
    pub soc: Option<u8>,
}

impl Inverter {
    pub fn new(id: InverterId, weight: u32) -> Self {
        Self {
            id,
            weight,
            min_p: 0,
            max_p: 0,
            min_q: 0,
            max_q: 0,
            last_p: 0,
            next_p: 0,
            last_q: 0,
            next_q: 0,
            soc: None,
        }
    }

    /// Inverter with fixed active power bounds; mostly useful for tests and simulations.
    pub fn with_bounds(id: InverterId, weight: u32, min_p: i64, max_p: i64) -> Self {
        let mut inverter = Self::new(id, weight);
        inverter.min_p = min_p.min(max_p);
        inverter.max_p = max_p;
        let q = min_p.abs().max(max_p.abs());
        inverter.min_q = -q;
        inverter.max_q = q;
        inverter
    }

    /// Builds the dispatch units for an ESS. An asymmetric mode on a
    /// symmetric device falls back to a single three-phase inverter.
    pub fn for_ess(ess: &Ess, mode: PhaseMode, weight: u32) -> Vec<Inverter> {
        match (ess.kind, mode) {
            (EssKind::Asymmetric, PhaseMode::Asymmetric) => Phase::ALL
                .iter()
                .map(|phase| Inverter::new(InverterId::single_phase(ess.id.clone(), *phase), weight))
                .collect(),
            (EssKind::Symmetric, PhaseMode::Asymmetric) => {
                warn!(ess = %ess.id, "asymmetric dispatch requested for symmetric device, using three-phase");
                vec![Inverter::new(InverterId::three_phase(ess.id.clone()), weight)]
            }
            _ => vec![Inverter::new(InverterId::three_phase(ess.id.clone()), weight)],
        }
    }

    pub fn ess_id(&self) -> &str {
        &self.id.ess_id
    }

    /// Recomputes this cycle's bounds from the device limits, intersected with
    /// the caller's global bounds.
    pub fn update_min_max(&mut self, limits: &EssLimits, global_min: i64, global_max: i64) {
        let kind = self.id.kind;
        let apparent = kind.share(limits.max_apparent_power);
        let device_min = kind.share(limits.allowed_charge_power).max(-apparent);
        let device_max = kind.share(limits.allowed_discharge_power).min(apparent);

        let (min_p, max_p) = reconcile(device_min, device_max, global_min, global_max);
        if global_min > device_max.max(device_min) || global_max < device_min {
            warn!(inverter = %self.id, global_min, global_max, "global bounds do not overlap device range");
        }
        self.min_p = min_p;
        self.max_p = max_p;
        self.min_q = -apparent;
        self.max_q = apparent;
    }

    /// Takes over a SoC reading; values outside 0..=100 are clamped.
    pub fn set_soc(&mut self, soc: Option<i64>) {
        self.soc = soc.map(|s| s.clamp(0, 100) as u8);
    }

    pub fn bounds(&self, pwr: Pwr) -> (i64, i64) {
        match pwr {
            Pwr::Active => (self.min_p, self.max_p),
            Pwr::Reactive => (self.min_q, self.max_q),
        }
    }

    pub fn next(&self, pwr: Pwr) -> i64 {
        match pwr {
            Pwr::Active => self.next_p,
            Pwr::Reactive => self.next_q,
        }
    }

    pub fn last(&self, pwr: Pwr) -> i64 {
        match pwr {
            Pwr::Active => self.last_p,
            Pwr::Reactive => self.last_q,
        }
    }

    pub fn set_next(&mut self, pwr: Pwr, value: i64) {
        match pwr {
            Pwr::Active => self.next_p = value,
            Pwr::Reactive => self.next_q = value,
        }
    }

    /// Commits this cycle's setpoint as the baseline for the next cycle.
    pub fn apply_power(&mut self) {
        self.last_p = self.next_p;
        self.last_q = self.next_q;
    }
}

/// Intersects device and caller ranges. Disjoint ranges collapse onto the
/// device bound closest to the caller range instead of failing.
fn reconcile(device_min: i64, device_max: i64, global_min: i64, global_max: i64) -> (i64, i64) {
    let device_max = device_max.max(device_min);
    let min = device_min.max(global_min);
    let max = device_max.min(global_max);
    if min <= max {
        return (min, max);
    }
    let point = if global_min > device_max {
        device_max
    } else {
        device_min
    };
    (point, point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_phase_bounds() {
        let mut inv = Inverter::new(InverterId::three_phase("ess0"), 1);
        inv.update_min_max(&EssLimits::new(10_000, -8_000, 6_000), i64::MIN, i64::MAX);
        assert_eq!((inv.min_p, inv.max_p), (-8_000, 6_000));
        assert_eq!((inv.min_q, inv.max_q), (-10_000, 10_000));

        inv.update_min_max(&EssLimits::new(5_000, -8_000, 6_000), -2_000, i64::MAX);
        assert_eq!((inv.min_p, inv.max_p), (-2_000, 5_000));
    }

    #[test]
    fn test_single_phase_bounds_are_a_third() {
        let mut inv = Inverter::new(InverterId::single_phase("ess0", Phase::L2), 1);
        inv.update_min_max(&EssLimits::new(10_000, -9_000, 6_000), i64::MIN, i64::MAX);
        assert_eq!((inv.min_p, inv.max_p), (-3_000, 2_000));
        assert_eq!((inv.min_q, inv.max_q), (-3_333, 3_333));

        inv.update_min_max(&EssLimits::new(10_000, -9_000, 6_000), -1_000, 1_500);
        assert_eq!((inv.min_p, inv.max_p), (-1_000, 1_500));
    }

    #[test]
    fn test_disjoint_global_bounds_are_reconciled() {
        let mut inv = Inverter::new(InverterId::three_phase("ess0"), 1);
        inv.update_min_max(&EssLimits::new(10_000, -4_000, 3_000), 5_000, 7_000);
        assert_eq!((inv.min_p, inv.max_p), (3_000, 3_000));

        inv.update_min_max(&EssLimits::new(10_000, -4_000, 3_000), -9_000, -6_000);
        assert_eq!((inv.min_p, inv.max_p), (-4_000, -4_000));
        assert!(inv.min_p <= inv.max_p);
    }

    #[test]
    fn test_undefined_limits_pin_to_zero() {
        let mut inv = Inverter::new(InverterId::three_phase("ess0"), 1);
        inv.update_min_max(&EssLimits::default(), i64::MIN, i64::MAX);
        assert_eq!((inv.min_p, inv.max_p), (0, 0));
    }

    #[test]
    fn test_for_ess() {
        let sym = Ess::new("ess0", EssKind::Symmetric);
        let asym = Ess::new("ess1", EssKind::Asymmetric);
        assert_eq!(Inverter::for_ess(&sym, PhaseMode::Asymmetric, 1).len(), 1);
        assert_eq!(Inverter::for_ess(&asym, PhaseMode::Symmetric, 1).len(), 1);
        let legs = Inverter::for_ess(&asym, PhaseMode::Asymmetric, 2);
        assert_eq!(legs.len(), 3);
        assert_eq!(legs[0].id.to_string(), "ess1/L1");
        assert!(legs.iter().all(|l| l.weight == 2));
    }

    #[test]
    fn test_set_soc_clamps() {
        let mut inv = Inverter::new(InverterId::three_phase("ess0"), 1);
        inv.set_soc(Some(130));
        assert_eq!(inv.soc, Some(100));
        inv.set_soc(Some(-4));
        assert_eq!(inv.soc, Some(0));
        inv.set_soc(None);
        assert_eq!(inv.soc, None);
    }

    #[test]
    fn test_apply_power() {
        let mut inv = Inverter::with_bounds(InverterId::three_phase("ess0"), 1, -5000, 5000);
        inv.set_next(Pwr::Active, 1200);
        inv.set_next(Pwr::Reactive, -300);
        inv.apply_power();
        assert_eq!(inv.last(Pwr::Active), 1200);
        assert_eq!(inv.last(Pwr::Reactive), -300);
    }
}
