use anyhow::Result;

use super::{ControlContext, ControlStrategy};
use crate::domain::Pwr;
use crate::power_flow::{ConstraintId, Relationship, Target};

/// Keeps charge and discharge power of a target within fixed limits.
///
/// The limits are registered once as static constraints and kept current
/// with `set_static_value`, so they keep their precedence position.
#[derive(Debug, Clone)]
pub struct LimitActivePower {
    id: String,
    target: Target,
    max_charge_power: Option<i64>,
    max_discharge_power: Option<i64>,
    charge_constraint: Option<ConstraintId>,
    discharge_constraint: Option<ConstraintId>,
}

impl LimitActivePower {
    pub fn new(
        id: impl Into<String>,
        target: Target,
        max_charge_power: Option<i64>,
        max_discharge_power: Option<i64>,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            max_charge_power: max_charge_power.map(i64::abs),
            max_discharge_power: max_discharge_power.map(i64::abs),
            charge_constraint: None,
            discharge_constraint: None,
        }
    }

    pub fn set_limits(&mut self, max_charge_power: Option<i64>, max_discharge_power: Option<i64>) {
        self.max_charge_power = max_charge_power.map(i64::abs);
        self.max_discharge_power = max_discharge_power.map(i64::abs);
    }

    fn sync(
        ctx: &mut ControlContext<'_>,
        slot: &mut Option<ConstraintId>,
        target: &Target,
        relationship: Relationship,
        value: Option<i64>,
    ) {
        match (value, *slot) {
            (Some(value), Some(id)) => {
                if !ctx.set_static_value(id, value) {
                    *slot = Some(ctx.add_static_constraint(target.clone(), Pwr::Active, relationship, value));
                }
            }
            (Some(value), None) => {
                *slot = Some(ctx.add_static_constraint(target.clone(), Pwr::Active, relationship, value));
            }
            (None, Some(id)) => {
                ctx.remove_constraint(id);
                *slot = None;
            }
            (None, None) => {}
        }
    }
}

impl ControlStrategy for LimitActivePower {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, ctx: &mut ControlContext<'_>) -> Result<()> {
        let charge = self.max_charge_power.map(|p| -p);
        Self::sync(
            ctx,
            &mut self.charge_constraint,
            &self.target,
            Relationship::GreaterOrEquals,
            charge,
        );
        Self::sync(
            ctx,
            &mut self.discharge_constraint,
            &self.target,
            Relationship::LessOrEquals,
            self.max_discharge_power,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ProcessImage;
    use crate::domain::{Inverter, InverterId};
    use crate::power_flow::{ConstraintCollection, ConstraintScope, PowerSolver};

    fn run_once(strategy: &mut LimitActivePower, constraints: &mut ConstraintCollection, cycle: u64) {
        let image = ProcessImage::default();
        let inverters = vec![Inverter::with_bounds(InverterId::three_phase("ess0"), 1, -5000, 5000)];
        let solver = PowerSolver::default();
        let mut ctx = ControlContext::new("limit", cycle, image.snapshot(), &image, &inverters, constraints, &solver);
        strategy.run(&mut ctx).unwrap();
    }

    #[test]
    fn test_registers_statics_once() {
        let mut strategy = LimitActivePower::new("limit", Target::All, Some(3000), Some(2000));
        let mut constraints = ConstraintCollection::new();
        run_once(&mut strategy, &mut constraints, 1);
        constraints.clear_cycle_constraints();
        run_once(&mut strategy, &mut constraints, 2);

        let statics = constraints.statics();
        assert_eq!(statics.len(), 2);
        assert!(statics.iter().all(|c| c.scope == ConstraintScope::Static));
        assert_eq!(statics[0].relationship, Relationship::GreaterOrEquals);
        assert_eq!(statics[0].value, -3000);
        assert_eq!(statics[1].value, 2000);
    }

    #[test]
    fn test_updates_and_removes() {
        let mut strategy = LimitActivePower::new("limit", Target::All, Some(3000), Some(2000));
        let mut constraints = ConstraintCollection::new();
        run_once(&mut strategy, &mut constraints, 1);

        strategy.set_limits(Some(1000), None);
        run_once(&mut strategy, &mut constraints, 2);
        assert_eq!(constraints.statics().len(), 1);
        assert_eq!(constraints.statics()[0].value, -1000);
    }

    #[test]
    fn test_reregisters_after_external_removal() {
        let mut strategy = LimitActivePower::new("limit", Target::All, None, Some(2000));
        let mut constraints = ConstraintCollection::new();
        run_once(&mut strategy, &mut constraints, 1);
        constraints.remove_by_source("limit");
        run_once(&mut strategy, &mut constraints, 2);
        assert_eq!(constraints.statics().len(), 1);
    }
}
