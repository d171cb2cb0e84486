use anyhow::Result;
use tracing::debug;

use super::{ControlContext, ControlStrategy};
use crate::controller::pid::PidFilter;
use crate::domain::{EssChannel, Pwr};
use crate::power_flow::{Relationship, Target};

/// Requests a fixed active power every cycle, optionally approached through
/// a PID filter.
#[derive(Debug, Clone)]
pub struct FixActivePower {
    id: String,
    target: Target,
    relationship: Relationship,
    power: i64,
    pid: Option<PidFilter>,
}

impl FixActivePower {
    pub fn new(id: impl Into<String>, target: Target, relationship: Relationship, power: i64) -> Self {
        Self {
            id: id.into(),
            target,
            relationship,
            power,
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: PidFilter) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn set_power(&mut self, power: i64) {
        self.power = power;
    }

    /// Measured active power of the target; None while any ESS is undefined.
    fn measured(&self, ctx: &ControlContext<'_>) -> Option<i64> {
        ctx.ess_ids(&self.target)
            .into_iter()
            .map(|ess| ctx.snapshot().get_i64(ess, EssChannel::ActivePower.as_ref()))
            .sum()
    }
}

impl ControlStrategy for FixActivePower {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, ctx: &mut ControlContext<'_>) -> Result<()> {
        let mut value = self.power;

        if self.pid.is_some() {
            let extrema = ctx.extrema(Pwr::Active, &self.target);
            let measured = self.measured(ctx);
            if let (Some(pid), Some(measured)) = (self.pid.as_mut(), measured) {
                pid.set_limits(extrema.map(|(lo, _)| lo), extrema.map(|(_, hi)| hi));
                value = pid.apply(measured, self.power);
            }
        }

        debug!(strategy = %self.id, target = %self.target, value, "fix active power");
        ctx.add_constraint(self.target.clone(), Pwr::Active, self.relationship, value);
        Ok(())
    }
}
