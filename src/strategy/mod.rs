//! # Control strategies
//!
//! Strategies run once per cycle during CONTROL, in configured order. They
//! read the captured snapshot and express what they want as constraints;
//! the solver decides the setpoints.

pub mod fix_active_power;
pub mod limit_active_power;

use anyhow::Result;
use std::sync::Arc;

use crate::channel::{ChannelAddress, ChannelError, ProcessImage, Snapshot, Value};
use crate::config::StrategyConfig;
use crate::controller::pid::PidFilter;
use crate::domain::{Inverter, Pwr};
use crate::power_flow::{
    Constraint, ConstraintCollection, ConstraintId, ConstraintScope, PowerSolver, Relationship, Target,
};

pub use fix_active_power::FixActivePower;
pub use limit_active_power::LimitActivePower;

pub trait ControlStrategy: Send {
    fn id(&self) -> &str;

    fn run(&mut self, ctx: &mut ControlContext<'_>) -> Result<()>;
}

/// What a strategy can see and do during its turn.
pub struct ControlContext<'a> {
    source: String,
    cycle: u64,
    snapshot: Arc<Snapshot>,
    image: &'a ProcessImage,
    inverters: &'a [Inverter],
    constraints: &'a mut ConstraintCollection,
    solver: &'a PowerSolver,
}

impl<'a> ControlContext<'a> {
    pub fn new(
        source: impl Into<String>,
        cycle: u64,
        snapshot: Arc<Snapshot>,
        image: &'a ProcessImage,
        inverters: &'a [Inverter],
        constraints: &'a mut ConstraintCollection,
        solver: &'a PowerSolver,
    ) -> Self {
        Self {
            source: source.into(),
            cycle,
            snapshot,
            image,
            inverters,
            constraints,
            solver,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Inverters with this cycle's bounds and last applied setpoints.
    pub fn inverters(&self) -> &[Inverter] {
        self.inverters
    }

    /// ESS ids covered by a target, in inverter order.
    pub fn ess_ids(&self, target: &Target) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for inverter in self.inverters {
            let covered = match target {
                Target::All => true,
                Target::Ess(id) => inverter.ess_id() == id,
                Target::Inverter(id) => &inverter.id == id,
            };
            if covered && !ids.contains(&inverter.ess_id()) {
                ids.push(inverter.ess_id());
            }
        }
        ids
    }

    /// Adds a constraint that expires at the end of this cycle.
    pub fn add_constraint(&mut self, target: Target, pwr: Pwr, relationship: Relationship, value: i64) -> ConstraintId {
        self.constraints
            .add(self.source.clone(), target, pwr, relationship, value, ConstraintScope::Cycle)
    }

    /// Adds a constraint that stays until this strategy removes it.
    pub fn add_static_constraint(&mut self, target: Target, pwr: Pwr, relationship: Relationship, value: i64) -> ConstraintId {
        self.constraints
            .add(self.source.clone(), target, pwr, relationship, value, ConstraintScope::Static)
    }

    /// Updates one of this strategy's constraints. Returns false if the id is
    /// unknown or belongs to another source.
    pub fn set_static_value(&mut self, id: ConstraintId, value: i64) -> bool {
        if !self.owns(id) {
            return false;
        }
        self.constraints.set_value(id, value)
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) -> bool {
        self.owns(id) && self.constraints.remove(id).is_some()
    }

    fn owns(&self, id: ConstraintId) -> bool {
        self.constraints.get(id).map(|c| c.source == self.source).unwrap_or(false)
    }

    /// Writes a read-write channel; the value becomes current at the next swap.
    pub fn write_channel(&self, address: &ChannelAddress, value: Value) -> Result<Value, ChannelError> {
        self.image.write(address, value)
    }

    /// Range the target can still take given the constraints registered so far.
    pub fn extrema(&self, pwr: Pwr, target: &Target) -> Option<(i64, i64)> {
        self.solver.extrema(self.inverters, &*self.constraints, pwr, target)
    }

    /// Whether the constraint would be accepted if added now.
    pub fn is_feasible(&self, target: Target, pwr: Pwr, relationship: Relationship, value: i64) -> bool {
        let candidate = Constraint::candidate(self.source.clone(), target, pwr, relationship, value);
        self.solver.is_feasible(self.inverters, &*self.constraints, &candidate)
    }
}

fn target_for(ess: &Option<String>) -> Target {
    match ess {
        Some(id) => Target::Ess(id.clone()),
        None => Target::All,
    }
}

/// Builds the configured strategies in execution order.
pub fn from_config(configs: &[StrategyConfig]) -> Vec<Box<dyn ControlStrategy>> {
    configs
        .iter()
        .map(|config| -> Box<dyn ControlStrategy> {
            match config {
                StrategyConfig::FixActivePower {
                    id,
                    ess,
                    relationship,
                    power,
                    pid,
                } => {
                    let strategy = FixActivePower::new(id.clone(), target_for(ess), *relationship, *power);
                    match pid {
                        Some(pid) => Box::new(strategy.with_pid(PidFilter::new(pid.p, pid.i, pid.d))),
                        None => Box::new(strategy),
                    }
                }
                StrategyConfig::LimitActivePower {
                    id,
                    ess,
                    max_charge_power,
                    max_discharge_power,
                } => Box::new(LimitActivePower::new(
                    id.clone(),
                    target_for(ess),
                    *max_charge_power,
                    *max_discharge_power,
                )),
            }
        })
        .collect()
}
