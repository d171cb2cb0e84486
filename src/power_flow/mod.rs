//! Power dispatch: the constraint collection, integer distribution and the
//! solver that turns both into per-inverter setpoints.

pub mod constraints;
pub mod distribution;
pub mod model;

pub use constraints::{Constraint, ConstraintCollection, ConstraintId, ConstraintScope, Relationship, Target};
pub use distribution::{distribute, Distribution, DistributionBias, Interval, Member};
pub use model::{PowerSolver, SolveReport, SolverConfig, SolverEvent};
