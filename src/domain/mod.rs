pub mod ess;
pub mod inverter;
pub mod types;

pub use ess::*;
pub use inverter::*;
pub use types::*;
