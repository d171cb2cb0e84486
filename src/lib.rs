//! Per-cycle power dispatch for energy storage systems.
//!
//! A [`controller::CycleEngine`] reads devices into a double-buffered
//! [`channel::ProcessImage`], lets [`strategy`] implementations register
//! constraints, distributes power across inverters with the
//! [`power_flow::PowerSolver`] and writes the resulting setpoints back.

pub mod channel;
pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod power_flow;
pub mod repo;
pub mod strategy;
pub mod telemetry;
