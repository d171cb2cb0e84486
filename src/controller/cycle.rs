use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter};

use crate::channel::{ChannelAddress, ChannelDoc, Unit};

/// Component id under which the engine publishes its own channels
pub const CYCLE_COMPONENT: &str = "_cycle";

/// Phases of one control cycle, executed strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIter)]
pub enum CyclePhase {
    /// Drivers read; the process image swaps at the end
    Capture,
    /// Strategies register constraints
    Control,
    /// Solver runs once per power type
    Solve,
    /// Setpoints go to channels and drivers
    Write,
}

impl CyclePhase {
    pub fn next(self) -> CyclePhase {
        match self {
            CyclePhase::Capture => CyclePhase::Control,
            CyclePhase::Control => CyclePhase::Solve,
            CyclePhase::Solve => CyclePhase::Write,
            CyclePhase::Write => CyclePhase::Capture,
        }
    }
}

/// Engine diagnostics exposed through the process image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
pub enum CycleChannel {
    Cycle,
    Overruns,
    /// Duration of the previous cycle in ms
    MeasuredCycleTime,
}

impl CycleChannel {
    pub fn address(self) -> ChannelAddress {
        ChannelAddress::new(CYCLE_COMPONENT, self.as_ref())
    }

    pub fn doc(self) -> ChannelDoc {
        match self {
            CycleChannel::MeasuredCycleTime => ChannelDoc::long().unit(Unit::Millisecond),
            _ => ChannelDoc::long(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cycle {
    pub number: u64,
    pub period: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Cycle {
    pub fn start(number: u64, period: Duration) -> Self {
        Self {
            number,
            period,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

/// Counters accumulated over the engine's lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleDiagnostics {
    pub cycles: u64,
    pub overruns: u64,
    pub infeasible_constraints: u64,
    pub unmet_constraints: u64,
    /// Channels flagged stale after the last swap
    pub stale_channels: usize,
    pub read_failures: u64,
    pub write_failures: u64,
    pub strategy_failures: u64,
    pub telemetry_dropped: u64,
    pub last_cycle_duration: Duration,
    pub last_cycle_started: Option<DateTime<Utc>>,
}
