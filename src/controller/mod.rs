//! # Cycle engine
//!
//! One [`CycleEngine`] drives every ESS of the site. Each cycle runs the
//! phases of [`CyclePhase`] in order:
//!
//! 1. **Capture**: all drivers are read in parallel under the I/O timeout,
//!    then the process image swaps.
//! 2. **Control**: cycle constraints are dropped, inverter bounds refreshed
//!    and every strategy runs once.
//! 3. **Solve**: active and reactive power are dispatched independently.
//! 4. **Write**: setpoints go to the image and to the drivers; a telemetry
//!    record is queued.
//!
//! Nothing in here returns an error to the caller. Device faults, strategy
//! errors and unsatisfiable constraints are logged, counted in
//! [`CycleDiagnostics`] and the engine carries on.

pub mod cycle;
pub mod pid;
pub mod scheduler;

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::channel::{ChannelAddress, ProcessImage, Snapshot, Value};
use crate::config::EngineConfig;
use crate::domain::{Ess, EssChannel, Inverter, PhaseMode, Pwr};
use crate::hardware::{call_with_timeout, DeviceDriver, DriverOutcome};
use crate::power_flow::{ConstraintCollection, PowerSolver, SolverEvent};
use crate::repo::{TelemetryHandle, TimeseriesRecord};
use crate::strategy::{ControlContext, ControlStrategy};

pub use cycle::{Cycle, CycleChannel, CycleDiagnostics, CyclePhase, CYCLE_COMPONENT};
pub use pid::PidFilter;
pub use scheduler::{pace, Pacing};

struct EssUnit {
    ess: Ess,
    mode: PhaseMode,
    driver: Arc<dyn DeviceDriver>,
}

pub struct CycleEngine {
    config: EngineConfig,
    image: Arc<ProcessImage>,
    units: Vec<EssUnit>,
    inverters: Vec<Inverter>,
    strategies: Vec<Box<dyn ControlStrategy>>,
    constraints: ConstraintCollection,
    solver: PowerSolver,
    diagnostics: Arc<Mutex<CycleDiagnostics>>,
    telemetry: Option<TelemetryHandle>,
    config_rx: Option<watch::Receiver<EngineConfig>>,
    /// Solver events reported last cycle; repeats are logged at debug level
    reported: HashSet<String>,
    phase: CyclePhase,
    cycle_number: u64,
}

impl CycleEngine {
    pub fn new(config: EngineConfig, image: Arc<ProcessImage>) -> Self {
        image.set_stale_after_cycles(config.stale_after_cycles);
        for channel in CycleChannel::iter() {
            image.register(channel.address(), channel.doc());
        }
        Self {
            solver: PowerSolver::new(config.solver()),
            config,
            image,
            units: Vec::new(),
            inverters: Vec::new(),
            strategies: Vec::new(),
            constraints: ConstraintCollection::new(),
            diagnostics: Arc::new(Mutex::new(CycleDiagnostics::default())),
            telemetry: None,
            config_rx: None,
            reported: HashSet::new(),
            phase: CyclePhase::Capture,
            cycle_number: 0,
        }
    }

    /// Registers an ESS, its channels and its inverters. Replaces an ESS
    /// with the same id.
    pub fn add_ess(&mut self, ess: Ess, mode: PhaseMode, driver: Arc<dyn DeviceDriver>) {
        if driver.id() != ess.id {
            warn!(ess = %ess.id, driver = driver.id(), "driver id differs from ess id");
        }
        self.remove_ess(&ess.id);

        let weight = self.config.weight(&ess.id).unwrap_or(1);
        ess.register_channels(&self.image);
        self.inverters.extend(Inverter::for_ess(&ess, mode, weight));
        info!(ess = %ess.id, kind = ?ess.kind, mode = ?mode, weight, "ess added");
        self.units.push(EssUnit { ess, mode, driver });
    }

    /// Drops an ESS together with its inverters and channels. Constraints
    /// naming it stay registered and are reported as unknown targets.
    pub fn remove_ess(&mut self, ess_id: &str) -> bool {
        let before = self.units.len();
        self.units.retain(|unit| unit.ess.id != ess_id);
        if self.units.len() == before {
            return false;
        }
        self.inverters.retain(|inverter| inverter.ess_id() != ess_id);
        let channels = self.image.unregister_component(ess_id);
        info!(ess = ess_id, channels, "ess removed");
        true
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn ControlStrategy>) {
        debug!(strategy = strategy.id(), "strategy added");
        self.strategies.push(strategy);
    }

    pub fn with_telemetry(mut self, handle: TelemetryHandle) -> Self {
        self.telemetry = Some(handle);
        self
    }

    /// Returns a sender through which a running engine picks up new
    /// configuration between cycles.
    pub fn config_channel(&mut self) -> watch::Sender<EngineConfig> {
        let (tx, rx) = watch::channel(self.config.clone());
        self.config_rx = Some(rx);
        tx
    }

    /// Applies a new engine configuration. Invalid configurations are
    /// rejected and the current one stays in effect.
    pub fn reconfigure(&mut self, mut config: EngineConfig) -> bool {
        if let Err(e) = config.validate() {
            warn!(error = %e, "rejected engine reconfiguration");
            return false;
        }
        for (ess, weight) in &self.config.weights {
            config.weights.entry(ess.clone()).or_insert(*weight);
        }
        for inverter in &mut self.inverters {
            if let Some(weight) = config.weight(inverter.ess_id()) {
                inverter.weight = weight;
            }
        }
        self.solver.set_config(config.solver());
        self.image.set_stale_after_cycles(config.stale_after_cycles);
        info!(
            cycle_period_ms = config.cycle_period_ms,
            io_timeout_ms = config.io_timeout_ms,
            "engine reconfigured"
        );
        self.config = config;
        true
    }

    pub(crate) fn pending_config(&mut self) -> Option<EngineConfig> {
        let rx = self.config_rx.as_mut()?;
        match rx.has_changed() {
            Ok(true) => Some(rx.borrow_and_update().clone()),
            _ => None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn image(&self) -> &Arc<ProcessImage> {
        &self.image
    }

    pub fn inverters(&self) -> &[Inverter] {
        &self.inverters
    }

    pub fn constraints(&self) -> &ConstraintCollection {
        &self.constraints
    }

    pub fn constraints_mut(&mut self) -> &mut ConstraintCollection {
        &mut self.constraints
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn cycle_number(&self) -> u64 {
        self.cycle_number
    }

    pub fn diagnostics(&self) -> CycleDiagnostics {
        self.diagnostics.lock().clone()
    }

    /// Shared handle for observers outside the control task.
    pub fn diagnostics_handle(&self) -> Arc<Mutex<CycleDiagnostics>> {
        self.diagnostics.clone()
    }

    pub(crate) fn record_overrun(&self) -> u64 {
        let mut diagnostics = self.diagnostics.lock();
        diagnostics.overruns += 1;
        diagnostics.overruns
    }

    /// Runs one complete cycle.
    pub async fn run_cycle(&mut self) -> Cycle {
        self.cycle_number += 1;
        let mut cycle = Cycle::start(self.cycle_number, self.config.cycle_period());
        let started = Instant::now();

        let snapshot = self.capture().await;
        self.control(&snapshot);
        self.solve();
        self.write(&snapshot).await;

        cycle.finish();
        self.phase = self.phase.next();
        let elapsed = started.elapsed();
        {
            let mut diagnostics = self.diagnostics.lock();
            diagnostics.cycles += 1;
            diagnostics.last_cycle_duration = elapsed;
            diagnostics.last_cycle_started = Some(cycle.started_at);
        }
        debug!(cycle = cycle.number, duration_ms = elapsed.as_millis() as u64, "cycle finished");
        cycle
    }

    async fn capture(&mut self) -> Arc<Snapshot> {
        self.phase = CyclePhase::Capture;
        let timeout = self.config.io_timeout();

        let reads = join_all(self.units.iter().map(|unit| {
            let driver = unit.driver.clone();
            async move { call_with_timeout(timeout, driver.read()).await }
        }))
        .await;

        let mut failures = 0;
        for (unit, outcome) in self.units.iter().zip(reads) {
            match outcome {
                DriverOutcome::Ok(values) => {
                    for (channel, value) in values {
                        let address = ChannelAddress::new(unit.ess.id.clone(), channel);
                        if let Err(e) = self.image.set_next(&address, value) {
                            debug!(channel = %address, error = %e, "driver value dropped");
                        }
                    }
                }
                DriverOutcome::TimedOut => {
                    failures += 1;
                    warn!(ess = %unit.ess.id, timeout_ms = timeout.as_millis() as u64, "device read timed out");
                    self.invalidate_reads(unit);
                }
                DriverOutcome::DeviceError(e) => {
                    failures += 1;
                    error!(ess = %unit.ess.id, error = %e, "device read failed");
                    self.invalidate_reads(unit);
                }
            }
        }

        let (overruns, last_ms) = {
            let diagnostics = self.diagnostics.lock();
            (diagnostics.overruns, diagnostics.last_cycle_duration.as_millis() as i64)
        };
        for (channel, value) in [
            (CycleChannel::Cycle, self.cycle_number as i64),
            (CycleChannel::Overruns, overruns as i64),
            (CycleChannel::MeasuredCycleTime, last_ms),
        ] {
            if let Err(e) = self.image.set_next(&channel.address(), Value::from(value)) {
                debug!(channel = %channel, error = %e, "cycle channel not updated");
            }
        }

        let report = self.image.swap(self.cycle_number);
        for address in &report.newly_stale {
            warn!(channel = %address, cycle = self.cycle_number, "channel stale");
        }
        for address in &report.recovered {
            info!(channel = %address, cycle = self.cycle_number, "channel recovered");
        }

        let mut diagnostics = self.diagnostics.lock();
        diagnostics.read_failures += failures;
        diagnostics.stale_channels = report.stale_total;
        drop(diagnostics);

        self.image.snapshot()
    }

    fn invalidate_reads(&self, unit: &EssUnit) {
        for channel in unit.driver.channels() {
            let address = ChannelAddress::new(unit.ess.id.clone(), channel);
            if let Err(e) = self.image.invalidate_next(&address) {
                debug!(channel = %address, error = %e, "cannot invalidate channel");
            }
        }
    }

    fn control(&mut self, snapshot: &Arc<Snapshot>) {
        self.phase = CyclePhase::Control;
        let expired = self.constraints.clear_cycle_constraints();
        debug!(cycle = self.cycle_number, expired, "cycle constraints cleared");

        for inverter in &mut self.inverters {
            let unit = self.units.iter().find(|unit| unit.ess.id == inverter.ess_id());
            let limits = unit.map(|unit| unit.ess.limits(snapshot)).unwrap_or_default();
            inverter.update_min_max(&limits, self.config.global_min_p, self.config.global_max_p);
            inverter.set_soc(unit.and_then(|unit| unit.ess.soc(snapshot)));
        }

        let mut failures = 0;
        for strategy in self.strategies.iter_mut() {
            let source = strategy.id().to_string();
            let mut ctx = ControlContext::new(
                source.clone(),
                self.cycle_number,
                snapshot.clone(),
                &self.image,
                &self.inverters,
                &mut self.constraints,
                &self.solver,
            );
            if let Err(e) = strategy.run(&mut ctx) {
                failures += 1;
                warn!(strategy = %source, cycle = self.cycle_number, error = %e, "strategy failed");
            }
        }
        self.diagnostics.lock().strategy_failures += failures;
    }

    fn solve(&mut self) {
        self.phase = CyclePhase::Solve;
        let report = self.solver.solve_all(&mut self.inverters, &self.constraints);

        let mut reported = HashSet::with_capacity(report.events.len());
        for event in &report.events {
            let key = event_key(event);
            let repeated = self.reported.contains(&key);
            log_event(event, repeated);
            reported.insert(key);
        }
        self.reported = reported;

        let mut diagnostics = self.diagnostics.lock();
        diagnostics.unmet_constraints += report.unmet() as u64;
        diagnostics.infeasible_constraints += report.infeasible() as u64;
    }

    async fn write(&mut self, snapshot: &Snapshot) {
        self.phase = CyclePhase::Write;
        let timeout = self.config.io_timeout();

        let mut batches: Vec<(&EssUnit, Vec<(String, Value)>)> = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            for pwr in Pwr::iter() {
                let mut total = 0i64;
                for inverter in self.inverters.iter().filter(|i| i.ess_id() == unit.ess.id) {
                    let value = inverter.next(pwr);
                    total = total.saturating_add(value);
                    let address = unit.ess.address(EssChannel::setpoint(pwr, inverter.id.kind.phase()));
                    if let Err(e) = self.image.write(&address, Value::from(value)) {
                        warn!(channel = %address, error = %e, "setpoint rejected");
                    }
                }
                let debug_address = unit.ess.address(EssChannel::debug_setpoint(pwr));
                if let Err(e) = self.image.set_next(&debug_address, Value::from(total)) {
                    debug!(channel = %debug_address, error = %e, "debug setpoint not updated");
                }
            }
            batches.push((unit, self.pending_writes(&unit.ess.id)));
        }

        let results = join_all(
            batches
                .iter()
                .map(|(unit, values)| call_with_timeout(timeout, unit.driver.write(values))),
        )
        .await;

        let mut failures = 0;
        for ((unit, values), outcome) in batches.iter().zip(results) {
            match outcome {
                DriverOutcome::Ok(()) => {
                    debug!(ess = %unit.ess.id, mode = ?unit.mode, channels = values.len(), "setpoints written")
                }
                DriverOutcome::TimedOut => {
                    failures += 1;
                    warn!(ess = %unit.ess.id, timeout_ms = timeout.as_millis() as u64, "device write timed out");
                }
                DriverOutcome::DeviceError(e) => {
                    failures += 1;
                    error!(ess = %unit.ess.id, error = %e, "device write failed");
                }
            }
        }

        for inverter in &mut self.inverters {
            inverter.apply_power();
        }

        let mut dropped = 0;
        // The record carries the captured snapshot, so this cycle's
        // setpoints only appear in the next cycle's record.
        if let Some(telemetry) = &self.telemetry {
            if !telemetry.try_push(TimeseriesRecord::from_snapshot(snapshot, self.cycle_number)) {
                dropped += 1;
            }
        }

        let mut diagnostics = self.diagnostics.lock();
        diagnostics.write_failures += failures;
        diagnostics.telemetry_dropped += dropped;
    }

    /// Read-write channels of a component that hold a value for the next cycle.
    fn pending_writes(&self, component_id: &str) -> Vec<(String, Value)> {
        let mut values: Vec<(String, Value)> = self
            .image
            .addresses(component_id)
            .into_iter()
            .filter(|address| self.image.doc(address).map(|doc| doc.is_writable()).unwrap_or(false))
            .filter_map(|address| {
                self.image
                    .pending(&address)
                    .map(|value| (address.channel_id, value))
            })
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }
}

fn event_key(event: &SolverEvent) -> String {
    match event {
        SolverEvent::Unmet { source, pwr, target, .. } => format!("unmet:{source}:{pwr}:{target}"),
        SolverEvent::Infeasible { source, description, .. } => format!("infeasible:{source}:{description}"),
        SolverEvent::UnknownTarget { source, target, .. } => format!("unknown:{source}:{target}"),
        SolverEvent::IterationLimit { pwr, .. } => format!("iterations:{pwr}"),
    }
}

fn log_event(event: &SolverEvent, repeated: bool) {
    if repeated {
        debug!(event = ?event, "solver event repeated");
        return;
    }
    match event {
        SolverEvent::Unmet {
            constraint,
            source,
            pwr,
            target,
            requested,
            achieved,
            remainder,
        } => warn!(
            %constraint,
            source = %source,
            %pwr,
            %target,
            requested,
            achieved,
            remainder,
            "constraint unmet"
        ),
        SolverEvent::Infeasible {
            constraint,
            source,
            description,
            ..
        } => warn!(%constraint, source = %source, constraint_text = %description, "constraint infeasible, ignored"),
        SolverEvent::UnknownTarget {
            constraint,
            source,
            target,
        } => warn!(%constraint, source = %source, %target, "constraint targets unknown component"),
        SolverEvent::IterationLimit { pwr, unmet } => {
            warn!(%pwr, unmet, "distribution stopped at iteration limit")
        }
    }
}
