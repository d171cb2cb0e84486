use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use open_energy_dispatch::channel::{ChannelAddress, ProcessImage, Value};
use open_energy_dispatch::config::EngineConfig;
use open_energy_dispatch::controller::{CycleChannel, CycleEngine, CYCLE_COMPONENT};
use open_energy_dispatch::domain::{Ess, EssChannel, EssKind, PhaseMode, Pwr};
use open_energy_dispatch::hardware::{DeviceDriver, DriverError};
use open_energy_dispatch::power_flow::{DistributionBias, Relationship, Target};
use open_energy_dispatch::repo::{ForwarderConfig, InMemoryTimeseries, TimeseriesForwarder};
use open_energy_dispatch::strategy::{ControlContext, ControlStrategy};

#[derive(Default)]
struct FakeState {
    values: Vec<(String, Value)>,
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
    fail_reads: bool,
    fail_writes: bool,
    writes: Vec<Vec<(String, Value)>>,
}

struct FakeEss {
    id: String,
    state: Mutex<FakeState>,
}

impl FakeEss {
    fn new(id: &str, max_power: i32) -> Arc<Self> {
        let values = [
            (EssChannel::Soc, 50),
            (EssChannel::ActivePower, 0),
            (EssChannel::ReactivePower, 0),
            (EssChannel::MaxApparentPower, max_power),
            (EssChannel::AllowedChargePower, -max_power),
            (EssChannel::AllowedDischargePower, max_power),
        ]
        .into_iter()
        .map(|(channel, v)| (channel.as_ref().to_string(), Value::Integer(v)))
        .collect();
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(FakeState {
                values,
                ..Default::default()
            }),
        })
    }

    fn last_write(&self, channel: EssChannel) -> Option<i64> {
        self.state
            .lock()
            .writes
            .last()
            .and_then(|w| w.iter().find(|(c, _)| c == channel.as_ref()))
            .map(|(_, v)| v.as_i64())
    }

    fn set(&self, channel: EssChannel, value: i32) {
        let mut state = self.state.lock();
        if let Some(slot) = state.values.iter_mut().find(|(c, _)| c == channel.as_ref()) {
            slot.1 = Value::Integer(value);
        }
    }

    fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }
}

#[async_trait]
impl DeviceDriver for FakeEss {
    fn id(&self) -> &str {
        &self.id
    }

    fn channels(&self) -> Vec<String> {
        self.state.lock().values.iter().map(|(c, _)| c.clone()).collect()
    }

    async fn read(&self) -> Result<Vec<(String, Value)>, DriverError> {
        let delay = self.state.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        if state.fail_reads {
            return Err(DriverError::Communication("no response".into()));
        }
        Ok(state.values.clone())
    }

    async fn write(&self, values: &[(String, Value)]) -> Result<(), DriverError> {
        let delay = self.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(DriverError::Device("setpoint refused".into()));
        }
        state.writes.push(values.to_vec());
        Ok(())
    }
}

struct SetSum {
    id: &'static str,
    target: Target,
    value: i64,
}

impl ControlStrategy for SetSum {
    fn id(&self) -> &str {
        self.id
    }

    fn run(&mut self, ctx: &mut ControlContext<'_>) -> anyhow::Result<()> {
        ctx.add_constraint(self.target.clone(), Pwr::Active, Relationship::Equals, self.value);
        Ok(())
    }
}

/// Re-adds whatever equality constraints the test put in its script.
struct Scripted(Arc<Mutex<Vec<(Target, i64)>>>);

impl ControlStrategy for Scripted {
    fn id(&self) -> &str {
        "scripted"
    }

    fn run(&mut self, ctx: &mut ControlContext<'_>) -> anyhow::Result<()> {
        for (target, value) in self.0.lock().iter() {
            ctx.add_constraint(target.clone(), Pwr::Active, Relationship::Equals, *value);
        }
        Ok(())
    }
}

struct Failing;

impl ControlStrategy for Failing {
    fn id(&self) -> &str {
        "failing"
    }

    fn run(&mut self, _ctx: &mut ControlContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!("forecast unavailable")
    }
}

fn config(period_ms: u64, timeout_ms: u64) -> EngineConfig {
    EngineConfig {
        cycle_period_ms: period_ms,
        io_timeout_ms: timeout_ms,
        ..EngineConfig::default()
    }
}

fn engine_with(config: EngineConfig, devices: &[(&Arc<FakeEss>, EssKind, PhaseMode)]) -> CycleEngine {
    let mut engine = CycleEngine::new(config, Arc::new(ProcessImage::default()));
    for (device, kind, mode) in devices {
        engine.add_ess(Ess::new(device.id.clone(), *kind), *mode, (*device).clone());
    }
    engine
}

#[tokio::test(start_paused = true)]
async fn timed_out_read_holds_device_at_zero() {
    let a = FakeEss::new("essA", 5000);
    let b = FakeEss::new("essB", 3000);
    b.state.lock().read_delay = Some(Duration::from_millis(500));
    let mut engine = engine_with(
        config(1000, 50),
        &[(&a, EssKind::Symmetric, PhaseMode::Symmetric), (&b, EssKind::Symmetric, PhaseMode::Symmetric)],
    );
    engine.add_strategy(Box::new(SetSum {
        id: "site",
        target: Target::All,
        value: 4000,
    }));

    engine.run_cycle().await;

    let snapshot = engine.image().snapshot();
    assert_eq!(snapshot.get("essB", EssChannel::ActivePower.as_ref()), None);
    assert_eq!(snapshot.get_i64("essA", EssChannel::Soc.as_ref()), Some(50));
    assert_eq!(a.last_write(EssChannel::SetActivePowerEquals), Some(4000));
    assert_eq!(b.last_write(EssChannel::SetActivePowerEquals), Some(0));

    let diagnostics = engine.diagnostics();
    assert_eq!(diagnostics.read_failures, 1);
    assert_eq!(diagnostics.cycles, 1);
}

#[tokio::test]
async fn missing_reads_turn_stale_and_recover() {
    let a = FakeEss::new("essA", 5000);
    let mut engine = engine_with(config(1000, 100), &[(&a, EssKind::Symmetric, PhaseMode::Symmetric)]);
    engine.run_cycle().await;

    let full = a.state.lock().values.clone();
    a.state.lock().values.retain(|(c, _)| c != EssChannel::Soc.as_ref());
    let soc = ChannelAddress::new("essA", EssChannel::Soc.as_ref());
    for _ in 0..3 {
        engine.run_cycle().await;
    }
    let snapshot = engine.image().snapshot();
    assert!(snapshot.is_stale(&soc));
    assert_eq!(snapshot.get_addr(&soc), Some(Value::Integer(50)));
    assert_eq!(engine.diagnostics().stale_channels, 1);

    a.state.lock().values = full;
    engine.run_cycle().await;
    assert!(!engine.image().snapshot().is_stale(&soc));
    assert_eq!(engine.diagnostics().stale_channels, 0);
}

#[tokio::test]
async fn write_failure_is_counted_and_others_still_written() {
    let a = FakeEss::new("essA", 5000);
    let b = FakeEss::new("essB", 3000);
    a.state.lock().fail_writes = true;
    let mut engine = engine_with(
        config(1000, 100),
        &[(&a, EssKind::Symmetric, PhaseMode::Symmetric), (&b, EssKind::Symmetric, PhaseMode::Symmetric)],
    );
    engine.add_strategy(Box::new(SetSum {
        id: "site",
        target: Target::All,
        value: 7000,
    }));

    engine.run_cycle().await;
    assert_eq!(a.write_count(), 0);
    assert_eq!(b.last_write(EssChannel::SetActivePowerEquals), Some(3000));
    assert_eq!(engine.diagnostics().write_failures, 1);
    assert_eq!(engine.inverters()[0].last_p, 4000);
}

#[tokio::test]
async fn failing_strategy_does_not_stop_the_cycle() {
    let a = FakeEss::new("essA", 5000);
    let mut engine = engine_with(config(1000, 100), &[(&a, EssKind::Symmetric, PhaseMode::Symmetric)]);
    engine.add_strategy(Box::new(Failing));
    engine.add_strategy(Box::new(SetSum {
        id: "site",
        target: Target::Ess("essA".into()),
        value: -2500,
    }));

    engine.run_cycle().await;
    assert_eq!(engine.diagnostics().strategy_failures, 1);
    assert_eq!(a.last_write(EssChannel::SetActivePowerEquals), Some(-2500));
}

#[tokio::test]
async fn asymmetric_ess_is_written_per_phase() {
    let a = FakeEss::new("essA", 6000);
    let mut engine = engine_with(config(1000, 100), &[(&a, EssKind::Asymmetric, PhaseMode::Asymmetric)]);
    engine.add_strategy(Box::new(SetSum {
        id: "site",
        target: Target::Ess("essA".into()),
        value: 3001,
    }));

    engine.run_cycle().await;
    let legs: Vec<i64> = [
        EssChannel::SetActivePowerL1Equals,
        EssChannel::SetActivePowerL2Equals,
        EssChannel::SetActivePowerL3Equals,
    ]
    .into_iter()
    .filter_map(|c| a.last_write(c))
    .collect();
    assert_eq!(legs.len(), 3);
    assert_eq!(legs.iter().sum::<i64>(), 3001);
    assert_eq!(a.last_write(EssChannel::SetActivePowerEquals), None);

    engine.run_cycle().await;
    let debug = engine
        .image()
        .snapshot()
        .get_i64("essA", EssChannel::DebugSetActivePower.as_ref());
    assert_eq!(debug, Some(3001));
}

#[tokio::test(start_paused = true)]
async fn overruns_are_counted_without_catch_up() {
    let a = FakeEss::new("essA", 5000);
    a.state.lock().read_delay = Some(Duration::from_millis(30));
    a.state.lock().write_delay = Some(Duration::from_millis(30));
    let mut engine = engine_with(config(50, 40), &[(&a, EssKind::Symmetric, PhaseMode::Symmetric)]);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });
    engine.run(shutdown).await;

    let diagnostics = engine.diagnostics();
    assert!(diagnostics.cycles >= 3);
    assert_eq!(diagnostics.overruns, diagnostics.cycles);

    engine.run_cycle().await;
    let overruns = engine
        .image()
        .snapshot()
        .get_i64(CYCLE_COMPONENT, CycleChannel::Overruns.as_ref());
    assert_eq!(overruns, Some(diagnostics.overruns as i64));
}

#[tokio::test]
async fn committed_snapshots_reach_the_sink() {
    let a = FakeEss::new("essA", 5000);
    let sink = Arc::new(InMemoryTimeseries::new());
    let (handle, task) = TimeseriesForwarder::spawn(sink.clone(), ForwarderConfig::default());

    let mut engine =
        engine_with(config(1000, 100), &[(&a, EssKind::Symmetric, PhaseMode::Symmetric)]).with_telemetry(handle);
    engine.run_cycle().await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    engine.run_cycle().await;
    drop(engine);
    task.await.unwrap();

    let latest = sink.latest().unwrap();
    assert_eq!(latest.cycle, 2);
    assert_eq!(latest.values.get("essA/Soc"), Some(&Value::Integer(50)));
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn telemetry_record_shows_setpoints_one_cycle_later() {
    let a = FakeEss::new("essA", 5000);
    let sink = Arc::new(InMemoryTimeseries::new());
    let (handle, task) = TimeseriesForwarder::spawn(sink.clone(), ForwarderConfig::default());

    let mut engine =
        engine_with(config(1000, 100), &[(&a, EssKind::Symmetric, PhaseMode::Symmetric)]).with_telemetry(handle);
    engine.add_strategy(Box::new(SetSum {
        id: "site",
        target: Target::All,
        value: 4000,
    }));
    engine.run_cycle().await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    engine.run_cycle().await;
    drop(engine);
    task.await.unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 2);
    let debug = |i: usize| records[i].values.get("essA/DebugSetActivePower").map(|v| v.as_i64());
    assert_eq!(records[0].cycle, 1);
    assert_eq!(debug(0), None);
    assert_eq!(records[1].cycle, 2);
    assert_eq!(debug(1), Some(4000));
}

#[tokio::test]
async fn strategies_cannot_write_measurements() {
    struct Writer;

    impl ControlStrategy for Writer {
        fn id(&self) -> &str {
            "writer"
        }

        fn run(&mut self, ctx: &mut ControlContext<'_>) -> anyhow::Result<()> {
            let soc = ChannelAddress::new("essA", EssChannel::Soc.as_ref());
            ctx.write_channel(&soc, Value::Integer(1))?;
            Ok(())
        }
    }

    let a = FakeEss::new("essA", 5000);
    let mut engine = engine_with(config(1000, 100), &[(&a, EssKind::Symmetric, PhaseMode::Symmetric)]);
    engine.add_strategy(Box::new(Writer));
    engine.run_cycle().await;
    engine.run_cycle().await;

    assert_eq!(engine.diagnostics().strategy_failures, 2);
    assert_eq!(
        engine.image().snapshot().get_i64("essA", EssChannel::Soc.as_ref()),
        Some(50)
    );
}

#[tokio::test]
async fn near_equal_bias_uses_captured_soc() {
    let a = FakeEss::new("essA", 5000);
    let b = FakeEss::new("essB", 5000);
    a.set(EssChannel::Soc, 20);
    b.set(EssChannel::Soc, 80);
    let mut engine = engine_with(
        EngineConfig {
            bias: DistributionBias::KeepAllNearEqual,
            ..config(1000, 100)
        },
        &[(&a, EssKind::Symmetric, PhaseMode::Symmetric), (&b, EssKind::Symmetric, PhaseMode::Symmetric)],
    );
    let script = Arc::new(Mutex::new(vec![(Target::All, -3000)]));
    engine.add_strategy(Box::new(Scripted(script.clone())));

    engine.run_cycle().await;
    assert_eq!(a.last_write(EssChannel::SetActivePowerEquals), Some(-2400));
    assert_eq!(b.last_write(EssChannel::SetActivePowerEquals), Some(-600));

    *script.lock() = vec![(Target::All, 3000)];
    engine.run_cycle().await;
    assert_eq!(a.last_write(EssChannel::SetActivePowerEquals), Some(600));
    assert_eq!(b.last_write(EssChannel::SetActivePowerEquals), Some(2400));
}

#[tokio::test]
async fn moving_bias_holds_unconstrained_ess_at_last_setpoint() {
    let a = FakeEss::new("essA", 5000);
    let b = FakeEss::new("essB", 3000);
    let mut engine = engine_with(
        EngineConfig {
            bias: DistributionBias::MovingTowardsTarget,
            ..config(1000, 100)
        },
        &[(&a, EssKind::Symmetric, PhaseMode::Symmetric), (&b, EssKind::Symmetric, PhaseMode::Symmetric)],
    );
    let script = Arc::new(Mutex::new(vec![(Target::All, 4000)]));
    engine.add_strategy(Box::new(Scripted(script.clone())));

    engine.run_cycle().await;
    assert_eq!(a.last_write(EssChannel::SetActivePowerEquals), Some(2000));
    assert_eq!(b.last_write(EssChannel::SetActivePowerEquals), Some(2000));

    *script.lock() = vec![(Target::Ess("essA".into()), 1000)];
    engine.run_cycle().await;
    assert_eq!(a.last_write(EssChannel::SetActivePowerEquals), Some(1000));
    assert_eq!(b.last_write(EssChannel::SetActivePowerEquals), Some(2000));
    assert_eq!(engine.inverters()[1].last_p, 2000);
}
