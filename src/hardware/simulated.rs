use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use strum::IntoEnumIterator;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{DeviceDriver, DriverError};
use crate::channel::Value;
use crate::domain::{EssChannel, EssKind, Phase, Pwr};

/// SoC band (percent) at either end in which allowed power tapers to zero
const TAPER_BAND_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedEssConfig {
    #[serde(default = "default_capacity_wh")]
    pub capacity_wh: f64,
    #[serde(default = "default_power")]
    pub max_apparent_power: i64,
    #[serde(default = "default_power")]
    pub max_charge_power: i64,
    #[serde(default = "default_power")]
    pub max_discharge_power: i64,
    #[serde(default = "default_soc")]
    pub initial_soc: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    /// Artificial latency for every read
    #[serde(default)]
    pub read_delay_ms: u64,
    /// Probability (0..1) that a read fails
    #[serde(default)]
    pub failure_rate: f64,
    /// Fixed integration step; wall-clock time between writes when unset
    #[serde(default)]
    pub step_seconds: Option<f64>,
}

fn default_capacity_wh() -> f64 {
    10_000.0
}

fn default_power() -> i64 {
    5_000
}

fn default_soc() -> f64 {
    50.0
}

fn default_efficiency() -> f64 {
    0.95
}

impl Default for SimulatedEssConfig {
    fn default() -> Self {
        Self {
            capacity_wh: default_capacity_wh(),
            max_apparent_power: default_power(),
            max_charge_power: default_power(),
            max_discharge_power: default_power(),
            initial_soc: default_soc(),
            efficiency: default_efficiency(),
            read_delay_ms: 0,
            failure_rate: 0.0,
            step_seconds: None,
        }
    }
}

#[derive(Debug)]
struct SimState {
    soc: f64,
    active_power: i64,
    reactive_power: i64,
    last_update: Instant,
}

/// Battery simulator speaking the ESS channel set.
///
/// Positive power discharges. SoC is integrated on every write; allowed
/// charge/discharge power tapers off near full and empty.
#[derive(Debug, Clone)]
pub struct SimulatedEss {
    id: String,
    kind: EssKind,
    config: SimulatedEssConfig,
    state: Arc<RwLock<SimState>>,
    fail_reads: Arc<AtomicBool>,
}

impl SimulatedEss {
    pub fn new(id: impl Into<String>, kind: EssKind, config: SimulatedEssConfig) -> Self {
        let soc = config.initial_soc.clamp(0.0, 100.0);
        Self {
            id: id.into(),
            kind,
            config,
            state: Arc::new(RwLock::new(SimState {
                soc,
                active_power: 0,
                reactive_power: 0,
                last_update: Instant::now(),
            })),
            fail_reads: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Forces every read to fail until cleared.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub async fn soc(&self) -> f64 {
        self.state.read().await.soc
    }

    pub async fn active_power(&self) -> i64 {
        self.state.read().await.active_power
    }

    pub async fn reactive_power(&self) -> i64 {
        self.state.read().await.reactive_power
    }

    fn allowed_charge(&self, soc: f64) -> i64 {
        let headroom = ((100.0 - soc) / TAPER_BAND_PERCENT).clamp(0.0, 1.0);
        -((self.config.max_charge_power.abs() as f64 * headroom) as i64)
    }

    fn allowed_discharge(&self, soc: f64) -> i64 {
        let headroom = (soc / TAPER_BAND_PERCENT).clamp(0.0, 1.0);
        (self.config.max_discharge_power.abs() as f64 * headroom) as i64
    }

    fn integrate(&self, state: &mut SimState) {
        let now = Instant::now();
        let dt_s = self
            .config
            .step_seconds
            .unwrap_or_else(|| now.duration_since(state.last_update).as_secs_f64());
        state.last_update = now;

        let capacity = self.config.capacity_wh.max(1.0);
        let efficiency = self.config.efficiency.clamp(0.5, 1.0);
        let power = state.active_power as f64;
        let delta_wh = if power >= 0.0 {
            -power * dt_s / 3600.0 / efficiency
        } else {
            -power * dt_s / 3600.0 * efficiency
        };
        state.soc = (state.soc + delta_wh / capacity * 100.0).clamp(0.0, 100.0);
    }

    fn requested(&self, values: &[(String, Value)], pwr: Pwr) -> Option<i64> {
        let lookup = |channel: EssChannel| {
            values
                .iter()
                .find(|(id, _)| id == channel.as_ref())
                .map(|(_, v)| v.as_i64())
        };
        match self.kind {
            EssKind::Symmetric => lookup(EssChannel::setpoint(pwr, None)),
            EssKind::Asymmetric => {
                let legs: Vec<i64> = Phase::ALL
                    .iter()
                    .filter_map(|phase| lookup(EssChannel::setpoint(pwr, Some(*phase))))
                    .collect();
                if legs.is_empty() {
                    lookup(EssChannel::setpoint(pwr, None))
                } else {
                    Some(legs.iter().sum())
                }
            }
        }
    }
}

#[async_trait]
impl DeviceDriver for SimulatedEss {
    fn id(&self) -> &str {
        &self.id
    }

    fn channels(&self) -> Vec<String> {
        EssChannel::iter()
            .filter(|c| c.is_measurement())
            .map(|c| c.as_ref().to_string())
            .collect()
    }

    async fn read(&self) -> Result<Vec<(String, Value)>, DriverError> {
        if self.config.read_delay_ms > 0 {
            sleep(Duration::from_millis(self.config.read_delay_ms)).await;
        }
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(DriverError::Communication(format!("{} not responding", self.id)));
        }
        if self.config.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.config.failure_rate.clamp(0.0, 1.0)) {
            return Err(DriverError::Communication(format!("{} injected read failure", self.id)));
        }

        let state = self.state.read().await;
        let values = vec![
            (EssChannel::Soc, state.soc.round() as i64),
            (EssChannel::ActivePower, state.active_power),
            (EssChannel::ReactivePower, state.reactive_power),
            (EssChannel::MaxApparentPower, self.config.max_apparent_power.abs()),
            (EssChannel::AllowedChargePower, self.allowed_charge(state.soc)),
            (EssChannel::AllowedDischargePower, self.allowed_discharge(state.soc)),
        ];
        Ok(values
            .into_iter()
            .map(|(channel, value)| (channel.as_ref().to_string(), Value::Integer(value.clamp(i32::MIN as i64, i32::MAX as i64) as i32)))
            .collect())
    }

    async fn write(&self, values: &[(String, Value)]) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        self.integrate(&mut state);

        let apparent = self.config.max_apparent_power.abs();
        if let Some(p) = self.requested(values, Pwr::Active) {
            let p = p.clamp(self.allowed_charge(state.soc), self.allowed_discharge(state.soc));
            state.active_power = p.clamp(-apparent, apparent);
        }
        if let Some(q) = self.requested(values, Pwr::Reactive) {
            state.reactive_power = q.clamp(-apparent, apparent);
        }
        debug!(
            ess = %self.id,
            active_power = state.active_power,
            reactive_power = state.reactive_power,
            soc = state.soc,
            "simulated ess applied setpoints"
        );
        Ok(())
    }
}
