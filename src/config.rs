use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::domain::{EssKind, PhaseMode};
use crate::hardware::HardwareMode;
#[cfg(feature = "sim")]
use crate::hardware::SimulatedEssConfig;
use crate::power_flow::{DistributionBias, Relationship, SolverConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "OED__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("Duplicate ESS id: {0}")]
    DuplicateEss(String),
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub engine: EngineConfig,
    #[serde(default)]
    #[validate(nested)]
    pub ess: Vec<EssConfig>,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[validate(schema(function = "validate_engine"))]
pub struct EngineConfig {
    #[validate(range(min = 10))]
    pub cycle_period_ms: u64,
    #[validate(range(min = 1))]
    pub io_timeout_ms: u64,
    #[serde(default = "default_stale_after")]
    #[validate(range(min = 1))]
    pub stale_after_cycles: u32,
    #[serde(default = "default_solver_iterations")]
    #[validate(range(min = 1, max = 10000))]
    pub solver_max_iterations: usize,
    /// Caller bounds applied to every inverter on top of device limits
    #[serde(default = "default_global_min")]
    pub global_min_p: i64,
    #[serde(default = "default_global_max")]
    pub global_max_p: i64,
    #[serde(default)]
    pub bias: DistributionBias,
    #[serde(default)]
    pub hardware: HardwareMode,
    /// Dispatch weight per ESS id; filled from `[[ess]]` entries
    #[serde(default)]
    pub weights: BTreeMap<String, u32>,
}

fn default_stale_after() -> u32 {
    3
}

fn default_solver_iterations() -> usize {
    crate::power_flow::model::DEFAULT_MAX_ITERATIONS
}

fn default_global_min() -> i64 {
    i64::MIN
}

fn default_global_max() -> i64 {
    i64::MAX
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ValidationError> {
    if engine.global_min_p > engine.global_max_p {
        return Err(ValidationError::new("global_min_p_exceeds_global_max_p"));
    }
    // A hanging device must not be able to stretch every cycle past its period.
    if engine.io_timeout_ms >= engine.cycle_period_ms {
        return Err(ValidationError::new("io_timeout_ms_not_below_cycle_period_ms"));
    }
    Ok(())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: 1000,
            io_timeout_ms: 300,
            stale_after_cycles: default_stale_after(),
            solver_max_iterations: default_solver_iterations(),
            global_min_p: default_global_min(),
            global_max_p: default_global_max(),
            bias: DistributionBias::default(),
            hardware: HardwareMode::default(),
            weights: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn solver(&self) -> SolverConfig {
        SolverConfig {
            max_iterations: self.solver_max_iterations,
            bias: self.bias,
        }
    }

    pub fn weight(&self, ess_id: &str) -> Option<u32> {
        self.weights.get(ess_id).copied()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EssConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default)]
    pub kind: EssKind,
    #[serde(default)]
    pub mode: PhaseMode,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[cfg(feature = "sim")]
    #[serde(default)]
    pub sim: SimulatedEssConfig,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PidConfig {
    pub p: f64,
    pub i: f64,
    #[serde(default)]
    pub d: f64,
}

/// Control strategies in execution order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    FixActivePower {
        id: String,
        /// ESS id; every inverter when unset
        #[serde(default)]
        ess: Option<String>,
        #[serde(default = "default_relationship")]
        relationship: Relationship,
        power: i64,
        #[serde(default)]
        pid: Option<PidConfig>,
    },
    LimitActivePower {
        id: String,
        #[serde(default)]
        ess: Option<String>,
        #[serde(default)]
        max_charge_power: Option<i64>,
        #[serde(default)]
        max_discharge_power: Option<i64>,
    },
}

fn default_relationship() -> Relationship {
    Relationship::Equals
}

impl StrategyConfig {
    pub fn id(&self) -> &str {
        match self {
            StrategyConfig::FixActivePower { id, .. } | StrategyConfig::LimitActivePower { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub sink: SinkKind,
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    #[validate(range(min = 1))]
    pub retry_backoff_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            queue_capacity: 64,
            retry_attempts: 5,
            retry_backoff_ms: 200,
        }
    }
}

impl Config {
    /// Loads `config/default.toml` overlaid with `OED__`-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Config = figment.extract().map_err(Box::new)?;
        config.validate()?;

        let mut seen = HashSet::new();
        for ess in &config.ess {
            if !seen.insert(ess.id.as_str()) {
                return Err(ConfigError::DuplicateEss(ess.id.clone()));
            }
        }
        for ess in &config.ess {
            config.engine.weights.entry(ess.id.clone()).or_insert(ess.weight);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [engine]
        cycle_period_ms = 500
        io_timeout_ms = 100
        global_max_p = 8000

        [[ess]]
        id = "ess0"
        weight = 2

        [[ess]]
        id = "ess1"
        kind = "asymmetric"
        mode = "asymmetric"

        [[strategies]]
        type = "fix_active_power"
        id = "fix0"
        power = 3000

        [[strategies]]
        type = "limit_active_power"
        id = "limit0"
        ess = "ess1"
        max_discharge_power = 1000
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.engine.cycle_period(), Duration::from_millis(500));
        assert_eq!(config.engine.stale_after_cycles, 3);
        assert_eq!(config.engine.global_min_p, i64::MIN);
        assert_eq!(config.engine.weight("ess0"), Some(2));
        assert_eq!(config.engine.weight("ess1"), Some(1));
        assert_eq!(config.ess[1].kind, EssKind::Asymmetric);
        assert_eq!(config.strategies.len(), 2);
        assert_eq!(config.strategies[1].id(), "limit0");
        assert!(matches!(
            config.strategies[0],
            StrategyConfig::FixActivePower { relationship: Relationship::Equals, power: 3000, .. }
        ));
        assert_eq!(config.telemetry.queue_capacity, 64);
    }

    #[test]
    fn test_rejects_short_period() {
        let err = Config::from_toml_str("[engine]\ncycle_period_ms = 5\nio_timeout_ms = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_inverted_global_bounds() {
        let toml = "[engine]\ncycle_period_ms = 100\nio_timeout_ms = 10\nglobal_min_p = 10\nglobal_max_p = -10\n";
        assert!(matches!(Config::from_toml_str(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_io_timeout_not_below_period() {
        let toml = "[engine]\ncycle_period_ms = 100\nio_timeout_ms = 100\n";
        assert!(matches!(Config::from_toml_str(toml), Err(ConfigError::Invalid(_))));

        let engine = EngineConfig {
            cycle_period_ms: 200,
            io_timeout_ms: 500,
            ..EngineConfig::default()
        };
        assert!(engine.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicate_ess() {
        let toml = "[engine]\ncycle_period_ms = 100\nio_timeout_ms = 10\n[[ess]]\nid = \"a\"\n[[ess]]\nid = \"a\"\n";
        assert!(matches!(Config::from_toml_str(toml), Err(ConfigError::DuplicateEss(id)) if id == "a"));
    }

    #[test]
    fn test_default_file_loads() {
        let config = Config::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml")).unwrap();
        assert!(!config.ess.is_empty());
        assert!(config.engine.cycle_period_ms >= 10);
    }
}
