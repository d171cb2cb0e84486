pub mod timeseries;

use std::sync::Arc;

use crate::config::{SinkKind, TelemetryConfig};

pub use timeseries::{
    ForwarderConfig, InMemoryTimeseries, LogSink, TelemetryHandle, TimeseriesForwarder, TimeseriesRecord,
    TimeseriesSink,
};

impl From<&TelemetryConfig> for ForwarderConfig {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            retry_attempts: config.retry_attempts,
            retry_backoff: std::time::Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Sink selected by configuration
pub fn sink_from_config(config: &TelemetryConfig) -> Arc<dyn TimeseriesSink> {
    match config.sink {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Memory => Arc::new(InMemoryTimeseries::new()),
    }
}
