use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};

use crate::channel::{Snapshot, Value};

/// Committed channel values of one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    /// Keyed by `component/channel`; undefined channels are omitted
    pub values: BTreeMap<String, Value>,
}

impl TimeseriesRecord {
    pub fn from_snapshot(snapshot: &Snapshot, cycle: u64) -> Self {
        let values = snapshot
            .iter()
            .filter_map(|(address, value)| value.map(|v| (address.to_string(), v)))
            .collect();
        Self {
            timestamp: snapshot.taken_at(),
            cycle,
            values,
        }
    }
}

/// Destination for committed cycle values.
///
/// Delivery is at-least-once: a sink may see the same timestamp twice and
/// must treat the repeat as a no-op.
#[async_trait]
pub trait TimeseriesSink: Send + Sync {
    async fn push(&self, record: &TimeseriesRecord) -> Result<()>;
}

/// Keeps records in memory, keyed by timestamp.
#[derive(Debug, Default)]
pub struct InMemoryTimeseries {
    records: RwLock<BTreeMap<DateTime<Utc>, TimeseriesRecord>>,
}

impl InMemoryTimeseries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, timestamp: &DateTime<Utc>) -> Option<TimeseriesRecord> {
        self.records.read().get(timestamp).cloned()
    }

    pub fn latest(&self) -> Option<TimeseriesRecord> {
        self.records.read().values().next_back().cloned()
    }

    pub fn records(&self) -> Vec<TimeseriesRecord> {
        self.records.read().values().cloned().collect()
    }
}

#[async_trait]
impl TimeseriesSink for InMemoryTimeseries {
    async fn push(&self, record: &TimeseriesRecord) -> Result<()> {
        self.records
            .write()
            .entry(record.timestamp)
            .or_insert_with(|| record.clone());
        Ok(())
    }
}

/// Emits every record as JSON at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl TimeseriesSink for LogSink {
    async fn push(&self, record: &TimeseriesRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        debug!(cycle = record.cycle, record = %json, "timeseries record");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForwarderConfig {
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            retry_attempts: 5,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Sending side of a [`TimeseriesForwarder`]; never blocks.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    tx: mpsc::Sender<TimeseriesRecord>,
}

impl TelemetryHandle {
    /// Queues a record. Returns false if the queue is full or closed.
    pub fn try_push(&self, record: TimeseriesRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(cycle = record.cycle, "telemetry queue full, record dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Drains a bounded queue into a sink on a background task, retrying
/// failed pushes with exponential back-off.
pub struct TimeseriesForwarder;

impl TimeseriesForwarder {
    /// The task ends once every handle has been dropped and the queue is empty.
    pub fn spawn(sink: Arc<dyn TimeseriesSink>, config: ForwarderConfig) -> (TelemetryHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TimeseriesRecord>(config.queue_capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                Self::deliver(sink.as_ref(), &record, &config).await;
            }
            debug!("timeseries forwarder stopped");
        });
        (TelemetryHandle { tx }, task)
    }

    async fn deliver(sink: &dyn TimeseriesSink, record: &TimeseriesRecord, config: &ForwarderConfig) {
        let mut backoff = config.retry_backoff;
        let mut attempt = 0;
        loop {
            match sink.push(record).await {
                Ok(()) => return,
                Err(e) if attempt < config.retry_attempts => {
                    attempt += 1;
                    warn!(cycle = record.cycle, attempt, error = %e, "timeseries push failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(e) => {
                    error!(cycle = record.cycle, error = %e, "timeseries push failed, giving up");
                    return;
                }
            }
        }
    }
}
