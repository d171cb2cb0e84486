use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::{ChannelAddress, ChannelDoc, ChannelError, Value};

/// Immutable view of all channel values for one cycle.
///
/// Holders of an `Arc<Snapshot>` keep a consistent view regardless of how
/// many swaps happen meanwhile.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    taken_at: DateTime<Utc>,
    values: HashMap<ChannelAddress, Option<Value>>,
    stale: HashSet<ChannelAddress>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            taken_at: Utc::now(),
            values: HashMap::new(),
            stale: HashSet::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Current value; `None` if the channel is unknown or undefined.
    pub fn get(&self, component_id: &str, channel_id: &str) -> Option<Value> {
        self.get_addr(&ChannelAddress::new(component_id, channel_id))
    }

    pub fn get_addr(&self, address: &ChannelAddress) -> Option<Value> {
        self.values.get(address).copied().flatten()
    }

    pub fn get_i64(&self, component_id: &str, channel_id: &str) -> Option<i64> {
        self.get(component_id, channel_id).map(|v| v.as_i64())
    }

    pub fn get_f64(&self, component_id: &str, channel_id: &str) -> Option<f64> {
        self.get(component_id, channel_id).map(|v| v.as_f64())
    }

    pub fn contains(&self, address: &ChannelAddress) -> bool {
        self.values.contains_key(address)
    }

    pub fn is_stale(&self, address: &ChannelAddress) -> bool {
        self.stale.contains(address)
    }

    pub fn stale_channels(&self) -> impl Iterator<Item = &ChannelAddress> {
        self.stale.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChannelAddress, Option<Value>)> {
        self.values.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NextSlot {
    Empty,
    Value(Value),
    Undefined,
}

#[derive(Debug)]
struct ChannelEntry {
    doc: ChannelDoc,
    next: NextSlot,
    missed_cycles: u32,
    stale: bool,
}

/// Outcome of one [`ProcessImage::swap`]
#[derive(Debug, Clone, Default)]
pub struct SwapReport {
    pub version: u64,
    pub promoted: usize,
    pub newly_stale: Vec<ChannelAddress>,
    pub recovered: Vec<ChannelAddress>,
    pub stale_total: usize,
}

/// All channels of all components, double-buffered.
///
/// Writers (drivers, engine, strategies) only touch the *next* slots, guarded
/// by a short mutex. The published snapshot is replaced in a single pointer
/// exchange, so readers never see a mix of two cycles.
#[derive(Debug)]
pub struct ProcessImage {
    channels: Mutex<HashMap<ChannelAddress, ChannelEntry>>,
    published: RwLock<Arc<Snapshot>>,
    stale_after_cycles: AtomicU32,
}

impl Default for ProcessImage {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ProcessImage {
    pub fn new(stale_after_cycles: u32) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            published: RwLock::new(Arc::new(Snapshot::empty())),
            stale_after_cycles: AtomicU32::new(stale_after_cycles.max(1)),
        }
    }

    pub fn set_stale_after_cycles(&self, cycles: u32) {
        self.stale_after_cycles.store(cycles.max(1), Ordering::Relaxed);
    }

    /// Declares a channel. Re-registering keeps the current value.
    pub fn register(&self, address: ChannelAddress, doc: ChannelDoc) {
        let mut channels = self.channels.lock();
        match channels.get_mut(&address) {
            Some(entry) => entry.doc = doc,
            None => {
                channels.insert(
                    address,
                    ChannelEntry {
                        doc,
                        next: NextSlot::Empty,
                        missed_cycles: 0,
                        stale: false,
                    },
                );
            }
        }
    }

    /// Removes every channel of a component; they disappear from the next snapshot.
    pub fn unregister_component(&self, component_id: &str) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|address, _| address.component_id != component_id);
        before - channels.len()
    }

    pub fn doc(&self, address: &ChannelAddress) -> Option<ChannelDoc> {
        self.channels.lock().get(address).map(|e| e.doc.clone())
    }

    pub fn addresses(&self, component_id: &str) -> Vec<ChannelAddress> {
        self.channels
            .lock()
            .keys()
            .filter(|a| a.component_id == component_id)
            .cloned()
            .collect()
    }

    /// Stores a value in the next slot after validating type and bounds.
    /// Returns the value as stored (possibly clamped).
    pub fn set_next(&self, address: &ChannelAddress, value: Value) -> Result<Value, ChannelError> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(address)
            .ok_or_else(|| ChannelError::UnknownChannel(address.clone()))?;
        let stored = entry.doc.validate(address, value)?;
        entry.next = NextSlot::Value(stored);
        Ok(stored)
    }

    /// Like [`set_next`](Self::set_next) but refuses read-only channels.
    pub fn write(&self, address: &ChannelAddress, value: Value) -> Result<Value, ChannelError> {
        {
            let channels = self.channels.lock();
            let entry = channels
                .get(address)
                .ok_or_else(|| ChannelError::UnknownChannel(address.clone()))?;
            if !entry.doc.is_writable() {
                return Err(ChannelError::ReadOnly(address.clone()));
            }
        }
        self.set_next(address, value)
    }

    /// Marks the next value as explicitly undefined, e.g. after a failed device read.
    pub fn invalidate_next(&self, address: &ChannelAddress) -> Result<(), ChannelError> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(address)
            .ok_or_else(|| ChannelError::UnknownChannel(address.clone()))?;
        entry.next = NextSlot::Undefined;
        Ok(())
    }

    /// Value waiting in the next slot, if any.
    pub fn pending(&self, address: &ChannelAddress) -> Option<Value> {
        match self.channels.lock().get(address).map(|e| e.next) {
            Some(NextSlot::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn current(&self, address: &ChannelAddress) -> Option<Value> {
        self.published.read().get_addr(address)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.read().clone()
    }

    /// Promotes every next value to current and publishes a new snapshot.
    ///
    /// Read-write channels without a next value become undefined. Read-only
    /// channels keep their last value and count a missed cycle; after
    /// `stale_after_cycles` misses they are flagged stale.
    pub fn swap(&self, version: u64) -> SwapReport {
        let previous = self.snapshot();
        let stale_after = self.stale_after_cycles.load(Ordering::Relaxed);
        let mut report = SwapReport {
            version,
            ..Default::default()
        };

        let mut values = HashMap::new();
        let mut stale = HashSet::new();
        {
            let mut channels = self.channels.lock();
            values.reserve(channels.len());
            for (address, entry) in channels.iter_mut() {
                let current = match std::mem::replace(&mut entry.next, NextSlot::Empty) {
                    NextSlot::Value(v) => {
                        report.promoted += 1;
                        if entry.stale {
                            report.recovered.push(address.clone());
                        }
                        entry.missed_cycles = 0;
                        entry.stale = false;
                        Some(v)
                    }
                    _ if entry.doc.is_writable() => None,
                    slot => {
                        // a failed read counts as a miss just like a missing one
                        entry.missed_cycles = entry.missed_cycles.saturating_add(1);
                        if entry.missed_cycles >= stale_after && !entry.stale {
                            entry.stale = true;
                            report.newly_stale.push(address.clone());
                        }
                        match slot {
                            NextSlot::Undefined => None,
                            _ => previous.get_addr(address),
                        }
                    }
                };
                if entry.stale {
                    stale.insert(address.clone());
                }
                values.insert(address.clone(), current);
            }
        }

        report.stale_total = stale.len();
        let snapshot = Arc::new(Snapshot {
            version,
            taken_at: Utc::now(),
            values,
            stale,
        });
        *self.published.write() = snapshot;
        report
    }
}
