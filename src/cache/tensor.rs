//! Step-indexed tensor storage with a byte budget.
//!
//! Records are grouped into one slab per step. Slabs are shared through
//! `Arc` and mutated copy-on-write, so a published [`TensorCacheView`] keeps
//! showing the state it was taken from. Eviction drops full buffers of the
//! oldest steps but always keeps statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::models::tensor::{Statistics, TensorKey, TensorRecord};
use crate::{AppError, Result};

/// Steps at the head of the cache whose buffers are never evicted.
pub const PROTECTED_RECENT_STEPS: usize = 2;

/// Result of a tensor lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorLookup {
    /// The record with its full buffer.
    Full(Arc<TensorRecord>),
    /// The record was cached but its buffer was reclaimed; statistics remain.
    PartiallyEvicted(Arc<TensorRecord>),
}

impl TensorLookup {
    /// The record, with or without buffer.
    #[must_use]
    pub fn record(&self) -> &Arc<TensorRecord> {
        match self {
            Self::Full(record) | Self::PartiallyEvicted(record) => record,
        }
    }
}

/// All records of one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepSlab {
    records: BTreeMap<TensorKey, Arc<TensorRecord>>,
    buffer_bytes: u64,
}

impl StepSlab {
    /// Records of the step, ordered by key.
    pub fn records(&self) -> impl Iterator<Item = &Arc<TensorRecord>> {
        self.records.values()
    }

    /// Bytes of full buffers still held by the step.
    #[must_use]
    pub fn buffer_bytes(&self) -> u64 {
        self.buffer_bytes
    }
}

/// Read-only view of the tensor cache, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct TensorCacheView {
    steps: BTreeMap<u64, Arc<StepSlab>>,
}

impl TensorCacheView {
    /// Look up a record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record was never cached or its
    /// step's statistics were pruned.
    pub fn get(&self, key: &TensorKey) -> Result<TensorLookup> {
        let record = self
            .steps
            .get(&key.step)
            .and_then(|slab| slab.records.get(key))
            .ok_or_else(|| AppError::NotFound(format!("tensor {key} not found")))?;
        if record.buffer.is_some() {
            Ok(TensorLookup::Full(Arc::clone(record)))
        } else {
            Ok(TensorLookup::PartiallyEvicted(Arc::clone(record)))
        }
    }

    /// Statistics of a record, available whether or not its buffer was evicted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record is unknown.
    pub fn get_stats(&self, key: &TensorKey) -> Result<Statistics> {
        self.get(key).map(|lookup| lookup.record().statistics)
    }

    /// Latest record of the same node output at a step before `key.step`.
    #[must_use]
    pub fn previous(&self, key: &TensorKey) -> Option<&Arc<TensorRecord>> {
        self.steps.range(..key.step).rev().find_map(|(&step, slab)| {
            slab.records.get(&TensorKey {
                step,
                ..key.clone()
            })
        })
    }

    /// Slab of `step`, if any record of it is cached.
    #[must_use]
    pub fn step(&self, step: u64) -> Option<&Arc<StepSlab>> {
        self.steps.get(&step)
    }

    /// Cached steps, ascending.
    pub fn steps(&self) -> impl Iterator<Item = u64> + '_ {
        self.steps.keys().copied()
    }
}

/// Tensor cache owned by one session worker.
#[derive(Debug)]
pub struct TensorCache {
    view: TensorCacheView,
    byte_budget: u64,
    resident_bytes: u64,
}

impl TensorCache {
    /// Create an empty cache bounded by `byte_budget` bytes of buffers.
    #[must_use]
    pub fn new(byte_budget: u64) -> Self {
        Self {
            view: TensorCacheView::default(),
            byte_budget,
            resident_bytes: 0,
        }
    }

    /// Insert or replace a record.
    ///
    /// `(device, node, output_index, step)` is unique: a second record with the
    /// same key replaces the first.
    pub fn put(&mut self, record: TensorRecord) {
        let slab = Arc::make_mut(self.view.steps.entry(record.key.step).or_default());
        let added = record.buffer_len();
        let removed = slab
            .records
            .insert(record.key.clone(), Arc::new(record))
            .map_or(0, |old| old.buffer_len());
        slab.buffer_bytes = slab.buffer_bytes + added - removed;
        self.resident_bytes = self.resident_bytes + added - removed;
    }

    /// Look up a record. See [`TensorCacheView::get`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record is unknown.
    pub fn get(&self, key: &TensorKey) -> Result<TensorLookup> {
        self.view.get(key)
    }

    /// Statistics of a record. See [`TensorCacheView::get_stats`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record is unknown.
    pub fn get_stats(&self, key: &TensorKey) -> Result<Statistics> {
        self.view.get_stats(key)
    }

    /// Evict buffers of the oldest steps while over budget.
    ///
    /// The [`PROTECTED_RECENT_STEPS`] most recent steps and every step in
    /// `protected` keep their buffers, even if that leaves the cache over
    /// budget. Returns the steps whose buffers were evicted.
    pub fn tick(&mut self, protected: &BTreeSet<u64>) -> Vec<u64> {
        let recent: BTreeSet<u64> = self
            .view
            .steps
            .keys()
            .rev()
            .take(PROTECTED_RECENT_STEPS)
            .copied()
            .collect();
        let candidates: Vec<u64> = self
            .view
            .steps
            .iter()
            .filter(|&(step, slab)| {
                slab.buffer_bytes > 0 && !recent.contains(step) && !protected.contains(step)
            })
            .map(|(step, _)| *step)
            .collect();

        let mut evicted = Vec::new();
        for step in candidates {
            if self.resident_bytes <= self.byte_budget {
                break;
            }
            let freed = self.evict_step(step);
            debug!(step, freed, "evicted tensor buffers");
            evicted.push(step);
        }
        evicted
    }

    /// Drop the full buffers of every step.
    pub fn release_buffers(&mut self) {
        let steps: Vec<u64> = self.view.steps.keys().copied().collect();
        for step in steps {
            self.evict_step(step);
        }
    }

    /// Keep records of the `limit` most recent steps only.
    pub fn prune_stats(&mut self, limit: u64) {
        let keep = usize::try_from(limit).unwrap_or(usize::MAX);
        let excess = self.view.steps.len().saturating_sub(keep);
        let doomed: Vec<u64> = self.view.steps.keys().take(excess).copied().collect();
        for step in doomed {
            if let Some(slab) = self.view.steps.remove(&step) {
                self.resident_bytes -= slab.buffer_bytes;
            }
        }
    }

    /// Bytes of full buffers currently held.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    /// Configured budget.
    #[must_use]
    pub fn byte_budget(&self) -> u64 {
        self.byte_budget
    }

    /// Oldest step with cached records.
    #[must_use]
    pub fn oldest_step(&self) -> Option<u64> {
        self.view.steps.keys().next().copied()
    }

    /// Read-only view for publication.
    #[must_use]
    pub fn view(&self) -> TensorCacheView {
        self.view.clone()
    }

    fn evict_step(&mut self, step: u64) -> u64 {
        let Some(entry) = self.view.steps.get_mut(&step) else {
            return 0;
        };
        if entry.buffer_bytes == 0 {
            return 0;
        }
        let slab = Arc::make_mut(entry);
        for record in slab.records.values_mut() {
            if record.buffer.is_some() {
                *record = Arc::new(record.without_buffer());
            }
        }
        let freed = slab.buffer_bytes;
        slab.buffer_bytes = 0;
        self.resident_bytes -= freed;
        freed
    }
}
