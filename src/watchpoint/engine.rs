//! Per-session watchpoint registry and hit log.
//!
//! Hits are buffered per `(watchpoint, tensor)` while a step is in flight and
//! committed to the step's log on `StepEnd`. Re-evaluating a pair replaces its
//! buffered hit, so the log never holds duplicates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::models::tensor::{Statistics, TensorKey, TensorRecord};
use crate::models::watchpoint::{Condition, Watchpoint, WatchpointHit, WatchpointId};
use crate::watchpoint::pattern::PatternSet;
use crate::{AppError, Result};

/// Committed hits, by step.
pub type HitLog = BTreeMap<u64, Arc<Vec<WatchpointHit>>>;

#[derive(Debug, Clone)]
struct Entry {
    watchpoint: Watchpoint,
    patterns: PatternSet,
}

/// Watchpoint registry owned by one session worker.
#[derive(Debug)]
pub struct WatchpointEngine {
    max_watchpoints: usize,
    next_id: WatchpointId,
    entries: BTreeMap<WatchpointId, Entry>,
    pending: BTreeMap<(WatchpointId, TensorKey), WatchpointHit>,
    hits: HitLog,
}

impl WatchpointEngine {
    /// Create an empty registry holding at most `max_watchpoints` entries.
    #[must_use]
    pub fn new(max_watchpoints: usize) -> Self {
        Self {
            max_watchpoints,
            next_id: 1,
            entries: BTreeMap::new(),
            pending: BTreeMap::new(),
            hits: BTreeMap::new(),
        }
    }

    /// Validate a new watchpoint and allocate its id without installing it.
    ///
    /// # Errors
    ///
    /// - `AppError::LimitExceeded` if the registry is full.
    /// - `AppError::InvalidParam` for bad patterns or condition parameters.
    pub fn prepare(
        &mut self,
        patterns: Vec<String>,
        condition: Condition,
        enabled: bool,
    ) -> Result<Watchpoint> {
        if self.entries.len() >= self.max_watchpoints {
            return Err(AppError::LimitExceeded(format!(
                "session already has {} watchpoints",
                self.max_watchpoints
            )));
        }
        PatternSet::compile(&patterns)?;
        condition.validate()?;
        let id = self.next_id;
        self.next_id += 1;
        Ok(Watchpoint {
            id,
            patterns,
            condition,
            enabled,
        })
    }

    /// Install a prepared watchpoint, replacing any entry with the same id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParam` if its patterns do not compile.
    pub fn install(&mut self, watchpoint: Watchpoint) -> Result<()> {
        let patterns = PatternSet::compile(&watchpoint.patterns)?;
        self.next_id = self.next_id.max(watchpoint.id + 1);
        self.entries.insert(
            watchpoint.id,
            Entry {
                watchpoint,
                patterns,
            },
        );
        Ok(())
    }

    /// Validate and install a watchpoint; returns its id.
    ///
    /// # Errors
    ///
    /// See [`prepare`](Self::prepare).
    pub fn register(
        &mut self,
        patterns: Vec<String>,
        condition: Condition,
        enabled: bool,
    ) -> Result<WatchpointId> {
        let watchpoint = self.prepare(patterns, condition, enabled)?;
        let id = watchpoint.id;
        self.install(watchpoint)?;
        Ok(id)
    }

    /// Remove a watchpoint and its buffered hits. Committed hits are kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not registered.
    pub fn unregister(&mut self, id: WatchpointId) -> Result<Watchpoint> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("watchpoint {id} not found")))?;
        self.pending.retain(|(wp, _), _| *wp != id);
        Ok(entry.watchpoint)
    }

    /// Enable or disable a watchpoint. Disabling drops its buffered hits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not registered.
    pub fn toggle(&mut self, id: WatchpointId, enabled: bool) -> Result<Watchpoint> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("watchpoint {id} not found")))?;
        entry.watchpoint.enabled = enabled;
        let updated = entry.watchpoint.clone();
        if !enabled {
            self.pending.retain(|(wp, _), _| *wp != id);
        }
        Ok(updated)
    }

    /// Look up a watchpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not registered.
    pub fn get(&self, id: WatchpointId) -> Result<&Watchpoint> {
        self.entries
            .get(&id)
            .map(|e| &e.watchpoint)
            .ok_or_else(|| AppError::NotFound(format!("watchpoint {id} not found")))
    }

    /// Evaluate every enabled, matching watchpoint against a complete record.
    ///
    /// Returns the hits for this record; they are buffered until the record's
    /// step is finalised.
    pub fn evaluate(&mut self, record: &TensorRecord) -> Vec<WatchpointHit> {
        self.evaluate_with(&record.key, &record.statistics, false)
    }

    /// Evaluate monotone conditions against the statistics of a partially
    /// reassembled record.
    pub fn evaluate_partial(&mut self, key: &TensorKey, stats: &Statistics) -> Vec<WatchpointHit> {
        self.evaluate_with(key, stats, true)
    }

    fn matching_hits(&self, key: &TensorKey, stats: &Statistics, monotone_only: bool) -> Vec<WatchpointHit> {
        let mut found = Vec::new();
        for entry in self.entries.values() {
            let wp = &entry.watchpoint;
            if !wp.enabled || !entry.patterns.matches(&key.node) {
                continue;
            }
            if monotone_only && !wp.condition.is_monotone() {
                continue;
            }
            if let Some(trigger) = wp.condition.evaluate(stats) {
                found.push(WatchpointHit {
                    watchpoint_id: wp.id,
                    tensor: key.clone(),
                    trigger,
                });
            }
        }
        found
    }

    fn evaluate_with(
        &mut self,
        key: &TensorKey,
        stats: &Statistics,
        monotone_only: bool,
    ) -> Vec<WatchpointHit> {
        let found = self.matching_hits(key, stats, monotone_only);
        for hit in &found {
            debug!(
                watchpoint_id = hit.watchpoint_id,
                tensor = %hit.tensor,
                statistic = hit.trigger.statistic.as_str(),
                "watchpoint hit buffered"
            );
            self.pending
                .insert((hit.watchpoint_id, hit.tensor.clone()), hit.clone());
        }
        found
    }

    /// Drop buffered hits of a record that failed reassembly.
    pub fn discard_pending(&mut self, key: &TensorKey) {
        self.pending.retain(|(_, tensor), _| tensor != key);
    }

    /// Commit buffered hits of `step`.
    ///
    /// Buffered hits of earlier steps are dropped: that step has ended and
    /// its hits can no longer pause the run. Returns the newly committed hits
    /// in watchpoint-then-tensor order.
    pub fn finalize_step(&mut self, step: u64) -> Vec<WatchpointHit> {
        let mut due = BTreeMap::new();
        for (slot, hit) in std::mem::take(&mut self.pending) {
            match slot.1.step.cmp(&step) {
                std::cmp::Ordering::Less => {
                    debug!(tensor = %slot.1, "stale buffered hit dropped");
                }
                std::cmp::Ordering::Equal => {
                    due.insert(slot, hit);
                }
                std::cmp::Ordering::Greater => {
                    self.pending.insert(slot, hit);
                }
            }
        }

        let committed: Vec<WatchpointHit> = due.into_values().collect();
        for hit in &committed {
            let log = Arc::make_mut(self.hits.entry(hit.step()).or_default());
            if let Some(existing) = log.iter_mut().find(|h| {
                h.watchpoint_id == hit.watchpoint_id && h.tensor == hit.tensor
            }) {
                *existing = hit.clone();
            } else {
                log.push(hit.clone());
            }
        }
        committed
    }

    /// Re-evaluate the current registry against complete records of `step`
    /// and replace that step's committed hits with the result.
    ///
    /// Records of other steps are skipped. Buffered hits of the rechecked
    /// records are superseded; in-flight records keep theirs.
    pub fn recheck<'a, I>(&mut self, step: u64, records: I) -> Vec<WatchpointHit>
    where
        I: IntoIterator<Item = &'a TensorRecord>,
    {
        let mut rechecked = Vec::new();
        for record in records {
            if record.key.step != step {
                continue;
            }
            self.discard_pending(&record.key);
            rechecked.extend(self.matching_hits(&record.key, &record.statistics, false));
        }
        rechecked.sort_by(|a, b| {
            (a.watchpoint_id, &a.tensor).cmp(&(b.watchpoint_id, &b.tensor))
        });
        if rechecked.is_empty() {
            self.hits.remove(&step);
        } else {
            self.hits.insert(step, Arc::new(rechecked.clone()));
        }
        debug!(step, hits = rechecked.len(), "watchpoints rechecked");
        rechecked
    }

    /// Committed hits of `step`.
    #[must_use]
    pub fn hits_for(&self, step: u64) -> Vec<WatchpointHit> {
        self.hits
            .get(&step)
            .map(|log| log.as_ref().clone())
            .unwrap_or_default()
    }

    /// Clear committed and buffered hits of steps below `step`.
    pub fn clear_hits_before(&mut self, step: u64) {
        self.hits = self.hits.split_off(&step);
        self.pending.retain(|(_, tensor), _| tensor.step >= step);
    }

    /// Clear every committed and buffered hit.
    pub fn clear_hits(&mut self) {
        self.hits.clear();
        self.pending.clear();
    }

    /// Steps referenced by a committed or buffered hit.
    #[must_use]
    pub fn hit_steps(&self) -> BTreeSet<u64> {
        self.hits
            .keys()
            .copied()
            .chain(self.pending.keys().map(|(_, tensor)| tensor.step))
            .collect()
    }

    /// Registered watchpoints in id order.
    #[must_use]
    pub fn watchpoints(&self) -> Vec<Watchpoint> {
        self.entries.values().map(|e| e.watchpoint.clone()).collect()
    }

    /// Committed hit log for publication.
    #[must_use]
    pub fn hit_log(&self) -> HitLog {
        self.hits.clone()
    }

    /// Re-install watchpoints carried over from a previous session.
    ///
    /// Entries that no longer validate are skipped.
    pub fn restore(&mut self, watchpoints: Vec<Watchpoint>) {
        for watchpoint in watchpoints {
            let id = watchpoint.id;
            if let Err(e) = self.install(watchpoint) {
                debug!(watchpoint_id = id, error = %e, "skipping inherited watchpoint");
            }
        }
    }
}
