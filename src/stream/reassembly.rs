//! Chunk reassembly with incremental statistics.
//!
//! Chunks of one tensor may arrive in any order. Each accepted chunk is folded
//! into a running [`PartialStats`] so NaN/Inf and extrema are known before the
//! tensor is complete. Once every sequence number is present the buffer is
//! concatenated in seq order and the final statistics are computed over it,
//! which makes the result independent of arrival order.

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::models::tensor::{element_count, DType, PartialStats, Statistics, TensorKey, TensorRecord};
use crate::stream::frames::TensorChunk;
use crate::{AppError, Result};

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// More chunks are expected; `stats` covers the chunks seen so far.
    Partial {
        /// Statistics over the received elements.
        stats: Statistics,
    },
    /// Every chunk arrived.
    Complete(TensorRecord),
    /// Byte-identical repeat of an already accepted chunk.
    Duplicate,
}

#[derive(Debug)]
struct PendingTensor {
    dtype: DType,
    shape: Vec<u64>,
    total_seqs: u32,
    expected_bytes: u64,
    received_bytes: u64,
    chunks: BTreeMap<u32, Bytes>,
    running: PartialStats,
}

impl PendingTensor {
    fn start(chunk: &TensorChunk, max_record_bytes: u64) -> Result<Self> {
        if chunk.total_seqs == 0 {
            return Err(AppError::Protocol("total_seqs must be at least 1".into()));
        }
        let elements = element_count(&chunk.shape)?;
        let expected_bytes = elements
            .checked_mul(chunk.dtype.width() as u64)
            .ok_or_else(|| AppError::Protocol(format!("shape {:?} overflows", chunk.shape)))?;
        if expected_bytes > max_record_bytes {
            return Err(AppError::Protocol(format!(
                "shape {:?} needs {expected_bytes} bytes, limit is {max_record_bytes}",
                chunk.shape
            )));
        }
        Ok(Self {
            dtype: chunk.dtype,
            shape: chunk.shape.clone(),
            total_seqs: chunk.total_seqs,
            expected_bytes,
            received_bytes: 0,
            chunks: BTreeMap::new(),
            running: PartialStats::default(),
        })
    }

    fn check_consistent(&self, chunk: &TensorChunk) -> Result<()> {
        if chunk.total_seqs != self.total_seqs {
            return Err(AppError::Protocol(format!(
                "total_seqs changed from {} to {}",
                self.total_seqs, chunk.total_seqs
            )));
        }
        if chunk.dtype != self.dtype {
            return Err(AppError::Protocol(format!(
                "dtype changed from {:?} to {:?}",
                self.dtype, chunk.dtype
            )));
        }
        if chunk.shape != self.shape {
            return Err(AppError::Protocol(format!(
                "shape changed from {:?} to {:?}",
                self.shape, chunk.shape
            )));
        }
        Ok(())
    }
}

/// Reassembles chunked tensors, keyed by [`TensorKey`].
///
/// A chunk that fails validation fails its whole record: the partial state is
/// dropped and later chunks for the same key start over.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<TensorKey, PendingTensor>,
    max_record_bytes: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    /// Create an empty reassembler without a record size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_record_bytes(u64::MAX)
    }

    /// Create an empty reassembler that fails records whose declared shape
    /// needs more than `max_record_bytes`.
    #[must_use]
    pub fn with_max_record_bytes(max_record_bytes: u64) -> Self {
        Self {
            pending: HashMap::new(),
            max_record_bytes,
        }
    }

    /// Feed one chunk for `key`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for an out-of-range or conflicting seq, a
    /// change of `total_seqs`/dtype/shape, a partial element, a shape above
    /// the record size limit, or a final size that disagrees with the shape.
    /// The record is discarded.
    pub fn accept(&mut self, key: &TensorKey, chunk: &TensorChunk) -> Result<ChunkOutcome> {
        let result = self.accept_inner(key, chunk);
        if result.is_err() {
            self.pending.remove(key);
        }
        result
    }

    fn accept_inner(&mut self, key: &TensorKey, chunk: &TensorChunk) -> Result<ChunkOutcome> {
        if !self.pending.contains_key(key) {
            self.pending
                .insert(key.clone(), PendingTensor::start(chunk, self.max_record_bytes)?);
        }
        let entry = self
            .pending
            .get_mut(key)
            .ok_or_else(|| AppError::Protocol(format!("reassembly state lost for {key}")))?;

        entry.check_consistent(chunk)?;
        if chunk.seq >= entry.total_seqs {
            return Err(AppError::Protocol(format!(
                "seq {} out of range for {} chunks",
                chunk.seq, entry.total_seqs
            )));
        }
        if let Some(existing) = entry.chunks.get(&chunk.seq) {
            if *existing == chunk.bytes {
                debug!(tensor = %key, seq = chunk.seq, "duplicate chunk ignored");
                return Ok(ChunkOutcome::Duplicate);
            }
            return Err(AppError::Protocol(format!(
                "conflicting duplicate of seq {}",
                chunk.seq
            )));
        }

        let partial = PartialStats::from_bytes(entry.dtype, &chunk.bytes)?;
        entry.received_bytes += chunk.bytes.len() as u64;
        if entry.received_bytes > entry.expected_bytes {
            return Err(AppError::Protocol(format!(
                "received {} bytes, shape allows {}",
                entry.received_bytes, entry.expected_bytes
            )));
        }
        entry.running.merge(&partial);
        entry.chunks.insert(chunk.seq, chunk.bytes.clone());

        if entry.chunks.len() < entry.total_seqs as usize {
            return Ok(ChunkOutcome::Partial {
                stats: entry.running.to_statistics(),
            });
        }

        let entry = self
            .pending
            .remove(key)
            .ok_or_else(|| AppError::Protocol(format!("reassembly state lost for {key}")))?;
        if entry.received_bytes != entry.expected_bytes {
            return Err(AppError::Protocol(format!(
                "reassembled {} bytes, shape {:?} needs {}",
                entry.received_bytes, entry.shape, entry.expected_bytes
            )));
        }
        let mut buffer = BytesMut::with_capacity(usize::try_from(entry.received_bytes).unwrap_or(0));
        for bytes in entry.chunks.values() {
            buffer.extend_from_slice(bytes);
        }
        let buffer = buffer.freeze();
        let statistics = Statistics::from_buffer(entry.dtype, &buffer)?;
        Ok(ChunkOutcome::Complete(TensorRecord {
            key: key.clone(),
            dtype: entry.dtype,
            shape: entry.shape,
            statistics,
            buffer: Some(buffer),
        }))
    }

    /// Drop incomplete records of steps up to and including `step`.
    ///
    /// Returns the keys of the discarded records.
    pub fn abandon_through(&mut self, step: u64) -> Vec<TensorKey> {
        let stale: Vec<TensorKey> = self
            .pending
            .keys()
            .filter(|key| key.step <= step)
            .cloned()
            .collect();
        for key in &stale {
            self.pending.remove(key);
        }
        stale
    }

    /// Drop every incomplete record.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of records still being reassembled.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
