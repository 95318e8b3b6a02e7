//! Tensor records and their statistics summaries.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::DeviceId;
use crate::{AppError, Result};

/// Element type of a tensor buffer. Buffers are little-endian.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// IEEE 754 half precision.
    F16,
    /// bfloat16.
    Bf16,
    /// IEEE 754 single precision.
    F32,
    /// IEEE 754 double precision.
    F64,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// One byte per element, zero is false.
    Bool,
}

impl DType {
    /// Width of one element in bytes.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::F16 | Self::Bf16 | Self::I16 | Self::U16 => 2,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F64 | Self::I64 | Self::U64 => 8,
        }
    }

    /// Decode one element starting at `raw[0]` (exactly `width()` bytes).
    #[allow(clippy::cast_precision_loss)] // Statistics are summaries over f64.
    fn decode(self, raw: &[u8]) -> f64 {
        let mut eight = [0u8; 8];
        eight[..raw.len()].copy_from_slice(raw);
        match self {
            Self::F16 => half::f16::from_le_bytes([raw[0], raw[1]]).to_f64(),
            Self::Bf16 => half::bf16::from_le_bytes([raw[0], raw[1]]).to_f64(),
            Self::F32 => f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Self::F64 => f64::from_le_bytes(eight),
            Self::I8 => f64::from(i8::from_le_bytes([raw[0]])),
            Self::I16 => f64::from(i16::from_le_bytes([raw[0], raw[1]])),
            Self::I32 => f64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Self::I64 => i64::from_le_bytes(eight) as f64,
            Self::U8 => f64::from(raw[0]),
            Self::U16 => f64::from(u16::from_le_bytes([raw[0], raw[1]])),
            Self::U32 => f64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Self::U64 => u64::from_le_bytes(eight) as f64,
            Self::Bool => {
                if raw[0] == 0 {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }
}

/// Number of elements described by `shape` (1 for scalars).
///
/// # Errors
///
/// Returns `AppError::Protocol` if the product overflows.
pub fn element_count(shape: &[u64]) -> Result<u64> {
    shape.iter().try_fold(1u64, |acc, &dim| {
        acc.checked_mul(dim)
            .ok_or_else(|| AppError::Protocol(format!("shape {shape:?} overflows")))
    })
}

/// Mergeable statistics accumulator over a contiguous run of elements.
///
/// Counts and extrema merge commutatively. Sums are combined by the caller
/// in element order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialStats {
    count: u64,
    finite_count: u64,
    nan_count: u64,
    pos_inf_count: u64,
    neg_inf_count: u64,
    zero_count: u64,
    min: f64,
    max: f64,
    sum: f64,
    abs_sum: f64,
}

impl Default for PartialStats {
    fn default() -> Self {
        Self {
            count: 0,
            finite_count: 0,
            nan_count: 0,
            pos_inf_count: 0,
            neg_inf_count: 0,
            zero_count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            abs_sum: 0.0,
        }
    }
}

impl PartialStats {
    /// Accumulate every element of a little-endian buffer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if `bytes` is not a whole number of elements.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        let width = dtype.width();
        if bytes.len() % width != 0 {
            return Err(AppError::Protocol(format!(
                "buffer of {} bytes is not a multiple of {dtype:?} width {width}",
                bytes.len()
            )));
        }
        let mut stats = Self::default();
        for raw in bytes.chunks_exact(width) {
            stats.observe(dtype.decode(raw));
        }
        Ok(stats)
    }

    /// Accumulate one element.
    #[allow(clippy::float_cmp)]
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        if value.is_nan() {
            self.nan_count += 1;
            return;
        }
        if value.is_infinite() {
            if value > 0.0 {
                self.pos_inf_count += 1;
            } else {
                self.neg_inf_count += 1;
            }
            return;
        }
        if value == 0.0 {
            self.zero_count += 1;
        }
        self.finite_count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.abs_sum += value.abs();
    }

    /// Fold `other` into `self`. `other` must cover the elements following `self`.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.finite_count += other.finite_count;
        self.nan_count += other.nan_count;
        self.pos_inf_count += other.pos_inf_count;
        self.neg_inf_count += other.neg_inf_count;
        self.zero_count += other.zero_count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.abs_sum += other.abs_sum;
    }

    /// Elements accumulated so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Freeze into the public summary.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_statistics(&self) -> Statistics {
        let finite = self.finite_count > 0;
        let n = self.finite_count as f64;
        Statistics {
            count: self.count,
            min: finite.then_some(self.min),
            max: finite.then_some(self.max),
            mean: finite.then(|| self.sum / n),
            abs_mean: finite.then(|| self.abs_sum / n),
            nan_count: self.nan_count,
            pos_inf_count: self.pos_inf_count,
            neg_inf_count: self.neg_inf_count,
            zero_count: self.zero_count,
        }
    }
}

/// Compact summary of one tensor, retained after its buffer is evicted.
///
/// `min`, `max`, `mean`, and `abs_mean` cover finite elements only and are
/// `None` when the tensor has none.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    /// Total element count.
    pub count: u64,
    /// Smallest finite element.
    pub min: Option<f64>,
    /// Largest finite element.
    pub max: Option<f64>,
    /// Mean of finite elements.
    pub mean: Option<f64>,
    /// Mean absolute value of finite elements.
    pub abs_mean: Option<f64>,
    /// NaN elements.
    pub nan_count: u64,
    /// `+inf` elements.
    pub pos_inf_count: u64,
    /// `-inf` elements.
    pub neg_inf_count: u64,
    /// Exactly-zero elements.
    pub zero_count: u64,
}

impl Statistics {
    /// Compute statistics over a fully materialised buffer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if `bytes` is not a whole number of elements.
    pub fn from_buffer(dtype: DType, bytes: &[u8]) -> Result<Self> {
        PartialStats::from_bytes(dtype, bytes).map(|partial| partial.to_statistics())
    }

    /// Whether any element is NaN.
    #[must_use]
    pub fn has_nan(&self) -> bool {
        self.nan_count > 0
    }

    /// Whether any element is infinite.
    #[must_use]
    pub fn has_inf(&self) -> bool {
        self.pos_inf_count + self.neg_inf_count > 0
    }

    /// Fraction of elements equal to zero, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn zero_percentage(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.zero_count as f64 * 100.0 / self.count as f64
        }
    }

    /// Whether the tensor is non-empty and consists only of zeros.
    #[must_use]
    pub fn all_zero(&self) -> bool {
        self.count > 0 && self.zero_count == self.count
    }
}

/// Statistics of the element-wise difference `current - previous`.
///
/// `tolerance` is a fraction in `[0, 1]` of the largest finite absolute
/// difference; differences within that bound count as zero.
///
/// # Errors
///
/// Returns `AppError::InvalidParam` if the buffers differ in length, are not
/// a whole number of elements, or `tolerance` is outside `[0, 1]`.
pub fn diff_statistics(dtype: DType, current: &[u8], previous: &[u8], tolerance: f64) -> Result<Statistics> {
    if !(0.0..=1.0).contains(&tolerance) {
        return Err(AppError::InvalidParam(format!(
            "tolerance {tolerance} outside [0, 1]"
        )));
    }
    let width = dtype.width();
    if current.len() != previous.len() || current.len() % width != 0 {
        return Err(AppError::InvalidParam(format!(
            "cannot compare buffers of {} and {} bytes",
            current.len(),
            previous.len()
        )));
    }
    let diffs: Vec<f64> = current
        .chunks_exact(width)
        .zip(previous.chunks_exact(width))
        .map(|(c, p)| dtype.decode(c) - dtype.decode(p))
        .collect();
    let bound = diffs
        .iter()
        .filter(|d| d.is_finite())
        .fold(0.0_f64, |acc, d| acc.max(d.abs()))
        * tolerance;
    let mut stats = PartialStats::default();
    for diff in diffs {
        stats.observe(if diff.abs() <= bound { 0.0 } else { diff });
    }
    Ok(stats.to_statistics())
}

/// Identity of one output of one node at one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorKey {
    /// Device holding the producing node.
    pub device: DeviceId,
    /// Producing node's local name.
    pub node: String,
    /// Output slot of the producing node.
    pub output_index: u32,
    /// Training step.
    pub step: u64,
}

impl std::fmt::Display for TensorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.device, self.node, self.output_index, self.step
        )
    }
}

/// Value of one node output at one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorRecord {
    /// Record identity.
    pub key: TensorKey,
    /// Element type.
    pub dtype: DType,
    /// Dimensions.
    pub shape: Vec<u64>,
    /// Summary, always present.
    pub statistics: Statistics,
    /// Full little-endian buffer; `None` once evicted.
    #[serde(with = "super::base64_bytes::option", default)]
    pub buffer: Option<Bytes>,
}

impl TensorRecord {
    /// Bytes held by the full buffer.
    #[must_use]
    pub fn buffer_len(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.len() as u64)
    }

    /// Copy of this record without its buffer.
    #[must_use]
    pub fn without_buffer(&self) -> Self {
        Self {
            key: self.key.clone(),
            dtype: self.dtype,
            shape: self.shape.clone(),
            statistics: self.statistics,
            buffer: None,
        }
    }
}
