//! Watchpoints, their conditions, and recorded hits.
//!
//! Conditions are a closed set of variants plus a small expression tree for
//! custom predicates. Evaluation lives in [`crate::watchpoint::condition`].

use serde::{Deserialize, Serialize};

use super::tensor::TensorKey;

/// Watchpoint identifier, assigned by the engine, starting at 1.
pub type WatchpointId = u32;

/// Optional thresholds for the too-large / too-small presets.
///
/// A preset hits when any threshold that is set is crossed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    /// Bound on mean absolute value.
    pub abs_mean: Option<f64>,
    /// Bound on the largest finite element.
    pub max: Option<f64>,
    /// Bound on the smallest finite element.
    pub min: Option<f64>,
    /// Bound on the mean.
    pub mean: Option<f64>,
}

impl Thresholds {
    /// Whether no threshold is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.abs_mean.is_none() && self.max.is_none() && self.min.is_none() && self.mean.is_none()
    }
}

/// Statistic that can be referenced from a custom expression.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatField {
    /// Element count.
    Count,
    /// Smallest finite element.
    Min,
    /// Largest finite element.
    Max,
    /// Mean of finite elements.
    Mean,
    /// Mean absolute value.
    AbsMean,
    /// NaN elements.
    NanCount,
    /// Infinite elements of either sign.
    InfCount,
    /// Zero elements.
    ZeroCount,
    /// Zero elements in percent.
    ZeroPercentage,
}

impl StatField {
    /// Name used in hit reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::AbsMean => "abs_mean",
            Self::NanCount => "nan_count",
            Self::InfCount => "inf_count",
            Self::ZeroCount => "zero_count",
            Self::ZeroPercentage => "zero_percentage",
        }
    }
}

/// Numeric sub-expression of a custom condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValueExpr {
    /// A statistic of the evaluated tensor.
    Stat {
        /// Referenced statistic.
        field: StatField,
    },
    /// Literal.
    Const {
        /// Literal value.
        value: f64,
    },
    /// Absolute value.
    Abs {
        /// Operand.
        arg: Box<ValueExpr>,
    },
    /// Sum.
    Add {
        /// Left operand.
        lhs: Box<ValueExpr>,
        /// Right operand.
        rhs: Box<ValueExpr>,
    },
    /// Difference.
    Sub {
        /// Left operand.
        lhs: Box<ValueExpr>,
        /// Right operand.
        rhs: Box<ValueExpr>,
    },
    /// Product.
    Mul {
        /// Left operand.
        lhs: Box<ValueExpr>,
        /// Right operand.
        rhs: Box<ValueExpr>,
    },
    /// Quotient; division by zero yields no value.
    Div {
        /// Left operand.
        lhs: Box<ValueExpr>,
        /// Right operand.
        rhs: Box<ValueExpr>,
    },
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

/// Boolean expression of a custom condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Compare two numeric expressions. False when either side has no value.
    Compare {
        /// Left operand.
        lhs: ValueExpr,
        /// Operator.
        cmp: CompareOp,
        /// Right operand.
        rhs: ValueExpr,
    },
    /// All operands hold.
    And {
        /// Operands.
        args: Vec<Predicate>,
    },
    /// At least one operand holds.
    Or {
        /// Operands.
        args: Vec<Predicate>,
    },
    /// Negation.
    Not {
        /// Operand.
        arg: Box<Predicate>,
    },
}

/// Predicate over one tensor's statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Any NaN element.
    HasNan,
    /// Any infinite element.
    HasInf,
    /// Any NaN or infinite element.
    Overflow,
    /// Largest finite element above `threshold`.
    ValueGt {
        /// Exclusive bound.
        threshold: f64,
    },
    /// Smallest finite element below `threshold`.
    ValueLt {
        /// Exclusive bound.
        threshold: f64,
    },
    /// Some finite element outside `[lo, hi]`.
    RangeOutside {
        /// Inclusive lower bound.
        lo: f64,
        /// Inclusive upper bound.
        hi: f64,
    },
    /// `max - min` above `threshold`.
    MaxMinGt {
        /// Exclusive bound.
        threshold: f64,
    },
    /// `max - min` below `threshold`.
    MaxMinLt {
        /// Exclusive bound.
        threshold: f64,
    },
    /// Every element is zero.
    AllZero,
    /// At least `percentage` percent of elements are zero.
    ZeroPercentageGe {
        /// Percentage in `[0, 100]`.
        percentage: f64,
    },
    /// Any set threshold exceeded from above (`abs_mean > t`, `max > t`, ...).
    TensorTooLarge(Thresholds),
    /// Any set threshold undercut (`abs_mean < t`, `max < t`, ...).
    TensorTooSmall(Thresholds),
    /// Custom expression.
    Custom {
        /// Root predicate.
        expr: Predicate,
    },
}

/// A conditional breakpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Watchpoint {
    /// Engine-assigned identifier.
    pub id: WatchpointId,
    /// Glob patterns over device-local node names.
    pub patterns: Vec<String>,
    /// Predicate evaluated per tensor.
    pub condition: Condition,
    /// Disabled watchpoints never hit.
    pub enabled: bool,
}

/// The statistic that satisfied a condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    /// Statistic or condition name (`nan_count`, `max`, `custom`, ...).
    pub statistic: String,
    /// Observed value when one applies.
    pub value: Option<f64>,
}

impl Trigger {
    /// Construct a trigger report.
    #[must_use]
    pub fn new(statistic: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            statistic: statistic.into(),
            value,
        }
    }
}

/// One watchpoint firing on one tensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchpointHit {
    /// Watchpoint that fired.
    pub watchpoint_id: WatchpointId,
    /// Tensor that satisfied the condition.
    pub tensor: TensorKey,
    /// Triggering statistic.
    pub trigger: Trigger,
}

impl WatchpointHit {
    /// Training step of the hit.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.tensor.step
    }

    /// Node name of the hit.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.tensor.node
    }
}
