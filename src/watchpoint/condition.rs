//! Condition evaluation.
//!
//! Every condition is a pure function of a tensor's [`Statistics`]. Custom
//! expressions are bounded in depth and size at registration so evaluation
//! stays cheap on every tensor arrival.

use crate::models::tensor::Statistics;
use crate::models::watchpoint::{
    CompareOp, Condition, Predicate, StatField, Thresholds, Trigger, ValueExpr,
};
use crate::{AppError, Result};

/// Deepest nesting accepted in a custom expression.
pub const MAX_EXPR_DEPTH: usize = 16;

/// Most nodes accepted in a custom expression.
pub const MAX_EXPR_NODES: usize = 64;

impl Condition {
    /// Evaluate against `stats`; `Some` carries the triggering statistic.
    #[must_use]
    pub fn evaluate(&self, stats: &Statistics) -> Option<Trigger> {
        #[allow(clippy::cast_precision_loss)]
        let count = |n: u64| Some(n as f64);

        match self {
            Self::HasNan => stats
                .has_nan()
                .then(|| Trigger::new("nan_count", count(stats.nan_count))),
            Self::HasInf => stats.has_inf().then(|| {
                Trigger::new(
                    "inf_count",
                    count(stats.pos_inf_count + stats.neg_inf_count),
                )
            }),
            Self::Overflow => (stats.has_nan() || stats.has_inf()).then(|| {
                Trigger::new(
                    "overflow",
                    count(stats.nan_count + stats.pos_inf_count + stats.neg_inf_count),
                )
            }),
            Self::ValueGt { threshold } => above("max", stats.max, *threshold),
            Self::ValueLt { threshold } => below("min", stats.min, *threshold),
            Self::RangeOutside { lo, hi } => {
                below("min", stats.min, *lo).or_else(|| above("max", stats.max, *hi))
            }
            Self::MaxMinGt { threshold } => above("max_min", spread(stats), *threshold),
            Self::MaxMinLt { threshold } => below("max_min", spread(stats), *threshold),
            Self::AllZero => stats
                .all_zero()
                .then(|| Trigger::new("zero_count", count(stats.zero_count))),
            Self::ZeroPercentageGe { percentage } => {
                let observed = stats.zero_percentage();
                (stats.count > 0 && observed >= *percentage)
                    .then(|| Trigger::new("zero_percentage", Some(observed)))
            }
            Self::TensorTooLarge(t) => thresholds(t, stats, above),
            Self::TensorTooSmall(t) => thresholds(t, stats, below),
            Self::Custom { expr } => expr
                .holds(stats)
                .then(|| Trigger::new("custom", None)),
        }
    }

    /// Whether a hit on a prefix of a tensor's elements implies a hit on the
    /// whole tensor, so the condition may be evaluated on partial statistics.
    #[must_use]
    pub fn is_monotone(&self) -> bool {
        matches!(
            self,
            Self::HasNan
                | Self::HasInf
                | Self::Overflow
                | Self::ValueGt { .. }
                | Self::ValueLt { .. }
                | Self::RangeOutside { .. }
                | Self::MaxMinGt { .. }
        )
    }

    /// Check parameters at registration time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParam` for inverted ranges, percentages
    /// outside `[0, 100]`, empty threshold sets, NaN thresholds, or custom
    /// expressions exceeding [`MAX_EXPR_DEPTH`] / [`MAX_EXPR_NODES`].
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::HasNan | Self::HasInf | Self::Overflow | Self::AllZero => Ok(()),
            Self::ValueGt { threshold }
            | Self::ValueLt { threshold }
            | Self::MaxMinGt { threshold }
            | Self::MaxMinLt { threshold } => not_nan("threshold", *threshold),
            Self::RangeOutside { lo, hi } => {
                not_nan("lo", *lo)?;
                not_nan("hi", *hi)?;
                if lo > hi {
                    return Err(AppError::InvalidParam(format!(
                        "range lower bound {lo} exceeds upper bound {hi}"
                    )));
                }
                Ok(())
            }
            Self::ZeroPercentageGe { percentage } => {
                if (0.0..=100.0).contains(percentage) {
                    Ok(())
                } else {
                    Err(AppError::InvalidParam(format!(
                        "percentage {percentage} outside [0, 100]"
                    )))
                }
            }
            Self::TensorTooLarge(t) | Self::TensorTooSmall(t) => {
                if t.is_empty() {
                    return Err(AppError::InvalidParam(
                        "at least one threshold must be set".into(),
                    ));
                }
                [t.abs_mean, t.max, t.min, t.mean]
                    .into_iter()
                    .flatten()
                    .try_for_each(|v| not_nan("threshold", v))
            }
            Self::Custom { expr } => {
                let mut nodes = 0;
                expr.check_bounds(1, &mut nodes)
            }
        }
    }
}

fn not_nan(name: &str, value: f64) -> Result<()> {
    if value.is_nan() {
        Err(AppError::InvalidParam(format!("{name} must not be NaN")))
    } else {
        Ok(())
    }
}

fn above(statistic: &str, observed: Option<f64>, threshold: f64) -> Option<Trigger> {
    observed
        .filter(|v| *v > threshold)
        .map(|v| Trigger::new(statistic, Some(v)))
}

fn below(statistic: &str, observed: Option<f64>, threshold: f64) -> Option<Trigger> {
    observed
        .filter(|v| *v < threshold)
        .map(|v| Trigger::new(statistic, Some(v)))
}

fn spread(stats: &Statistics) -> Option<f64> {
    Some(stats.max? - stats.min?)
}

fn thresholds(
    t: &Thresholds,
    stats: &Statistics,
    crossed: fn(&str, Option<f64>, f64) -> Option<Trigger>,
) -> Option<Trigger> {
    [
        ("abs_mean", stats.abs_mean, t.abs_mean),
        ("max", stats.max, t.max),
        ("min", stats.min, t.min),
        ("mean", stats.mean, t.mean),
    ]
    .into_iter()
    .find_map(|(name, observed, bound)| bound.and_then(|b| crossed(name, observed, b)))
}

impl StatField {
    #[allow(clippy::cast_precision_loss)]
    fn read(self, stats: &Statistics) -> Option<f64> {
        match self {
            Self::Count => Some(stats.count as f64),
            Self::Min => stats.min,
            Self::Max => stats.max,
            Self::Mean => stats.mean,
            Self::AbsMean => stats.abs_mean,
            Self::NanCount => Some(stats.nan_count as f64),
            Self::InfCount => Some((stats.pos_inf_count + stats.neg_inf_count) as f64),
            Self::ZeroCount => Some(stats.zero_count as f64),
            Self::ZeroPercentage => Some(stats.zero_percentage()),
        }
    }
}

impl ValueExpr {
    /// Numeric value, or `None` when a statistic is undefined or a
    /// division by zero occurs.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn value(&self, stats: &Statistics) -> Option<f64> {
        match self {
            Self::Stat { field } => field.read(stats),
            Self::Const { value } => Some(*value),
            Self::Abs { arg } => arg.value(stats).map(f64::abs),
            Self::Add { lhs, rhs } => Some(lhs.value(stats)? + rhs.value(stats)?),
            Self::Sub { lhs, rhs } => Some(lhs.value(stats)? - rhs.value(stats)?),
            Self::Mul { lhs, rhs } => Some(lhs.value(stats)? * rhs.value(stats)?),
            Self::Div { lhs, rhs } => {
                let divisor = rhs.value(stats)?;
                if divisor == 0.0 {
                    None
                } else {
                    Some(lhs.value(stats)? / divisor)
                }
            }
        }
    }

    fn check_bounds(&self, depth: usize, nodes: &mut usize) -> Result<()> {
        enter(depth, nodes)?;
        match self {
            Self::Stat { .. } | Self::Const { .. } => Ok(()),
            Self::Abs { arg } => arg.check_bounds(depth + 1, nodes),
            Self::Add { lhs, rhs }
            | Self::Sub { lhs, rhs }
            | Self::Mul { lhs, rhs }
            | Self::Div { lhs, rhs } => {
                lhs.check_bounds(depth + 1, nodes)?;
                rhs.check_bounds(depth + 1, nodes)
            }
        }
    }
}

impl Predicate {
    /// Whether the predicate holds for `stats`.
    #[must_use]
    pub fn holds(&self, stats: &Statistics) -> bool {
        match self {
            Self::Compare { lhs, cmp, rhs } => match (lhs.value(stats), rhs.value(stats)) {
                (Some(l), Some(r)) => compare(l, *cmp, r),
                _ => false,
            },
            Self::And { args } => args.iter().all(|p| p.holds(stats)),
            Self::Or { args } => args.iter().any(|p| p.holds(stats)),
            Self::Not { arg } => !arg.holds(stats),
        }
    }

    fn check_bounds(&self, depth: usize, nodes: &mut usize) -> Result<()> {
        enter(depth, nodes)?;
        match self {
            Self::Compare { lhs, rhs, .. } => {
                lhs.check_bounds(depth + 1, nodes)?;
                rhs.check_bounds(depth + 1, nodes)
            }
            Self::And { args } | Self::Or { args } => {
                if args.is_empty() {
                    return Err(AppError::InvalidParam(
                        "and/or needs at least one operand".into(),
                    ));
                }
                args.iter()
                    .try_for_each(|p| p.check_bounds(depth + 1, nodes))
            }
            Self::Not { arg } => arg.check_bounds(depth + 1, nodes),
        }
    }
}

fn enter(depth: usize, nodes: &mut usize) -> Result<()> {
    *nodes += 1;
    if depth > MAX_EXPR_DEPTH {
        return Err(AppError::InvalidParam(format!(
            "expression deeper than {MAX_EXPR_DEPTH}"
        )));
    }
    if *nodes > MAX_EXPR_NODES {
        return Err(AppError::InvalidParam(format!(
            "expression larger than {MAX_EXPR_NODES} nodes"
        )));
    }
    Ok(())
}

#[allow(clippy::float_cmp)]
fn compare(lhs: f64, op: CompareOp, rhs: f64) -> bool {
    match op {
        CompareOp::Gt => lhs > rhs,
        CompareOp::Ge => lhs >= rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::Le => lhs <= rhs,
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
    }
}
