//! Arbitrary-precision numeric primitives
//!
//! Every feed value is a `rust_decimal::Decimal` with explicit,
//! checked operations, never implicit floating point. Overflow and
//! division by zero are task errors, not panics.

use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};

use crate::error::RunnerError;
use crate::task::RoundMode;

// ─────────────────────────────────────────────────────────────────
// Checked binary operations
// ─────────────────────────────────────────────────────────────────

pub fn add(lhs: Decimal, rhs: Decimal) -> Result<Decimal, RunnerError> {
    lhs.checked_add(rhs)
        .ok_or_else(|| RunnerError::Numeric(format!("overflow in {} + {}", lhs, rhs)))
}

pub fn subtract(lhs: Decimal, rhs: Decimal) -> Result<Decimal, RunnerError> {
    lhs.checked_sub(rhs)
        .ok_or_else(|| RunnerError::Numeric(format!("overflow in {} - {}", lhs, rhs)))
}

pub fn multiply(lhs: Decimal, rhs: Decimal) -> Result<Decimal, RunnerError> {
    lhs.checked_mul(rhs)
        .ok_or_else(|| RunnerError::Numeric(format!("overflow in {} * {}", lhs, rhs)))
}

pub fn divide(lhs: Decimal, rhs: Decimal) -> Result<Decimal, RunnerError> {
    if rhs.is_zero() {
        return Err(RunnerError::Numeric("division by zero".to_string()));
    }
    lhs.checked_div(rhs)
        .ok_or_else(|| RunnerError::Numeric(format!("overflow in {} / {}", lhs, rhs)))
}

pub fn pow(base: Decimal, exponent: Decimal) -> Result<Decimal, RunnerError> {
    base.checked_powd(exponent)
        .ok_or_else(|| RunnerError::Numeric(format!("overflow in {} ^ {}", base, exponent)))
}

// ─────────────────────────────────────────────────────────────────
// Rounding
// ─────────────────────────────────────────────────────────────────

/// Round to `decimals` places with an explicit direction: `Up` is
/// away from zero, `Down` is toward zero.
pub fn round(value: Decimal, decimals: u32, mode: RoundMode) -> Decimal {
    let strategy = match mode {
        RoundMode::Up => RoundingStrategy::AwayFromZero,
        RoundMode::Down => RoundingStrategy::ToZero,
    };
    value.round_dp_with_strategy(decimals, strategy)
}

// ─────────────────────────────────────────────────────────────────
// Aggregations
// ─────────────────────────────────────────────────────────────────

pub fn max(values: &[Decimal]) -> Result<Decimal, RunnerError> {
    values
        .iter()
        .copied()
        .max()
        .ok_or_else(|| RunnerError::InsufficientData("max over empty input".to_string()))
}

pub fn min(values: &[Decimal]) -> Result<Decimal, RunnerError> {
    values
        .iter()
        .copied()
        .min()
        .ok_or_else(|| RunnerError::InsufficientData("min over empty input".to_string()))
}

pub fn mean(values: &[Decimal]) -> Result<Decimal, RunnerError> {
    if values.is_empty() {
        return Err(RunnerError::InsufficientData(
            "mean over empty input".to_string(),
        ));
    }
    let sum = values
        .iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v))
        .ok_or_else(|| RunnerError::Numeric("overflow summing samples".to_string()))?;
    divide(sum, Decimal::from(values.len() as u64))
}

pub fn median(values: &[Decimal]) -> Result<Decimal, RunnerError> {
    if values.is_empty() {
        return Err(RunnerError::InsufficientData(
            "median over empty input".to_string(),
        ));
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Ok(sorted[mid])
    } else {
        divide(add(sorted[mid - 1], sorted[mid])?, Decimal::TWO)
    }
}

/// Spread of a sample set: max − min. Errors on empty input.
pub fn range(values: &[Decimal]) -> Result<Decimal, RunnerError> {
    if values.is_empty() {
        return Err(RunnerError::InsufficientData(
            "range over empty input".to_string(),
        ));
    }
    subtract(max(values)?, min(values)?)
}

// ─────────────────────────────────────────────────────────────────
// EMA
// ─────────────────────────────────────────────────────────────────

/// Exponential moving average as a weighted blend of two adjacent
/// simple averages: `lambda * avg(now−P, now] + (1−lambda) *
/// avg(now−2P, now−P]`.
///
/// `history` is (unix seconds, value) sorted ascending by timestamp.
/// Requires at least one sample in each window and that the walk
/// back reaches a sample at or before `now − 2P`; short history is
/// an error, never silently approximated. `lambda` must be in
/// (0, 1].
pub fn ema(
    history: &[(i64, Decimal)],
    lambda: Decimal,
    period_secs: u64,
    now: i64,
) -> Result<Decimal, RunnerError> {
    if lambda <= Decimal::ZERO || lambda > Decimal::ONE {
        return Err(RunnerError::Numeric(format!(
            "lambda {} outside (0, 1]",
            lambda
        )));
    }

    let period = period_secs as i64;
    let newer_start = now - period;
    let older_start = now - 2 * period;

    let mut newer: Vec<Decimal> = Vec::new();
    let mut older: Vec<Decimal> = Vec::new();
    let mut reached_past = false;

    for &(ts, value) in history.iter().rev() {
        if ts > now {
            continue;
        }
        if ts > newer_start {
            newer.push(value);
        } else if ts > older_start {
            older.push(value);
        } else {
            reached_past = true;
            break;
        }
    }

    if newer.is_empty() || older.is_empty() || !reached_past {
        return Err(RunnerError::InsufficientData(format!(
            "ema needs samples spanning both {}s windows ({} newer, {} older, history {} past 2 periods)",
            period_secs,
            newer.len(),
            older.len(),
            if reached_past { "reaches" } else { "does not reach" },
        )));
    }

    let avg_newer = mean(&newer)?;
    let avg_older = mean(&older)?;
    add(
        multiply(lambda, avg_newer)?,
        multiply(subtract(Decimal::ONE, lambda)?, avg_older)?,
    )
}
