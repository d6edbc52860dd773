//! Saving goal value types.

use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Fraction of the monthly spending limit at which a warning fires.
///
/// Always within `(0, 1]`.
#[nutype(
    validate(predicate = |t: &Decimal| *t > Decimal::ZERO && *t <= Decimal::ONE),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        AsRef,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Threshold(Decimal);

/// Ordered, duplicate-free set of thresholds.
pub type Thresholds = BTreeSet<Threshold>;

/// Target amount to save per month plus the warning thresholds attached to it.
///
/// Construction does not validate; the account aggregate enforces that an
/// active goal has a positive amount and at least one threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingGoal {
    /// Amount to put aside each month
    pub amount: Decimal,
    /// Warning thresholds as fractions of the spending limit
    pub thresholds: Thresholds,
}

impl SavingGoal {
    /// Builds a goal; duplicate thresholds collapse.
    pub fn new(amount: Decimal, thresholds: impl IntoIterator<Item = Threshold>) -> Self {
        Self {
            amount,
            thresholds: thresholds.into_iter().collect(),
        }
    }

    /// Whether `threshold` is already part of the goal.
    pub fn has_threshold(&self, threshold: Threshold) -> bool {
        self.thresholds.contains(&threshold)
    }
}
