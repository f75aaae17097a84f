//! Counter deltas and revenue attribution.
//!
//! One counter unit is worth one currency unit. The split percentage picks
//! the share of that money that goes to one party; which party is the
//! caller's convention.

/// Split applied when neither the caller nor the machine supplies one.
pub const DEFAULT_SPLIT_PERCENTAGE: f64 = 50.0;

/// Non-negative movement between two counter readings.
///
/// A reading lower than the previous one (device reset, miscount) yields 0
/// rather than negative revenue.
pub fn counter_difference(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Money represented by `difference` counter units at `split_percentage`.
///
/// `split_percentage` defaults to [`DEFAULT_SPLIT_PERCENTAGE`]. It is not
/// range-checked: callers must pass a value in `[0, 100]`.
pub fn compute_revenue(difference: u64, split_percentage: Option<f64>) -> f64 {
    let split = split_percentage.unwrap_or(DEFAULT_SPLIT_PERCENTAGE);
    difference as f64 * (split / 100.0)
}
