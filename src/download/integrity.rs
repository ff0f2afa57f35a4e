//! Size-based integrity check for local copies.
//!
//! A local file is accepted when its size is within `max(1%, 1 MiB)` of the
//! expected size. Origins often report sizes that drift slightly from what a
//! transfer actually produces, so exact equality is not required.

/// Minimum absolute tolerance (1 MiB).
pub const MIN_TOLERANCE_BYTES: u64 = 1024 * 1024;

/// Relative tolerance, in percent of the expected size.
pub const TOLERANCE_PERCENT: u64 = 1;

/// Allowed deviation for a file expected to be `expected` bytes.
#[must_use]
pub fn tolerance_for(expected: u64) -> u64 {
    (expected / 100 * TOLERANCE_PERCENT).max(MIN_TOLERANCE_BYTES)
}

/// Returns `true` when `actual` is close enough to `expected`.
///
/// An empty file never passes, whatever the expected size.
///
/// ```
/// use media_relay::download::integrity::check_size;
///
/// assert!(check_size(1_000_000, 1_000_000));
/// assert!(check_size(99_500_000, 100_000_000));
/// assert!(!check_size(400_000, 10_000_000));
/// ```
#[must_use]
pub fn check_size(actual: u64, expected: u64) -> bool {
    if actual == 0 {
        return false;
    }
    actual.abs_diff(expected) <= tolerance_for(expected)
}
