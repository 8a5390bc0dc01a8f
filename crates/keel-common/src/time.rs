//! ---
//! keel_section: "01-core-supervision"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Duration helpers shared by the supervision loops."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use std::time::Duration;

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `base × 2^exponent`, clamped to `cap`. Large exponents saturate instead of overflowing.
pub fn exponential_delay(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}
