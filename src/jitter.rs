//! Duration jitter for polling loops.
//!
//! Every poll sleep in this crate goes through [`jitter`] so that a fleet of
//! hosts does not synchronize its polls against the upstream.

use std::time::Duration;

use rand::Rng;

/// Randomizes `duration` by up to `coefficient` in either direction.
///
/// `coefficient` is clamped to `[0, 1]`. The result is uniformly distributed
/// in `[duration - duration * c, duration + duration * c]` and never
/// negative. A coefficient of zero returns the duration unchanged.
pub fn jitter(duration: Duration, coefficient: f64) -> Duration {
    let coefficient = coefficient.clamp(0.0, 1.0);
    if coefficient == 0.0 || duration.is_zero() {
        return duration;
    }
    let base = duration.as_secs_f64();
    let spread = base * coefficient;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((base + offset).max(0.0))
}
