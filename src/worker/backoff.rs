//! Jittered reconnect backoff (§4.3: "back off (20s default; jittered)").
//! The original has no reconnection policy at all; this is net new.

use std::time::Duration;

use rand::Rng;

/// Returns `base` with up to ±25% jitter applied, so many workers
/// reconnecting at once don't all hammer the database in lockstep.
pub fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    let spread = base_ms / 4;
    let jitter = rand::thread_rng().gen_range(0..=(2 * spread).max(1)) as i64 - spread as i64;
    let jittered_ms = (base_ms as i64 + jitter).max(0) as u64;
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(20);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(15_000));
            assert!(d <= Duration::from_millis(25_000));
        }
    }

    #[test]
    fn zero_base_stays_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
