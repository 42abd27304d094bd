//! Exponential backoff with jitter, shared by the broker's retry ladder and
//! the outbox dispatcher (§4.2, §4.3).

use rand::Rng;

/// `min(base * 2^attempt, cap) +/- jitter_fraction`, per §4.3's
/// `backoff(attempt_count)` and §4.2's "cap 5 minutes, jitter +/-25%".
pub fn backoff_ms(attempt: u32, base_ms: u64, cap_ms: u64, jitter_fraction: f64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(32));
    let capped = exp.min(cap_ms);
    let jitter_span = (capped as f64 * jitter_fraction) as i64;
    if jitter_span == 0 {
        return capped;
    }
    let mut rng = rand::thread_rng();
    let delta = rng.gen_range(-jitter_span..=jitter_span);
    (capped as i64 + delta).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..10 {
            let ms = backoff_ms(attempt, 1000, 60_000, 0.25);
            assert!(ms <= 60_000 + (60_000 / 4));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_cap() {
        let low = backoff_ms(0, 1000, 60_000, 0.0);
        let high = backoff_ms(3, 1000, 60_000, 0.0);
        assert!(high > low);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        assert_eq!(backoff_ms(2, 1000, 60_000, 0.0), 4000);
    }
}
