use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 2,
            max_seconds: 5 * 60,
            jitter_pct: 0.20,
        }
    }
}

/// Delay before attempt `attempt_no + 1`, in seconds.
///
/// base * 2^(attempt_no-1), capped at max_seconds, with jitter in
/// [-jitter_pct, +jitter_pct] so retries from many jobs spread out.
pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let attempt_no = attempt_no.max(1) as u32;

    let exp = attempt_no.saturating_sub(1);

    // 2^exp with overflow protection; the cap absorbs the saturated case.
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);

    let mut delay = cfg.base_seconds.saturating_mul(pow2);

    if delay > cfg.max_seconds {
        delay = cfg.max_seconds;
    }

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round() as i64;
    jittered.clamp(0, cfg.max_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn cfg() -> RetryConfig {
        RetryConfig {
            base_seconds: 2,
            max_seconds: 60,
            jitter_pct: 0.0,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(next_delay_seconds(1, &cfg(), &mut rng), 2);
        assert_eq!(next_delay_seconds(2, &cfg(), &mut rng), 4);
        assert_eq!(next_delay_seconds(3, &cfg(), &mut rng), 8);
    }

    #[test]
    fn delay_is_capped() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(next_delay_seconds(10, &cfg(), &mut rng), 60);
        assert_eq!(next_delay_seconds(200, &cfg(), &mut rng), 60);
    }

    #[test]
    fn jitter_stays_within_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = RetryConfig {
            base_seconds: 2,
            max_seconds: 30,
            jitter_pct: 0.5,
        };
        for attempt in 1..12 {
            let d = next_delay_seconds(attempt, &cfg, &mut rng);
            assert!((0..=30).contains(&d), "delay {d} out of range");
        }
    }
}
