use std::time::{Duration, Instant};

/// Wall-clock seconds since the unix epoch (sub-second precision).
pub fn current_time_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[inline]
pub fn dur_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[inline]
pub fn since_ms(start: Instant, at: Instant) -> f64 {
    dur_ms(at.saturating_duration_since(start))
}

/// `1 / rate` seconds; a non-positive rate maps to one second.
#[inline]
pub fn period(rate: f64) -> Duration {
    if rate > 0.0 {
        Duration::from_secs_f64(1.0 / rate)
    } else {
        Duration::from_secs(1)
    }
}

/// Synthetic prompt of roughly `token_len` tokens (one word ≈ 1.3 tokens).
pub fn synth_prompt(token_len: u32) -> String {
    let words = (token_len as f64 / 1.3) as usize;
    "test ".repeat(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_of_rate() {
        assert_eq!(period(2.0), Duration::from_millis(500));
        assert_eq!(period(0.0), Duration::from_secs(1));
    }

    #[test]
    fn synth_prompt_word_count() {
        assert_eq!(synth_prompt(13).split_whitespace().count(), 10);
        assert!(synth_prompt(1).is_empty());
    }

    #[test]
    fn since_ms_saturates() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(250);
        assert!((since_ms(t0, t1) - 250.0).abs() < 1e-6);
        assert_eq!(since_ms(t1, t0), 0.0);
    }
}
