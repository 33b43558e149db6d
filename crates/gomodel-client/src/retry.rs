use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry attempt `attempt` (1-based):
    /// `min(initial * factor^(attempt-1), max) * (1 + U(-jitter, +jitter))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let scaled = if jitter > 0.0 {
            let factor: f64 = rand::rng().random_range(-jitter..=jitter);
            capped * (1.0 + factor)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Transient upstream statuses worth another attempt.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        // factor^9 = 512s, capped at 30s.
        assert_eq!(config.backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = config.backoff_delay(2).as_secs_f64();
            assert!((1.8..=2.2).contains(&delay), "delay out of band: {delay}");
        }
    }

    #[test]
    fn retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [200, 201, 400, 401, 403, 404, 422, 501] {
            assert!(!is_retryable_status(status));
        }
    }
}
