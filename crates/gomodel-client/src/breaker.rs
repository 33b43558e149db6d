use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Three-state health gate in front of one upstream. Contention is low, so a
/// plain mutex around the state is enough.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Whether a call may proceed. An elapsed Open period flips to HalfOpen
    /// and admits the probe.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            State::Closed { .. } | State::HalfOpen { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= self.config.timeout {
                    *state = State::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Closed { failures } => *failures = 0,
            State::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    *state = State::Closed { failures: 0 };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn on_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            // Any failure while probing re-opens and resets the timer.
            State::HalfOpen { .. } => {
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {
                *state = State::Open {
                    since: Instant::now(),
                };
            }
        }
    }

    pub fn current_state(&self) -> CircuitState {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout,
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(Duration::from_secs(60));
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker(Duration::from_secs(60));
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let cb = breaker(Duration::from_millis(1));
        for _ in 0..3 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.try_acquire());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(Duration::from_millis(1));
        for _ in 0..3 {
            cb.on_failure();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.try_acquire());
        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }
}
