use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_FAIL_MAX: u32 = 3;
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding the GPU OCR service. One instance is shared by
/// every task in the process; all state sits behind a single mutex.
///
/// closed -> open after `fail_max` consecutive failures; open -> half-open
/// once `reset_timeout` elapses, admitting a single probe; half-open ->
/// closed on probe success, -> open on probe failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    fail_max: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            fail_max,
            reset_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner);
        inner.state
    }

    /// Ask permission for one call. Returns `false` while the breaker is open
    /// or while a half-open probe is already in flight.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            tracing::info!(
                from = inner.state.as_str(),
                to = "closed",
                "ocr circuit breaker closed"
            );
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;
        let should_open = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.fail_max;
        if should_open && inner.state != BreakerState::Open {
            tracing::warn!(
                from = inner.state.as_str(),
                to = "open",
                failures = inner.consecutive_failures,
                "ocr circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.reset_timeout {
                tracing::info!(from = "open", to = "half_open", "ocr circuit breaker half-open");
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = false;
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAIL_MAX, DEFAULT_RESET_TIMEOUT)
    }
}
