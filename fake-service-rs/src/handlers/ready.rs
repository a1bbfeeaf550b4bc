//! Readiness gate and the `/ready` endpoint

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use tracing::info;

use super::{status_code, AppState};
use crate::orchestrator::ReadinessGate;

pub const OK_MESSAGE: &str = "OK";
pub const STARTING_MESSAGE: &str = "Starting Process";

/// Opens once the configured startup delay has elapsed and stays open
#[derive(Debug)]
pub struct Readiness {
    started: Instant,
    delay: Duration,
    ready: AtomicBool,
    success_code: i32,
    failure_code: i32,
}

impl Readiness {
    pub fn new(delay: Duration, success_code: i32, failure_code: i32) -> Self {
        Self {
            started: Instant::now(),
            delay,
            ready: AtomicBool::new(delay.is_zero()),
            success_code,
            failure_code,
        }
    }

    /// Status code and message reported by `/ready`
    pub fn status(&self) -> (i32, &'static str) {
        if self.is_ready() {
            (self.success_code, OK_MESSAGE)
        } else {
            (self.failure_code, STARTING_MESSAGE)
        }
    }

    pub fn failure_code(&self) -> i32 {
        self.failure_code
    }
}

impl ReadinessGate for Readiness {
    fn is_ready(&self) -> bool {
        if self.ready.load(Ordering::Acquire) {
            return true;
        }

        if self.started.elapsed() >= self.delay {
            if !self.ready.swap(true, Ordering::AcqRel) {
                info!(delay = %humantime::format_duration(self.delay), "Service ready");
            }
            return true;
        }

        false
    }
}

pub async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (code, message) = state.readiness.status();
    info!(code, "Handling ready request");
    (status_code(code), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_delay_is_ready_immediately() {
        let readiness = Readiness::new(Duration::ZERO, 200, 503);
        assert!(readiness.is_ready());
        assert_eq!(readiness.status(), (200, OK_MESSAGE));
    }

    #[tokio::test]
    async fn test_opens_after_delay_and_stays_open() {
        let readiness = Readiness::new(Duration::from_millis(50), 200, 503);
        assert!(!readiness.is_ready());
        assert_eq!(readiness.status(), (503, STARTING_MESSAGE));

        tokio::time::sleep(Duration::from_millis(60)).await;
        for _ in 0..3 {
            assert!(readiness.is_ready());
        }
        assert_eq!(readiness.status(), (200, OK_MESSAGE));
    }
}
