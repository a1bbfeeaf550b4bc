//! # Error Injection
//!
//! Decides per request whether to short-circuit with a rate limit error or an
//! injected fault. Injection is periodic on the request counter rather than
//! sampled, so a given error rate always hits the same request positions.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::ServiceError;

/// Error type string selecting an immediate fault
pub const HTTP_ERROR: &str = "http_error";

/// How an injected fault behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fail immediately
    HttpError,
    /// Pause for the configured delay, then fail
    Delay(Duration),
}

/// Outcome of consulting the injector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Handle the request normally
    Proceed,
    /// The token bucket had no capacity
    RateLimited { code: i32 },
    /// A fault was injected
    Injected { code: i32, kind: FaultKind },
}

impl Decision {
    /// The error this decision reports, if any
    pub fn error(&self) -> Option<ServiceError> {
        match self {
            Decision::Proceed => None,
            Decision::RateLimited { .. } => Some(ServiceError::RateLimited),
            Decision::Injected { kind: FaultKind::HttpError, .. } => Some(ServiceError::InjectedFault),
            Decision::Injected { kind: FaultKind::Delay(_), .. } => Some(ServiceError::InjectedDelay),
        }
    }

    /// Status code to report, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Decision::Proceed => None,
            Decision::RateLimited { code } | Decision::Injected { code, .. } => Some(*code),
        }
    }
}

/// Static configuration for an [`ErrorInjector`]
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Fraction of requests that fail, in `[0, 1]`
    pub error_percentage: f64,
    pub error_code: i32,
    /// `http_error`, anything else is treated as a delay
    pub error_type: String,
    pub error_delay: Duration,
    /// Requests per second, zero disables rate limiting
    pub rate_limit_rps: f64,
    /// Bucket size, zero means "same as the rate"
    pub rate_limit_burst: u32,
    pub rate_limit_code: i32,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            error_percentage: 0.0,
            error_code: 500,
            error_type: HTTP_ERROR.to_string(),
            error_delay: Duration::ZERO,
            rate_limit_rps: 0.0,
            rate_limit_burst: 0,
            rate_limit_code: 503,
        }
    }
}

/// Injects errors and rate limiting into a service
///
/// Shared by every request the process handles.
pub struct ErrorInjector {
    error_code: i32,
    fault: FaultKind,
    rate_limit_rps: f64,
    rate_limit_burst: u32,
    rate_limit_code: i32,
    /// f64 bits, writable at runtime through the config endpoint
    error_percentage: AtomicU64,
    request_count: AtomicI64,
    limiter: OnceCell<Option<DefaultDirectRateLimiter>>,
}

impl std::fmt::Debug for ErrorInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorInjector")
            .field("error_percentage", &self.error_percentage())
            .field("error_code", &self.error_code)
            .field("fault", &self.fault)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("request_count", &self.request_count())
            .finish()
    }
}

impl ErrorInjector {
    pub fn new(config: InjectorConfig) -> Self {
        let fault = if config.error_type == HTTP_ERROR {
            FaultKind::HttpError
        } else {
            FaultKind::Delay(config.error_delay)
        };

        Self {
            error_code: config.error_code,
            fault,
            rate_limit_rps: config.rate_limit_rps,
            rate_limit_burst: config.rate_limit_burst,
            rate_limit_code: config.rate_limit_code,
            error_percentage: AtomicU64::new(config.error_percentage.to_bits()),
            request_count: AtomicI64::new(0),
            limiter: OnceCell::new(),
        }
    }

    /// Set the error rate, a floating point number between 0 and 1
    pub fn set_error_percentage(&self, rate: f64) {
        info!(error_percentage = rate, "Updating error percentage");
        self.error_percentage.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn error_percentage(&self) -> f64 {
        f64::from_bits(self.error_percentage.load(Ordering::Relaxed))
    }

    /// Number of requests evaluated so far
    pub fn request_count(&self) -> i64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Evaluate the next request
    ///
    /// Delay faults sleep here before returning.
    pub async fn evaluate(&self) -> Decision {
        let count = self.next_count();

        if let Some(limiter) = self.limiter() {
            if limiter.check().is_err() {
                info!(request_count = count, "Rate limiting service");
                return Decision::RateLimited {
                    code: self.rate_limit_code,
                };
            }
        }

        let percentage = self.error_percentage();
        if !percentage.is_finite() || percentage <= 0.0 {
            return Decision::Proceed;
        }

        let period = ((1.0 / percentage).round() as i64).max(1);
        if count % period != 0 {
            return Decision::Proceed;
        }

        info!(
            request_count = count,
            error_percentage = percentage,
            error_type = ?self.fault,
            "Injecting error"
        );

        if let FaultKind::Delay(delay) = self.fault {
            info!(duration = %humantime::format_duration(delay), "Delaying service execution");
            tokio::time::sleep(delay).await;
        }

        Decision::Injected {
            code: self.error_code,
            kind: self.fault,
        }
    }

    /// Increment the request counter, wrapping to 1 instead of overflowing
    fn next_count(&self) -> i64 {
        let previous = self
            .request_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(if c == i64::MAX { 1 } else { c + 1 })
            })
            .unwrap_or_default();

        if previous == i64::MAX {
            1
        } else {
            previous + 1
        }
    }

    /// The token bucket, built on first use when a rate is configured
    fn limiter(&self) -> Option<&DefaultDirectRateLimiter> {
        self.limiter
            .get_or_init(|| {
                if !self.rate_limit_rps.is_finite() || self.rate_limit_rps <= 0.0 {
                    return None;
                }

                let burst = if self.rate_limit_burst == 0 {
                    // with no burst limit the bucket holds one second of requests
                    self.rate_limit_rps as u32
                } else {
                    self.rate_limit_burst
                };
                let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);

                let quota = Duration::try_from_secs_f64(1.0 / self.rate_limit_rps)
                    .ok()
                    .and_then(Quota::with_period)
                    .map(|quota| quota.allow_burst(burst));

                match quota {
                    Some(quota) => {
                        debug!(rps = self.rate_limit_rps, burst = burst.get(), "Created rate limiter");
                        Some(RateLimiter::direct(quota))
                    }
                    None => {
                        warn!(rps = self.rate_limit_rps, "Rate limit cannot be enforced, disabling");
                        None
                    }
                }
            })
            .as_ref()
    }

    #[cfg(test)]
    fn set_request_count(&self, count: i64) {
        self.request_count.store(count, Ordering::SeqCst);
    }
}
