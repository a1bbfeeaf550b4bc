//! Error handling for the fake service
//!
//! Every error here is per-request and ends up reported inside a response
//! tree; none of them are fatal to the process.

use thiserror::Error;

/// Result type for fake service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Main error type for the fake service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The readiness gate has not opened yet
    #[error("Service not ready")]
    NotReady,

    /// The token bucket rejected the request
    #[error("Service exceeded rate limit")]
    RateLimited,

    /// An immediate fault was injected
    #[error("Service error automatically injected")]
    InjectedFault,

    /// A delay fault was injected
    #[error("Service delay automatically injected")]
    InjectedDelay,

    /// An upstream dispatch failed
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// A payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration supplied at startup or through the config endpoint
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Listener or server transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ServiceError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        ServiceError::Configuration(message.into())
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        ServiceError::Transport(message.into())
    }
}

/// Failure of a single upstream call
///
/// Cloneable so the same error can be stored on the fragment and reported as
/// the fan-out error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// The request never produced a reply (connect failure, timeout)
    #[error("Error communicating with upstream service: {0}")]
    Communication(String),

    /// The upstream replied with something other than 200
    #[error("Error processing upstream request: {uri}, expected code 200, got {code}")]
    UnexpectedStatus { uri: String, code: i32 },

    /// The reply body could not be read
    #[error("Error reading response body: {0}")]
    ReadBody(String),

    /// The RPC upstream returned an error status
    #[error("{message}")]
    Rpc { code: i32, message: String },

    /// No RPC client was configured for the target
    #[error("No gRPC client configured for upstream: {0}")]
    NoClient(String),

    /// The target URI could not be turned into a request
    #[error("Invalid upstream target {uri}: {reason}")]
    InvalidTarget { uri: String, reason: String },
}
