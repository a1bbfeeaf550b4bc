//! # Fake Service
//!
//! A configurable stand-in microservice for load, chaos and service mesh
//! testing. Each request can be delayed along a latency distribution, fail
//! on a fixed schedule, be rate limited, and fan out to further upstream
//! services over HTTP or gRPC before replying with the whole call tree.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod fault_injector;
pub mod handlers;
pub mod load;
pub mod logging;
pub mod orchestrator;
pub mod response;
pub mod settings;
pub mod timing;
pub mod worker;

/// Generated RPC types for the `FakeService` contract
pub mod api {
    tonic::include_proto!("fake_service");
}

pub use error::{Result, ServiceError, UpstreamError};
pub use fault_injector::{Decision, ErrorInjector, InjectorConfig};
pub use orchestrator::{Handled, Inbound, OrchestratorConfig, ReadinessGate, RequestOrchestrator, Terminal};
pub use response::{ResponseTree, ServiceType};
pub use settings::ServiceSettings;
pub use timing::RequestDuration;
pub use worker::{Dispatch, Dispatched, UpstreamWorkerPool};
