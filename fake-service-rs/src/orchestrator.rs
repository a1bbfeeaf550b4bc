//! # Request Orchestrator
//!
//! Runs one inbound request through the simulation:
//!
//! 1. **Gating** on readiness when configured
//! 2. **Injecting** rate limit and fault decisions
//! 3. **FanningOut** to the upstream targets through a worker pool
//! 4. **Delaying** until the sampled service time has elapsed
//! 5. **Assembling** the response tree
//!
//! Both transports share this path; they only differ in how the outcome is
//! written to the wire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{ForwardContext, HttpClient, HttpClientSettings, ReqwestClient};
use crate::dispatch::{GrpcClients, UpstreamDispatcher};
use crate::error::{Result, ServiceError};
use crate::fault_injector::{ErrorInjector, InjectorConfig};
use crate::load::{LoadGenerator, NoopRequestGenerator, RequestGenerator};
use crate::response::{ResponseTree, ServiceType};
use crate::timing::RequestDuration;
use crate::worker::{Dispatch, UpstreamWorkerPool};

/// Reports whether the service has finished starting
pub trait ReadinessGate: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Gate that is open from the start
#[derive(Debug, Default)]
pub struct AlwaysReady;

impl ReadinessGate for AlwaysReady {
    fn is_ready(&self) -> bool {
        true
    }
}

/// How a request finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Success,
    RejectedNotReady,
    RejectedByInjection,
    FailedUpstream,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::Success => "success",
            Terminal::RejectedNotReady => "not_ready",
            Terminal::RejectedByInjection => "injected",
            Terminal::FailedUpstream => "upstream_failed",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Terminal::Success)
    }
}

/// Finished request, ready for the transport to encode
#[derive(Debug, Clone)]
pub struct Handled {
    pub terminal: Terminal,
    pub response: ResponseTree,
}

/// An inbound request as the orchestrator sees it
#[derive(Debug, Clone)]
pub struct Inbound {
    pub transport: ServiceType,
    /// Request URI for HTTP, empty for gRPC
    pub uri: String,
    pub forward: Option<ForwardContext>,
}

impl Inbound {
    pub fn http(uri: impl Into<String>, forward: ForwardContext) -> Self {
        Self {
            transport: ServiceType::Http,
            uri: uri.into(),
            forward: Some(forward),
        }
    }

    pub fn grpc() -> Self {
        Self {
            transport: ServiceType::Grpc,
            uri: String::new(),
            forward: None,
        }
    }
}

/// Static behaviour of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub name: String,
    pub message: String,
    pub upstream_uris: Vec<String>,
    pub upstream_workers: usize,
    /// Reject requests while the readiness gate is closed
    pub wait_till_ready: bool,
    /// HTTP status for requests rejected as not ready
    pub not_ready_code: i32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: "Service".to_string(),
            message: "Hello World".to_string(),
            upstream_uris: Vec::new(),
            upstream_workers: 1,
            wait_till_ready: false,
            not_ready_code: 503,
        }
    }
}

fn success_code(transport: ServiceType) -> i32 {
    match transport {
        ServiceType::Http => 200,
        ServiceType::Grpc => tonic::Code::Ok as i32,
    }
}

fn internal_code(transport: ServiceType) -> i32 {
    match transport {
        ServiceType::Http => 500,
        ServiceType::Grpc => tonic::Code::Internal as i32,
    }
}

/// Builder for [`RequestOrchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    duration: Option<RequestDuration>,
    injector: Option<Arc<ErrorInjector>>,
    readiness: Option<Arc<dyn ReadinessGate>>,
    load: Option<LoadGenerator>,
    request_generator: Option<Arc<dyn RequestGenerator>>,
    http_client: Option<Arc<dyn HttpClient>>,
    grpc_clients: GrpcClients,
    dispatcher: Option<Arc<dyn Dispatch>>,
}

impl OrchestratorBuilder {
    pub fn duration(mut self, duration: RequestDuration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Shared so the live config endpoint can adjust the error rate
    pub fn injector(mut self, injector: Arc<ErrorInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn readiness(mut self, readiness: Arc<dyn ReadinessGate>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn load(mut self, load: LoadGenerator) -> Self {
        self.load = Some(load);
        self
    }

    pub fn request_generator(mut self, generator: Arc<dyn RequestGenerator>) -> Self {
        self.request_generator = Some(generator);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn grpc_clients(mut self, clients: GrpcClients) -> Self {
        self.grpc_clients = clients;
        self
    }

    /// Replace transport routing entirely, every upstream goes to `dispatcher`
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatch>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> Result<RequestOrchestrator> {
        let http_client: Arc<dyn HttpClient> = match self.http_client {
            Some(client) => client,
            None => Arc::new(ReqwestClient::new(&HttpClientSettings::default())?),
        };

        Ok(RequestOrchestrator {
            config: self.config,
            duration: self
                .duration
                .unwrap_or_else(|| RequestDuration::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, 0)),
            injector: self
                .injector
                .unwrap_or_else(|| Arc::new(ErrorInjector::new(InjectorConfig::default()))),
            readiness: self.readiness.unwrap_or_else(|| Arc::new(AlwaysReady)),
            load: self.load.unwrap_or_else(LoadGenerator::disabled),
            request_generator: self.request_generator.unwrap_or_else(|| Arc::new(NoopRequestGenerator)),
            http_client,
            grpc_clients: Arc::new(self.grpc_clients),
            dispatcher: self.dispatcher,
        })
    }
}

/// Handles every inbound request for one service instance
pub struct RequestOrchestrator {
    config: OrchestratorConfig,
    duration: RequestDuration,
    injector: Arc<ErrorInjector>,
    readiness: Arc<dyn ReadinessGate>,
    load: LoadGenerator,
    request_generator: Arc<dyn RequestGenerator>,
    http_client: Arc<dyn HttpClient>,
    grpc_clients: Arc<GrpcClients>,
    dispatcher: Option<Arc<dyn Dispatch>>,
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("config", &self.config)
            .field("duration", &self.duration)
            .field("injector", &self.injector)
            .field("load", &self.load)
            .field("grpc_clients", &self.grpc_clients.len())
            .finish()
    }
}

impl RequestOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            duration: None,
            injector: None,
            readiness: None,
            load: None,
            request_generator: None,
            http_client: None,
            grpc_clients: GrpcClients::new(),
            dispatcher: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn injector(&self) -> &Arc<ErrorInjector> {
        &self.injector
    }

    /// Handle a single inbound request
    pub async fn handle(&self, inbound: Inbound) -> Handled {
        let span = info_span!("handle_request", transport = %inbound.transport, uri = %inbound.uri);

        let started = Instant::now();
        let handled = self.run(inbound).instrument(span).await;

        metrics::counter!("fake_service.requests", 1, "outcome" => handled.terminal.as_str());
        metrics::histogram!("fake_service.request.duration", started.elapsed().as_secs_f64());

        handled
    }

    async fn run(&self, inbound: Inbound) -> Handled {
        let transport = inbound.transport;
        let mut response = ResponseTree::new(self.config.name.as_str(), transport, inbound.uri.as_str());

        // Gating
        if self.config.wait_till_ready && !self.readiness.is_ready() {
            let code = match transport {
                ServiceType::Http => self.config.not_ready_code,
                ServiceType::Grpc => tonic::Code::Unavailable as i32,
            };

            info!("Service not ready");
            response.set_error(code, ServiceError::NotReady.to_string());
            return Handled {
                terminal: Terminal::RejectedNotReady,
                response,
            };
        }

        info!("Handle inbound request");

        let _load = self.load.generate();
        let started = Instant::now();
        let started_at = Utc::now();

        // Injecting
        let decision = self.injector.evaluate().await;
        if let (Some(code), Some(err)) = (decision.code(), decision.error()) {
            response.set_error(code, err.to_string());
            return Handled {
                terminal: Terminal::RejectedByInjection,
                response,
            };
        }

        // FanningOut
        let upstream_error = self.fan_out(&inbound, &mut response).await;

        // Delaying
        let target = self.duration.sample();
        let remaining = target.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            debug!(duration = %humantime::format_duration(target), "Sleeping for");
            tokio::time::sleep(remaining).await;
        }

        // Assembling
        response.set_timing(started_at, Utc::now());

        match upstream_error {
            None => {
                response.code = success_code(transport);
                response.set_message(&self.config.message);
                info!(code = response.code, "Finished handling request");
                Handled {
                    terminal: Terminal::Success,
                    response,
                }
            }
            Some(err) => {
                response.set_error(internal_code(transport), err.to_string());
                warn!(error = %err, "Upstream request failed");
                Handled {
                    terminal: Terminal::FailedUpstream,
                    response,
                }
            }
        }
    }

    /// Call every upstream and record each fragment, returning the first error
    async fn fan_out(&self, inbound: &Inbound, response: &mut ResponseTree) -> Option<ServiceError> {
        if self.config.upstream_uris.is_empty() {
            return None;
        }

        let dispatcher = match &self.dispatcher {
            Some(dispatcher) => Arc::clone(dispatcher),
            None => Arc::new(
                UpstreamDispatcher::new(Arc::clone(&self.http_client), Arc::clone(&self.grpc_clients))
                    .with_body(self.request_generator.generate())
                    .with_forward(inbound.forward.clone()),
            ),
        };

        let mut pool = UpstreamWorkerPool::new(self.config.upstream_workers);
        let result = pool.run(&self.config.upstream_uris, dispatcher).await;

        response.append_upstreams(pool.into_results().into_iter().map(|c| (c.uri, c.response)));

        result.err().map(ServiceError::from)
    }
}
