//! Service settings loaded from the environment

use std::net::SocketAddr;
use std::time::Duration;

use config_rs::{env_bool, env_duration, env_list, env_parse, env_parse_opt, env_string, get_bind_address};

use crate::client::HttpClientSettings;
use crate::fault_injector::{InjectorConfig, HTTP_ERROR};
use crate::handlers::CorsSettings;
use crate::load::LoadConfig;
use crate::logging::LoggingSettings;
use crate::orchestrator::OrchestratorConfig;

/// Everything the service reads at startup; immutable afterwards
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub listen_addr: SocketAddr,
    pub grpc_listen_addr: SocketAddr,

    pub name: String,
    pub message: String,
    pub upstream_uris: Vec<String>,
    pub upstream_workers: usize,

    pub upstream_request_body: String,
    pub upstream_request_size: usize,
    pub upstream_request_variance: u32,
    pub http_client: HttpClientSettings,

    pub timing_50_percentile: Duration,
    pub timing_90_percentile: Duration,
    pub timing_99_percentile: Duration,
    pub timing_variance: i64,

    pub injector: InjectorConfig,
    pub load: LoadConfig,

    pub health_check_response_code: i32,
    pub ready_check_success_code: i32,
    pub ready_check_failure_code: i32,
    pub ready_check_delay: Duration,
    pub ready_check_wait_till_ready: bool,

    pub cors: CorsSettings,
    pub logging: LoggingSettings,
    pub seed: Option<u64>,
}

impl ServiceSettings {
    pub fn from_env() -> Self {
        let cors_defaults = CorsSettings::default();

        let allowed_origins = env_list("ALLOWED_ORIGINS");
        let allowed_headers = env_list("ALLOWED_HEADERS");

        Self {
            listen_addr: get_bind_address("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 9090))),
            grpc_listen_addr: get_bind_address("GRPC_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 9091))),

            name: env_string("NAME", "Service"),
            message: env_string("MESSAGE", "Hello World"),
            upstream_uris: env_list("UPSTREAM_URIS"),
            upstream_workers: env_parse("UPSTREAM_WORKERS", 1usize).max(1),

            upstream_request_body: env_string("UPSTREAM_REQUEST_BODY", ""),
            upstream_request_size: env_parse("UPSTREAM_REQUEST_SIZE", 0usize),
            upstream_request_variance: env_parse("UPSTREAM_REQUEST_VARIANCE", 0u32),
            http_client: HttpClientSettings {
                keep_alives: env_bool("HTTP_CLIENT_KEEP_ALIVES", false),
                append_request: env_bool("HTTP_CLIENT_APPEND_REQUEST", true),
                timeout: env_duration("HTTP_CLIENT_REQUEST_TIMEOUT", Duration::from_secs(30)),
                allow_insecure: env_bool("UPSTREAM_ALLOW_INSECURE", false),
            },

            timing_50_percentile: env_duration("TIMING_50_PERCENTILE", Duration::ZERO),
            timing_90_percentile: env_duration("TIMING_90_PERCENTILE", Duration::ZERO),
            timing_99_percentile: env_duration("TIMING_99_PERCENTILE", Duration::ZERO),
            timing_variance: env_parse("TIMING_VARIANCE", 0i64),

            injector: InjectorConfig {
                error_percentage: unit_fraction(env_parse("ERROR_RATE", 0.0f64)),
                error_code: env_parse("ERROR_CODE", 500i32),
                error_type: env_string("ERROR_TYPE", HTTP_ERROR),
                error_delay: env_duration("ERROR_DELAY", Duration::ZERO),
                rate_limit_rps: non_negative(env_parse("RATE_LIMIT", 0.0f64)),
                rate_limit_burst: env_parse("RATE_LIMIT_BURST", 0u32),
                rate_limit_code: env_parse("RATE_LIMIT_CODE", 503i32),
            },
            load: LoadConfig {
                cpu_cores: env_parse("LOAD_CPU_CORES", -1i64),
                cpu_percentage: env_parse("LOAD_CPU_PERCENTAGE", 0.0f64),
                cpu_allocated: env_parse("LOAD_CPU_ALLOCATED", 0i64),
                cpu_clock_speed: env_parse("LOAD_CPU_CLOCK_SPEED", 1000i64),
                memory_bytes: env_parse("LOAD_MEMORY_PER_REQUEST", 0usize),
                memory_variance: env_parse("LOAD_MEMORY_VARIANCE", 0u32),
            },

            health_check_response_code: env_parse("HEALTH_CHECK_RESPONSE_CODE", 200i32),
            ready_check_success_code: env_parse("READY_CHECK_RESPONSE_SUCCESS_CODE", 200i32),
            ready_check_failure_code: env_parse("READY_CHECK_RESPONSE_FAILURE_CODE", 503i32),
            ready_check_delay: env_duration("READY_CHECK_RESPONSE_DELAY", Duration::ZERO),
            ready_check_wait_till_ready: env_bool("READY_CHECK_ROOT_PATH_WAIT_TILL_READY", false),

            cors: CorsSettings {
                allowed_origins: if allowed_origins.is_empty() {
                    cors_defaults.allowed_origins
                } else {
                    allowed_origins
                },
                allowed_headers: if allowed_headers.is_empty() {
                    cors_defaults.allowed_headers
                } else {
                    allowed_headers
                },
                allow_credentials: env_bool("ALLOW_CREDENTIALS", false),
            },
            logging: LoggingSettings::from_env(),
            seed: env_parse_opt("RAND_SEED"),
        }
    }

    /// Orchestrator settings derived from these settings
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            name: self.name.clone(),
            message: self.message.clone(),
            upstream_uris: self.upstream_uris.clone(),
            upstream_workers: self.upstream_workers,
            wait_till_ready: self.ready_check_wait_till_ready,
            not_ready_code: self.ready_check_failure_code,
        }
    }

    /// Upstreams called over gRPC
    pub fn grpc_upstreams(&self) -> impl Iterator<Item = &String> {
        self.upstream_uris
            .iter()
            .filter(|uri| !crate::dispatch::is_http_target(uri))
    }
}

/// Clamp into `[0, 1]`, non-finite values count as zero
fn unit_fraction(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
