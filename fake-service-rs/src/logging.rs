//! # Structured Logging
//!
//! Subscriber setup for the service. Output goes to stdout, stderr or a
//! daily rolling file, formatted as text or JSON.

use std::str::FromStr;

use config_rs::env_string;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::{Result, ServiceError};

/// Log line encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ServiceError::configuration(format!("Unknown log format '{}'", other))),
        }
    }
}

/// Where log lines are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Path of the log file; rotated daily
    File(String),
}

impl FromStr for LogOutput {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "stdout" => Ok(LogOutput::Stdout),
            "stderr" => Ok(LogOutput::Stderr),
            path => Ok(LogOutput::File(path.to_string())),
        }
    }
}

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            output: LogOutput::Stdout,
        }
    }
}

impl LoggingSettings {
    pub fn from_env() -> Self {
        let format = env_string("LOG_FORMAT", "text");
        let format = format.parse().unwrap_or_else(|e| {
            log::warn!("{}, using text", e);
            LogFormat::Text
        });

        Self {
            level: env_string("LOG_LEVEL", "info"),
            format,
            output: env_string("LOG_OUTPUT", "stdout").parse().unwrap_or(LogOutput::Stdout),
        }
    }
}

/// Initialise the global subscriber
///
/// The returned guard must be held for the life of the process; dropping it
/// flushes and stops the writer thread.
pub fn init_logging(settings: &LoggingSettings) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| ServiceError::configuration(format!("Invalid log level '{}': {}", settings.level, e)))?;

    let (writer, guard) = match &settings.output {
        LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogOutput::File(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "fake-service.log".to_string());

            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file))
        }
    };

    let ansi = matches!(settings.output, LogOutput::Stdout | LogOutput::Stderr);
    let subscriber = Registry::default().with(filter);

    // try_init also bridges `log` records from dependencies into tracing
    let result = match settings.format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Text => subscriber
            .with(fmt::layer().with_target(true).with_ansi(ansi).with_writer(writer))
            .try_init(),
    };

    result.map_err(|e| ServiceError::configuration(format!("Failed to set global subscriber: {}", e)))?;

    tracing::info!(level = %settings.level, format = ?settings.format, "Structured logging initialized");

    Ok(guard)
}
