//! config-rs/lib.rs
//! Shared configuration utilities for reading service settings from the environment.
//! Every reader falls back to the supplied default and logs a warning when a
//! variable is present but cannot be parsed.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Load a `.env` file from the working directory if one exists
pub fn load_dotenv() {
    if let Ok(path) = dotenv::dotenv() {
        log::info!("Loaded environment from {}", path.display());
    }
}

/// Read a raw environment variable, treating empty values as unset
fn read_var(var_name: &str) -> Option<String> {
    match env::var(var_name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Read a string variable
///
/// # Arguments
/// * `var_name` - Name of the environment variable (e.g., "MESSAGE")
/// * `default` - Value used when the variable is unset
pub fn env_string(var_name: &str, default: &str) -> String {
    env::var(var_name).unwrap_or_else(|_| default.to_string())
}

/// Read any `FromStr` value, falling back to `default` on a missing or invalid value
pub fn env_parse<T>(var_name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match read_var(var_name) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            log::warn!("Invalid value '{}' in {}, using default {}", raw, var_name, default);
            default
        }),
        None => default,
    }
}

/// Read an optional `FromStr` value, `None` when unset or invalid
pub fn env_parse_opt<T: FromStr>(var_name: &str) -> Option<T> {
    let raw = read_var(var_name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Invalid value '{}' in {}, ignoring", raw, var_name);
            None
        }
    }
}

/// Read a boolean flag; accepts true/false, yes/no, 1/0 and on/off
pub fn env_bool(var_name: &str, default: bool) -> bool {
    let Some(raw) = read_var(var_name) else {
        return default;
    };

    match parse_bool(&raw) {
        Some(value) => value,
        None => {
            log::warn!("Invalid boolean '{}' in {}, using default {}", raw, var_name, default);
            default
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Read a duration in humantime syntax ("100ms", "1s", "1m 30s")
pub fn env_duration(var_name: &str, default: Duration) -> Duration {
    let Some(raw) = read_var(var_name) else {
        return default;
    };

    parse_duration(&raw).unwrap_or_else(|| {
        log::warn!(
            "Invalid duration '{}' in {}, using default {}",
            raw,
            var_name,
            humantime::format_duration(default)
        );
        default
    })
}

/// Parse a duration string, accepting a bare `0` as zero
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(Duration::ZERO);
    }
    humantime::parse_duration(raw).ok()
}

/// Read a comma separated list, trimming entries and dropping blanks
pub fn env_list(var_name: &str) -> Vec<String> {
    tidy_list(&env_string(var_name, ""))
}

/// Split a comma separated string into trimmed, non-empty entries
pub fn tidy_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Create a SocketAddr for binding a listener
///
/// Accepts `host:port` as well as `http://host:port`; anything else falls back
/// to `default`.
pub fn get_bind_address(var_name: &str, default: SocketAddr) -> SocketAddr {
    let Some(addr_str) = read_var(var_name) else {
        return default;
    };

    let trimmed = addr_str
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://");

    trimmed.parse::<SocketAddr>().unwrap_or_else(|_| {
        log::warn!("Invalid address format '{}' in {}, using default {}", addr_str, var_name, default);
        default
    })
}
