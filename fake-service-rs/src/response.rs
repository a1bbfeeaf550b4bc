//! # Response Tree
//!
//! The document returned by every request: the handling node's own outcome
//! plus one nested tree per upstream call, keyed by the upstream's dial URI.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Result;

/// Timestamp layout used for `start_time` and `end_time`
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Transport a response was produced over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "gRPC")]
    Grpc,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Http => write!(f, "HTTP"),
            ServiceType::Grpc => write!(f, "gRPC"),
        }
    }
}

/// Recursive response document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseTree {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// URI this node was called with
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cookies: HashMap<String, String>,
    /// Opaque payload, passed through verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub upstream_calls: HashMap<String, ResponseTree>,
    #[serde(default)]
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseTree {
    /// Start a tree for a request handled by this node
    pub fn new(name: impl Into<String>, service_type: ServiceType, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            service_type: Some(service_type),
            ip_addresses: local_ip_addresses().to_vec(),
            ..Self::default()
        }
    }

    /// Serialize to indented JSON with a trailing newline
    pub fn to_json(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    /// Parse a tree from raw bytes
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Record an error; the body is always cleared alongside
    pub fn set_error(&mut self, code: i32, error: impl Into<String>) {
        self.code = code;
        self.error = Some(error.into());
        self.body = None;
    }

    /// Set the body from the configured message
    ///
    /// Messages starting with `{` are embedded as JSON, anything else as a
    /// JSON string. Invalid JSON objects degrade to a string.
    pub fn set_message(&mut self, message: &str) {
        let raw = if message.trim_start().starts_with('{') {
            RawValue::from_string(message.to_string()).ok()
        } else {
            None
        };

        self.body = raw.or_else(|| serde_json::to_string(message).ok().and_then(|s| RawValue::from_string(s).ok()));
    }

    /// Stamp the matched timing triple
    ///
    /// Both stamps are truncated to the printed precision first so that
    /// `end - start` equals the recorded duration exactly.
    pub fn set_timing(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let start = start.duration_trunc(chrono::Duration::microseconds(1)).unwrap_or(start);
        let end = end.duration_trunc(chrono::Duration::microseconds(1)).unwrap_or(end);
        let elapsed = (end - start).to_std().unwrap_or(Duration::ZERO);

        self.start_time = Some(start.format(TIME_FORMAT).to_string());
        self.end_time = Some(end.format(TIME_FORMAT).to_string());
        self.duration = Some(humantime::format_duration(elapsed).to_string());
    }

    /// Parsed duration, when the timing triple is present
    pub fn elapsed(&self) -> Option<Duration> {
        self.duration.as_deref().and_then(config_rs::parse_duration)
    }

    /// Body as text, if one is set
    pub fn body_str(&self) -> Option<&str> {
        self.body.as_deref().map(RawValue::get)
    }

    /// Append an upstream response; a repeated URI replaces the earlier entry
    pub fn append_upstream(&mut self, uri: impl Into<String>, response: ResponseTree) {
        self.upstream_calls.insert(uri.into(), response);
    }

    /// Append multiple upstream responses
    pub fn append_upstreams(&mut self, responses: impl IntoIterator<Item = (String, ResponseTree)>) {
        for (uri, response) in responses {
            self.append_upstream(uri, response);
        }
    }
}

// Discovered once; addresses are not expected to change for the life of the process
static IP_ADDRESSES: Lazy<Vec<String>> = Lazy::new(discover_ip_addresses);

/// Non-loopback IPv4 addresses of this node
pub fn local_ip_addresses() -> &'static [String] {
    &IP_ADDRESSES
}

fn discover_ip_addresses() -> Vec<String> {
    // connecting a UDP socket selects the outbound interface without sending anything
    let local = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect("192.0.2.1:9").map(|_| socket))
        .and_then(|socket| socket.local_addr());

    match local {
        Ok(addr) if addr.ip().is_ipv4() && !addr.ip().is_loopback() && !addr.ip().is_multicast() => {
            vec![addr.ip().to_string()]
        }
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::debug!(error = %e, "Unable to determine local IP address");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> ResponseTree {
        let mut upstream = ResponseTree::new("payments", ServiceType::Grpc, "grpc://payments:9091");
        upstream.code = 0;
        upstream.set_message("OK");

        let mut tree = ResponseTree::new("web", ServiceType::Http, "/checkout?id=7");
        tree.headers.insert("Content-Type".to_string(), "application/json".to_string());
        tree.cookies.insert("session".to_string(), "abc".to_string());
        tree.set_message(r#"{"items": [1, 2, 3]}"#);
        tree.set_timing(Utc::now(), Utc::now() + chrono::Duration::milliseconds(15));
        tree.code = 200;
        tree.append_upstream("grpc://payments:9091", upstream);
        tree
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let tree = populated();
        let json = tree.to_json().unwrap();
        let back = ResponseTree::from_json(json.as_bytes()).unwrap();

        assert_eq!(back.name, "web");
        assert_eq!(back.uri, "/checkout?id=7");
        assert_eq!(back.service_type, Some(ServiceType::Http));
        assert_eq!(back.start_time, tree.start_time);
        assert_eq!(back.end_time, tree.end_time);
        assert_eq!(back.duration, tree.duration);
        assert_eq!(back.headers, tree.headers);
        assert_eq!(back.cookies, tree.cookies);
        assert_eq!(back.body_str(), Some(r#"{"items": [1, 2, 3]}"#));
        assert_eq!(back.code, 200);

        let upstream = &back.upstream_calls["grpc://payments:9091"];
        assert_eq!(upstream.name, "payments");
        assert_eq!(upstream.service_type, Some(ServiceType::Grpc));
        assert_eq!(upstream.body_str(), Some(r#""OK""#));
    }

    #[test]
    fn test_upstream_calls_serialize_as_object_keyed_by_uri() {
        let value: serde_json::Value = serde_json::from_str(&populated().to_json().unwrap()).unwrap();

        assert!(value["upstream_calls"].is_object());
        assert_eq!(value["upstream_calls"]["grpc://payments:9091"]["name"], "payments");
        assert_eq!(value["type"], "HTTP");
    }

    #[test]
    fn test_code_always_serialized_empty_fields_omitted() {
        let json = ResponseTree::default().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value, serde_json::json!({ "code": 0 }));
    }

    #[test]
    fn test_set_error_clears_body() {
        let mut tree = populated();
        tree.set_error(500, "Service error automatically injected");

        assert!(tree.body.is_none());
        assert_eq!(tree.code, 500);
        assert_eq!(tree.error.as_deref(), Some("Service error automatically injected"));
    }

    #[test]
    fn test_message_encoding() {
        let mut tree = ResponseTree::default();

        tree.set_message("hello world");
        assert_eq!(tree.body_str(), Some(r#""hello world""#));

        tree.set_message(r#"say "hi""#);
        assert_eq!(tree.body_str(), Some(r#""say \"hi\"""#));

        tree.set_message(r#"{"ok":true}"#);
        assert_eq!(tree.body_str(), Some(r#"{"ok":true}"#));

        // not valid JSON, so it is quoted
        tree.set_message("{broken");
        assert_eq!(tree.body_str(), Some(r#""{broken""#));
    }

    #[test]
    fn test_timing_triple_is_consistent() {
        let start = Utc::now();
        let end = start + chrono::Duration::nanoseconds(12_345_678_901);

        let mut tree = ResponseTree::default();
        tree.set_timing(start, end);

        let parse = |s: &Option<String>| {
            chrono::NaiveDateTime::parse_from_str(s.as_deref().unwrap(), TIME_FORMAT).unwrap()
        };
        let printed = (parse(&tree.end_time) - parse(&tree.start_time)).to_std().unwrap();

        assert_eq!(tree.elapsed(), Some(printed));
    }

    #[test]
    fn test_repeated_uri_last_write_wins() {
        let mut tree = ResponseTree::default();
        let mut first = ResponseTree::default();
        first.code = 500;
        let mut second = ResponseTree::default();
        second.code = 200;

        tree.append_upstreams(vec![
            ("http://a".to_string(), first),
            ("http://a".to_string(), second),
        ]);

        assert_eq!(tree.upstream_calls.len(), 1);
        assert_eq!(tree.upstream_calls["http://a"].code, 200);
    }

    #[test]
    fn test_ip_addresses_are_cached() {
        let first = local_ip_addresses().as_ptr();
        let second = local_ip_addresses().as_ptr();
        assert_eq!(first, second);
    }
}
