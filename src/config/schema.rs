//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Path prefixes served by the relay.
    pub locations: Vec<LocationConfig>,

    /// Search engines the relay can talk to.
    pub upstream: UpstreamConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Buffer sizing.
    pub buffers: BufferConfig,

    /// Response header policy.
    pub headers: HeaderConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            locations: vec![LocationConfig {
                path_prefix: "/".to_string(),
                search_engine: None,
            }],
            upstream: UpstreamConfig::default(),
            timeouts: TimeoutConfig::default(),
            buffers: BufferConfig::default(),
            headers: HeaderConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Look up an engine by name (case-insensitive).
    pub fn engine(&self, name: &str) -> Option<&EngineConfig> {
        self.upstream
            .engines
            .iter()
            .find(|engine| engine.name.eq_ignore_ascii_case(name))
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// A path prefix handled by the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationConfig {
    /// Path prefix to match (longest prefix wins).
    pub path_prefix: String,

    /// Engine to relay to; falls back to `upstream.default_engine`.
    #[serde(default)]
    pub search_engine: Option<String>,
}

/// Upstream engine table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Engine used by locations that do not name one.
    pub default_engine: String,

    /// Known engines.
    pub engines: Vec<EngineConfig>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_engine: "bing".to_string(),
            engines: vec![
                EngineConfig {
                    name: "bing".to_string(),
                    host: "cn.bing.com".to_string(),
                    port: 80,
                    target: "/search?q={query}".to_string(),
                },
                EngineConfig {
                    name: "baidu".to_string(),
                    host: "www.baidu.com".to_string(),
                    port: 80,
                    target: "/s?wd={query}".to_string(),
                },
            ],
        }
    }
}

/// One backend request template.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Name referenced by `search_engine`.
    pub name: String,

    /// Backend host name, resolved per request.
    pub host: String,

    /// Backend port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request target; `{query}` is replaced by the client's query string.
    #[serde(default = "default_target")]
    pub target: String,
}

fn default_port() -> u16 {
    80
}

fn default_target() -> String {
    "/".to_string()
}

/// Per-connection deadlines for backend exchanges.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment (and name resolution) timeout in milliseconds.
    pub connect_ms: u64,

    /// Request write timeout in milliseconds.
    pub send_ms: u64,

    /// Maximum gap between two reads from the backend in milliseconds.
    pub read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 60_000,
            send_ms: 60_000,
            read_ms: 60_000,
        }
    }
}

/// Buffer sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Largest accepted response head, also the read size per socket read.
    pub buffer_size: usize,

    /// Largest inbound request body drained before responding.
    pub max_discard_body: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            max_discard_body: 64 * 1024,
        }
    }
}

/// Response header policy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HeaderConfig {
    /// Extra header names never forwarded to clients.
    pub hide: Vec<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,

    /// Expose Prometheus metrics.
    pub metrics_enabled: bool,

    /// Metrics listener address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
