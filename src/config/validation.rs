//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (locations reference existing engines)
//! - Validate value ranges (timeouts > 0, buffer sizes)
//! - Check engine request templates
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::upstream::request::{RequestTemplate, TemplateError};

/// Smallest head buffer that still fits a status line and a few headers.
const MIN_BUFFER_SIZE: usize = 256;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBindAddress(String),
    NoLocations,
    InvalidPathPrefix(String),
    DuplicateLocation(String),
    UnknownEngine { location: String, engine: String },
    DuplicateEngine(String),
    InvalidTemplate { engine: String, reason: TemplateError },
    ZeroTimeout(&'static str),
    BufferTooSmall(usize),
    InvalidMetricsAddress(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidBindAddress(addr) => write!(f, "invalid bind address {:?}", addr),
            ValidationError::NoLocations => write!(f, "no locations configured"),
            ValidationError::InvalidPathPrefix(p) => write!(f, "path prefix {:?} must start with '/'", p),
            ValidationError::DuplicateLocation(p) => write!(f, "duplicate location {:?}", p),
            ValidationError::UnknownEngine { location, engine } => {
                write!(f, "location {:?} references unknown engine {:?}", location, engine)
            }
            ValidationError::DuplicateEngine(name) => write!(f, "duplicate engine {:?}", name),
            ValidationError::InvalidTemplate { engine, reason } => {
                write!(f, "engine {:?}: {}", engine, reason)
            }
            ValidationError::ZeroTimeout(which) => write!(f, "timeouts.{} must be greater than 0", which),
            ValidationError::BufferTooSmall(size) => {
                write!(f, "buffers.buffer_size {} is below {}", size, MIN_BUFFER_SIZE)
            }
            ValidationError::InvalidMetricsAddress(addr) => {
                write!(f, "invalid metrics address {:?}", addr)
            }
        }
    }
}

/// Check `config` and collect every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    let mut engines = HashSet::new();
    for engine in &config.upstream.engines {
        if !engines.insert(engine.name.to_ascii_lowercase()) {
            errors.push(ValidationError::DuplicateEngine(engine.name.clone()));
        }
        if let Err(reason) = RequestTemplate::new(&engine.target, &engine.host, engine.port) {
            errors.push(ValidationError::InvalidTemplate {
                engine: engine.name.clone(),
                reason,
            });
        }
    }

    if config.locations.is_empty() {
        errors.push(ValidationError::NoLocations);
    }
    let mut prefixes = HashSet::new();
    for location in &config.locations {
        if !location.path_prefix.starts_with('/') {
            errors.push(ValidationError::InvalidPathPrefix(location.path_prefix.clone()));
        }
        if !prefixes.insert(location.path_prefix.as_str()) {
            errors.push(ValidationError::DuplicateLocation(location.path_prefix.clone()));
        }
        let engine = location
            .search_engine
            .as_deref()
            .unwrap_or(&config.upstream.default_engine);
        if config.engine(engine).is_none() {
            errors.push(ValidationError::UnknownEngine {
                location: location.path_prefix.clone(),
                engine: engine.to_string(),
            });
        }
    }

    for (name, value) in [
        ("connect_ms", config.timeouts.connect_ms),
        ("send_ms", config.timeouts.send_ms),
        ("read_ms", config.timeouts.read_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if config.buffers.buffer_size < MIN_BUFFER_SIZE {
        errors.push(ValidationError::BufferTooSmall(config.buffers.buffer_size));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
