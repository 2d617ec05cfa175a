//! Search engine relay: a minimal HTTP/1.x reverse proxy that forwards GET and
//! HEAD requests to a configured engine and streams the response back.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod upstream;

pub use config::schema::ProxyConfig;
pub use error::{ProtocolError, ProxyError};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
