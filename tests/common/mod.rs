//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use upstream_relay::config::{EngineConfig, LocationConfig, ProxyConfig};
use upstream_relay::lifecycle::ContextTracker;
use upstream_relay::upstream::StaticResolver;
use upstream_relay::{HttpServer, Shutdown};

/// Host name the relay is configured with; resolved to loopback.
pub const BACKEND_HOST: &str = "backend.test";

/// A raw-TCP backend that records what it receives.
#[derive(Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Requests received so far, raw.
    pub async fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().await.clone()
    }

    /// Number of accepted connections.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Start a backend that answers every request with `pieces`, written one
/// after another with a short pause, then closes.
pub async fn start_backend(pieces: Vec<&'static str>) -> MockBackend {
    start_backend_with(pieces, true).await
}

/// Like `start_backend`, but keeps the socket open after writing when
/// `close` is false.
pub async fn start_backend_with(pieces: Vec<&'static str>, close: bool) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = MockBackend {
        addr: listener.local_addr().unwrap(),
        requests: Arc::new(Mutex::new(Vec::new())),
        accepted: Arc::new(AtomicUsize::new(0)),
    };

    let state = backend.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            state.accepted.fetch_add(1, Ordering::SeqCst);
            let state = state.clone();
            let pieces = pieces.clone();
            tokio::spawn(async move {
                let request = read_request_head(&mut socket).await;
                state.requests.lock().await.push(request);

                for piece in pieces {
                    if socket.write_all(piece.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                if close {
                    let _ = socket.shutdown().await;
                } else {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            });
        }
    });

    backend
}

/// Reserve a loopback port with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    request
}

/// Relay config pointing every path at one engine on `port`.
pub fn relay_config(port: u16, target: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.upstream.default_engine = "test".to_string();
    config.upstream.engines = vec![EngineConfig {
        name: "test".to_string(),
        host: BACKEND_HOST.to_string(),
        port,
        target: target.to_string(),
    }];
    config.locations = vec![LocationConfig {
        path_prefix: "/".to_string(),
        search_engine: None,
    }];
    config.timeouts.connect_ms = 2_000;
    config.timeouts.send_ms = 2_000;
    config.timeouts.read_ms = 2_000;
    config
}

/// A running relay.
pub struct Relay {
    pub addr: SocketAddr,
    pub tracker: ContextTracker,
    pub shutdown: Shutdown,
}

impl Relay {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

/// Start the relay with `BACKEND_HOST` resolved to loopback.
pub async fn start_relay(config: ProxyConfig) -> Relay {
    let resolver = StaticResolver::new().with_host(BACKEND_HOST, "127.0.0.1".parse().unwrap());
    start_relay_with(config, Arc::new(resolver)).await
}

pub async fn start_relay_with(
    config: ProxyConfig,
    resolver: Arc<dyn upstream_relay::upstream::Resolve>,
) -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::with_resolver(config, resolver);
    let tracker = server.tracker();
    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    Relay {
        addr,
        tracker,
        shutdown,
    }
}

/// HTTP client without pooling or proxy detection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Poll until the tracker reports no live contexts.
pub async fn wait_for_idle(tracker: &ContextTracker) -> bool {
    tracker.drain(Duration::from_secs(2)).await
}
