//! Generic upstream exchange driver.
//!
//! # Responsibilities
//! - Own the backend byte stream and apply per-operation deadlines
//! - Send the handler's request, then feed it response bytes until the head
//!   is complete
//! - Relay the remaining bytes as a body stream and finalize the handler
//!
//! # Design Decisions
//! - The handler sees three hooks (`create_request`, `process_header`,
//!   `finalize`); the driver never interprets HTTP itself
//! - Generic over the stream type so tests can drive it with in-memory pipes
//! - Every exit from the body stream calls `finalize` exactly once; the
//!   handler's own drop covers the client going away mid-stream

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ProtocolError, ProxyError};
use crate::resilience::timeouts::{with_timeout, Stage, Timeouts};
use crate::upstream::body::BodyStreamer;
use crate::upstream::resolver::BackendAddress;

/// Answer of `process_header` for one batch of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProgress {
    /// Need more bytes.
    Again,
    /// Head complete; remaining bytes are body.
    Done,
}

/// How an exchange ended, as reported to `finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { body_bytes: u64 },
    Failed { kind: &'static str, status: u16 },
    /// The client went away before the body was relayed.
    Aborted,
}

impl Outcome {
    pub fn failed(err: &ProxyError) -> Self {
        Outcome::Failed {
            kind: err.kind(),
            status: err.status().as_u16(),
        }
    }
}

/// The protocol side of an upstream exchange.
pub trait UpstreamHandler {
    /// Produce the complete request bytes for the backend.
    fn create_request(&mut self) -> Result<Bytes, ProxyError>;

    /// Consume response bytes from `buf`. `eof` is true once the backend has
    /// closed and no more bytes will arrive.
    fn process_header(&mut self, buf: &mut BytesMut, eof: bool) -> Result<HeaderProgress, ProxyError>;

    /// Called once when the exchange ends, whatever the outcome.
    fn finalize(&mut self, outcome: Outcome);
}

/// Byte stream to one backend with deadlines attached.
#[derive(Debug)]
pub struct UpstreamConnection<S = TcpStream> {
    stream: S,
    timeouts: Timeouts,
    read_size: usize,
}

impl UpstreamConnection<TcpStream> {
    /// Open a TCP connection to `addr` within the connect timeout.
    pub async fn connect(addr: BackendAddress, timeouts: Timeouts, read_size: usize) -> Result<Self, ProxyError> {
        let stream = with_timeout(&timeouts, Stage::Connect, async {
            TcpStream::connect(addr.socket_addr())
                .await
                .map_err(|source| ProxyError::UpstreamConnect { addr, source })
        })
        .await?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }
        tracing::debug!(backend = %addr, "Upstream connected");
        Ok(Self::new(stream, timeouts, read_size))
    }
}

impl<S> UpstreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, timeouts: Timeouts, read_size: usize) -> Self {
        Self {
            stream,
            timeouts,
            read_size: read_size.max(1),
        }
    }

    /// Write the whole request, handling short writes.
    pub async fn send(&mut self, request: Bytes) -> Result<(), ProxyError> {
        let stream = &mut self.stream;
        with_timeout(&self.timeouts, Stage::Send, async move {
            stream.write_all(&request).await.map_err(ProxyError::UpstreamIo)?;
            stream.flush().await.map_err(ProxyError::UpstreamIo)
        })
        .await
    }

    /// Append at most one read's worth of bytes to `buf`. Returns 0 at end
    /// of stream.
    pub async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize, ProxyError> {
        buf.reserve(self.read_size);
        let stream = &mut self.stream;
        with_timeout(&self.timeouts, Stage::Read, async move {
            stream.read_buf(buf).await.map_err(ProxyError::UpstreamIo)
        })
        .await
    }
}

/// Bytes left over once the response head has been processed.
#[derive(Debug)]
pub struct HeadRead {
    pub leftover: BytesMut,
    /// The backend already closed while the head was being read.
    pub eof: bool,
}

/// Send the request and feed the handler until the response head is done.
pub async fn exchange_head<H, S>(handler: &mut H, conn: &mut UpstreamConnection<S>) -> Result<HeadRead, ProxyError>
where
    H: UpstreamHandler,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = handler.create_request()?;
    tracing::trace!(bytes = request.len(), "Sending upstream request");
    conn.send(request).await?;

    let mut buf = BytesMut::new();
    loop {
        let eof = conn.read_into(&mut buf).await? == 0;
        match handler.process_header(&mut buf, eof)? {
            HeaderProgress::Done => return Ok(HeadRead { leftover: buf, eof }),
            HeaderProgress::Again if eof => return Err(ProtocolError::HeaderTruncated.into()),
            HeaderProgress::Again => {}
        }
    }
}

/// Relays the body of one exchange and finalizes its handler.
#[derive(Debug)]
pub struct BodyRelay<H, S = TcpStream> {
    handler: H,
    conn: UpstreamConnection<S>,
    streamer: BodyStreamer,
    buf: BytesMut,
    eof: bool,
    done: bool,
}

impl<H, S> BodyRelay<H, S>
where
    H: UpstreamHandler,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(handler: H, conn: UpstreamConnection<S>, streamer: BodyStreamer, head: HeadRead) -> Self {
        Self {
            handler,
            conn,
            streamer,
            buf: head.leftover,
            eof: head.eof,
            done: false,
        }
    }

    /// Next non-empty piece of body, or `None` after the last one.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProxyError> {
        if self.done {
            return Ok(None);
        }
        match self.step().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.done = true;
                tracing::error!(
                    error = %e,
                    relayed = self.streamer.received(),
                    "Aborting response body"
                );
                self.handler.finalize(Outcome::failed(&e));
                Err(e)
            }
        }
    }

    /// Turn the relay into a stream for the response body.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, ProxyError>> + Send
    where
        H: Send,
        S: Send,
    {
        futures_util::stream::try_unfold(self, |mut relay| async move {
            Ok(relay.next_chunk().await?.map(|data| (data, relay)))
        })
    }

    async fn step(&mut self) -> Result<Option<Bytes>, ProxyError> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.streamer.is_complete() {
                self.complete();
                return Ok(None);
            }

            if !self.buf.is_empty() {
                if let Some(chunk) = self.streamer.push(&mut self.buf)? {
                    if chunk.last {
                        self.complete();
                    }
                    if !chunk.data.is_empty() {
                        return Ok(Some(chunk.data));
                    }
                    continue;
                }
            }

            if self.eof {
                let chunk = self.streamer.finish()?;
                self.complete();
                return Ok(Some(chunk.data).filter(|data| !data.is_empty()));
            }

            if self.conn.read_into(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }

    fn complete(&mut self) {
        if !self.done {
            self.done = true;
            self.handler.finalize(Outcome::Completed {
                body_bytes: self.streamer.received(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::TryStreamExt;

    use crate::upstream::body::BodyFraming;

    /// Handler that waits for a blank line and records what happened.
    #[derive(Default)]
    struct Recorder {
        finalized: Vec<Outcome>,
    }

    impl UpstreamHandler for Recorder {
        fn create_request(&mut self) -> Result<Bytes, ProxyError> {
            Ok(Bytes::from_static(b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n"))
        }

        fn process_header(&mut self, buf: &mut BytesMut, _eof: bool) -> Result<HeaderProgress, ProxyError> {
            match buf.windows(2).position(|w| w == b"\n\n") {
                Some(pos) => {
                    let _ = buf.split_to(pos + 2);
                    Ok(HeaderProgress::Done)
                }
                None => Ok(HeaderProgress::Again),
            }
        }

        fn finalize(&mut self, outcome: Outcome) {
            self.finalized.push(outcome);
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(1),
            send: Duration::from_secs(1),
            read: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn sends_request_and_splits_head_from_body() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = UpstreamConnection::new(client, timeouts(), 4);
        let mut handler = Recorder::default();

        let expected = Recorder::default().create_request().unwrap().len();
        let backend = tokio::spawn(async move {
            let mut request = vec![0u8; expected];
            server.read_exact(&mut request).await.unwrap();
            for piece in [&b"head"[..], b"\n", b"\nbo", b"dy"] {
                server.write_all(piece).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            request
        });

        let head = exchange_head(&mut handler, &mut conn).await.unwrap();
        let relay = BodyRelay::new(handler, conn, BodyStreamer::new(BodyFraming::Length(4)), head);
        let chunks: Vec<Bytes> = relay.into_stream().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"body");

        let request = backend.await.unwrap();
        assert!(request.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn truncated_body_finalizes_failed() {
        let (client, mut server) = tokio::io::duplex(64);
        let conn = UpstreamConnection::new(client, timeouts(), 16);
        tokio::spawn(async move {
            server.write_all(b"abc").await.unwrap();
        });

        let head = HeadRead {
            leftover: BytesMut::new(),
            eof: false,
        };
        let mut relay = BodyRelay::new(
            Recorder::default(),
            conn,
            BodyStreamer::new(BodyFraming::Length(10)),
            head,
        );
        assert_eq!(relay.next_chunk().await.unwrap().as_deref(), Some(&b"abc"[..]));
        let err = relay.next_chunk().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::UpstreamProtocol(ProtocolError::BodyTruncated { expected: 10, received: 3 })
        ));
        assert!(relay.next_chunk().await.unwrap().is_none());
        assert_eq!(relay.handler.finalized.len(), 1);
        assert!(matches!(relay.handler.finalized[0], Outcome::Failed { status: 502, .. }));
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = UpstreamConnection::new(
            client,
            Timeouts {
                read: Duration::from_millis(20),
                ..timeouts()
            },
            16,
        );
        let mut handler = Recorder::default();
        let err = exchange_head(&mut handler, &mut conn).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamTimeout(Stage::Read)));
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => BackendAddress::new(*v4.ip(), v4.port()),
            std::net::SocketAddr::V6(_) => unreachable!(),
        };
        drop(listener);

        let err = UpstreamConnection::connect(addr, timeouts(), 16).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
    }
}
