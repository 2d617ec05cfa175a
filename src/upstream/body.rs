//! Response body relay.
//!
//! # Responsibilities
//! - Decide how the backend delimits the body (length, chunked, close)
//! - Turn arriving bytes into client chunks in arrival order
//! - Mark the final chunk explicitly
//! - Report a backend that closes before the declared end
//!
//! # Design Decisions
//! - Unbuffered: each read is forwarded as soon as it is decoded, memory
//!   stays bounded by the read buffer
//! - Chunked bodies are decoded here because the client side is re-framed
//! - Bytes beyond a satisfied `Content-Length` are dropped with a warning

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::upstream::parser::ParsedHead;

/// How the end of the backend body is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all (HEAD, 1xx, 204, 304).
    Empty,
    Length(u64),
    Chunked,
    /// Body ends when the backend closes the connection.
    UntilClose,
}

impl BodyFraming {
    /// Framing for `head`. `head_request` is true when the client sent HEAD.
    pub fn for_response(head: &ParsedHead, head_request: bool) -> Result<Self, ProtocolError> {
        if head_request {
            return Ok(BodyFraming::Empty);
        }
        if head.legacy {
            return Ok(BodyFraming::UntilClose);
        }
        let code = head.status.code;
        if (100..200).contains(&code) || code == 204 || code == 304 {
            return Ok(BodyFraming::Empty);
        }

        let transfer_encoding = head
            .headers
            .iter()
            .filter(|h| h.lowercase_name == "transfer-encoding")
            .filter_map(|h| h.value_str())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .last();
        if let Some(coding) = transfer_encoding {
            return Ok(if coding.eq_ignore_ascii_case("chunked") {
                BodyFraming::Chunked
            } else {
                BodyFraming::UntilClose
            });
        }

        let mut length = None;
        for field in head.headers.iter().filter(|h| h.lowercase_name == "content-length") {
            let value = field
                .value_str()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(ProtocolError::InvalidContentLength)?;
            match length {
                Some(previous) if previous != value => {
                    return Err(ProtocolError::InvalidContentLength);
                }
                _ => length = Some(value),
            }
        }

        Ok(length.map_or(BodyFraming::UntilClose, BodyFraming::Length))
    }
}

/// One piece of body for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChunk {
    pub data: Bytes,
    /// No more chunks follow.
    pub last: bool,
}

/// Per-request body relay state.
#[derive(Debug)]
pub struct BodyStreamer {
    framing: BodyFraming,
    remaining: u64,
    decoder: ChunkedDecoder,
    received: u64,
    complete: bool,
}

impl BodyStreamer {
    pub fn new(framing: BodyFraming) -> Self {
        let (remaining, complete) = match framing {
            BodyFraming::Empty => (0, true),
            BodyFraming::Length(n) => (n, n == 0),
            BodyFraming::Chunked | BodyFraming::UntilClose => (0, false),
        };
        Self {
            framing,
            remaining,
            decoder: ChunkedDecoder::default(),
            received: 0,
            complete,
        }
    }

    /// True once the last chunk has been produced.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Body bytes handed out so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Consume backend bytes from `input`. Returns `None` when nothing can be
    /// forwarded yet.
    pub fn push(&mut self, input: &mut BytesMut) -> Result<Option<BodyChunk>, ProtocolError> {
        if self.complete {
            self.discard_excess(input);
            return Ok(None);
        }

        let data = match self.framing {
            BodyFraming::Empty => Bytes::new(),
            BodyFraming::Length(_) => {
                let take = self.remaining.min(input.len() as u64) as usize;
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.complete = true;
                }
                input.split_to(take).freeze()
            }
            BodyFraming::UntilClose => input.split().freeze(),
            BodyFraming::Chunked => {
                let mut out = BytesMut::with_capacity(input.len());
                if self.decoder.decode(input, &mut out)? {
                    self.complete = true;
                }
                out.freeze()
            }
        };

        self.received += data.len() as u64;
        if self.complete {
            self.discard_excess(input);
        }
        if data.is_empty() && !self.complete {
            return Ok(None);
        }
        Ok(Some(BodyChunk {
            data,
            last: self.complete,
        }))
    }

    /// The backend closed its side. Produces the final (empty) chunk when
    /// closing is a legal end of this body.
    pub fn finish(&mut self) -> Result<BodyChunk, ProtocolError> {
        if !self.complete {
            match self.framing {
                BodyFraming::Length(expected) => {
                    return Err(ProtocolError::BodyTruncated {
                        expected,
                        received: self.received,
                    });
                }
                BodyFraming::Chunked => return Err(ProtocolError::ChunkedTruncated),
                BodyFraming::Empty | BodyFraming::UntilClose => self.complete = true,
            }
        }
        Ok(BodyChunk {
            data: Bytes::new(),
            last: true,
        })
    }

    fn discard_excess(&self, input: &mut BytesMut) {
        if !input.is_empty() {
            tracing::warn!(
                excess = input.len(),
                framing = ?self.framing,
                "Upstream sent data after the end of the body, discarding"
            );
            input.clear();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ChunkState {
    #[default]
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    EndLf,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
#[derive(Debug, Default)]
struct ChunkedDecoder {
    state: ChunkState,
    size: u64,
    digits: u32,
    remaining: u64,
}

impl ChunkedDecoder {
    /// Decode as much of `input` as possible into `out`. Returns true when
    /// the terminating chunk and trailer section have been read.
    fn decode(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<bool, ProtocolError> {
        while !input.is_empty() && self.state != ChunkState::Done {
            if self.state == ChunkState::Data {
                let take = self.remaining.min(input.len() as u64) as usize;
                out.extend_from_slice(&input[..take]);
                input.advance(take);
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.state = ChunkState::DataCr;
                }
                continue;
            }

            let byte = input[0];
            input.advance(1);
            self.step(byte)?;
        }
        Ok(self.state == ChunkState::Done)
    }

    fn step(&mut self, byte: u8) -> Result<(), ProtocolError> {
        use ChunkState::*;

        self.state = match (self.state, byte) {
            (Size, b) if b.is_ascii_hexdigit() => {
                let digit = u64::from((b as char).to_digit(16).unwrap_or(0));
                self.size = self
                    .size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add(digit))
                    .ok_or(ProtocolError::InvalidChunk("chunk size overflow"))?;
                self.digits += 1;
                Size
            }
            (Size, _) if self.digits == 0 => {
                return Err(ProtocolError::InvalidChunk("missing chunk size"));
            }
            (Size, b';' | b' ' | b'\t') => Extension,
            (Size | Extension, b'\r') => SizeLf,
            (Size | Extension | SizeLf, b'\n') => self.start_chunk(),
            (Size, _) => return Err(ProtocolError::InvalidChunk("invalid chunk size")),
            (Extension, _) => Extension,
            (SizeLf, _) => return Err(ProtocolError::InvalidChunk("CR not followed by LF")),
            (DataCr, b'\r') => DataLf,
            (DataCr | DataLf, b'\n') => Size,
            (DataCr | DataLf, _) => {
                return Err(ProtocolError::InvalidChunk("missing CRLF after chunk data"));
            }
            (TrailerStart, b'\r') => EndLf,
            (TrailerStart | EndLf, b'\n') => Done,
            (Trailer, b'\n') => TrailerStart,
            (TrailerStart | Trailer, _) => Trailer,
            (EndLf, _) => return Err(ProtocolError::InvalidChunk("CR not followed by LF")),
            (Data | Done, _) => self.state,
        };
        Ok(())
    }

    fn start_chunk(&mut self) -> ChunkState {
        let size = std::mem::take(&mut self.size);
        self.digits = 0;
        if size == 0 {
            ChunkState::TrailerStart
        } else {
            self.remaining = size;
            ChunkState::Data
        }
    }
}
