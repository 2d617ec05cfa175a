//! Incremental parsing of the backend's status line and header block.
//!
//! # Responsibilities
//! - Consume arbitrary-sized chunks as they arrive from the backend socket
//! - Keep partial progress (status fields, half-read header lines) between calls
//! - Fall back to HTTP/0.9 passthrough when no status line can be found
//! - Synthesize empty `Server` and `Date` fields when the backend sent none
//!
//! # Design Decisions
//! - Byte-at-a-time state machine: a chunk boundary can fall anywhere and
//!   parsing simply resumes from the saved sub-state
//! - Every byte the parser accepts is removed from the caller's buffer and
//!   whatever is left over is body, so nothing is lost or seen twice
//! - A malformed status line degrades; a malformed header line is fatal
//!
//! ```text
//!   AwaitingStatusLine ──parsed──▶ AwaitingHeaders ──blank line──▶ Done
//!          │                              │
//!      malformed / eof                 invalid / eof
//!          ▼                              ▼
//!   LegacyNoHeader                  ProtocolError
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Top-level parse phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingStatusLine,
    AwaitingHeaders,
    Done,
    LegacyNoHeader,
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// More bytes are needed.
    Incomplete,
    /// Status line and headers are complete; the buffer holds body bytes.
    Headers,
    /// No status line; the buffer holds the whole response so far as body.
    Legacy,
}

/// HTTP protocol version announced in the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const HTTP_09: Version = Version { major: 0, minor: 9 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };
}

/// Parsed status line, owned independently of the input buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    /// Status text exactly as sent, e.g. `"200 OK"`.
    pub text: String,
}

impl StatusLine {
    /// Status assumed for a response without a status line.
    pub fn legacy() -> Self {
        Self {
            version: Version::HTTP_09,
            code: 200,
            reason: String::new(),
            text: String::new(),
        }
    }
}

/// Forwarding decision attached to each field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTag {
    /// Sent to the client as received.
    Forward,
    /// Never sent to the client.
    Hide,
    /// Filled in by the relay because the backend omitted it.
    Default,
}

/// One response header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// Name with the backend's original casing.
    pub name: String,
    pub lowercase_name: String,
    pub value: Bytes,
    pub tag: HeaderTag,
}

impl HeaderField {
    pub fn new(name: &str, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.to_string(),
            lowercase_name: name.to_ascii_lowercase(),
            value: value.into(),
            tag: HeaderTag::Forward,
        }
    }

    fn synthesized(name: &str) -> Self {
        Self {
            tag: HeaderTag::Default,
            ..Self::new(name, Bytes::new())
        }
    }

    /// Value as text, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// The finished response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHead {
    pub status: StatusLine,
    pub headers: Vec<HeaderField>,
    /// True on the HTTP/0.9 passthrough path.
    pub legacy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusState {
    Start,
    H,
    HT,
    HTT,
    HTTP,
    FirstMajor,
    Major,
    FirstMinor,
    Minor,
    Code,
    AfterCode,
    Reason,
    AlmostDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    LineStart,
    Name,
    SpaceBeforeValue,
    Value,
    LineAlmostDone,
    HeadAlmostDone,
}

enum StatusStep {
    Accept,
    Finished,
    Malformed,
}

enum HeaderStep {
    Accept,
    Field,
    HeadDone,
}

/// Re-entrant response head parser. One per request.
#[derive(Debug)]
pub struct ResponseParser {
    phase: Phase,
    status_state: StatusState,
    header_state: HeaderState,
    major: u16,
    minor: u16,
    code: u16,
    code_digits: u8,
    /// Offset in `line` of the first status code digit.
    code_start: usize,
    /// Every byte accepted while looking for the status line.
    line: Vec<u8>,
    name: Vec<u8>,
    value: Vec<u8>,
    head_bytes: usize,
    max_head_bytes: usize,
    status: Option<StatusLine>,
    headers: Vec<HeaderField>,
}

impl ResponseParser {
    /// Create a parser that refuses heads larger than `max_head_bytes`.
    pub fn new(max_head_bytes: usize) -> Self {
        Self {
            phase: Phase::AwaitingStatusLine,
            status_state: StatusState::Start,
            header_state: HeaderState::LineStart,
            major: 0,
            minor: 0,
            code: 0,
            code_digits: 0,
            code_start: 0,
            line: Vec::new(),
            name: Vec::new(),
            value: Vec::new(),
            head_bytes: 0,
            max_head_bytes,
            status: None,
            headers: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> Option<&StatusLine> {
        self.status.as_ref()
    }

    /// Feed newly arrived bytes. Accepted bytes are removed from `buf`.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome, ProtocolError> {
        if self.phase == Phase::AwaitingStatusLine {
            let consumed = match self.parse_status_line(buf)? {
                (StatusStep::Finished, consumed) => consumed,
                (StatusStep::Malformed, consumed) => {
                    self.enter_legacy(buf, consumed);
                    tracing::warn!("Upstream sent no valid status line, relaying as HTTP/0.9");
                    return Ok(ParseOutcome::Legacy);
                }
                (StatusStep::Accept, consumed) => {
                    buf.advance(consumed);
                    return Ok(ParseOutcome::Incomplete);
                }
            };
            buf.advance(consumed);
            self.complete_status_line()?;
            self.phase = Phase::AwaitingHeaders;
        }

        match self.phase {
            Phase::AwaitingHeaders => self.parse_headers(buf),
            Phase::Done => Ok(ParseOutcome::Headers),
            Phase::LegacyNoHeader => Ok(ParseOutcome::Legacy),
            Phase::AwaitingStatusLine => Ok(ParseOutcome::Incomplete),
        }
    }

    /// The backend closed its side. `buf` holds any unparsed bytes.
    pub fn finish(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome, ProtocolError> {
        match self.phase {
            Phase::AwaitingStatusLine => {
                self.enter_legacy(buf, 0);
                tracing::warn!("Upstream closed before sending a status line, relaying as HTTP/0.9");
                Ok(ParseOutcome::Legacy)
            }
            Phase::AwaitingHeaders => Err(ProtocolError::HeaderTruncated),
            Phase::Done => Ok(ParseOutcome::Headers),
            Phase::LegacyNoHeader => Ok(ParseOutcome::Legacy),
        }
    }

    /// Hand out the finished head. `None` until a terminal phase is reached
    /// and after the head has already been taken.
    pub fn take_head(&mut self) -> Option<ParsedHead> {
        let legacy = match self.phase {
            Phase::Done => false,
            Phase::LegacyNoHeader => true,
            _ => return None,
        };
        let status = self.status.take()?;
        Some(ParsedHead {
            status,
            headers: std::mem::take(&mut self.headers),
            legacy,
        })
    }

    fn parse_status_line(&mut self, buf: &BytesMut) -> Result<(StatusStep, usize), ProtocolError> {
        let mut consumed = 0;
        for &byte in buf.iter() {
            let step = self.step_status(byte);
            if let StatusStep::Malformed = step {
                return Ok((StatusStep::Malformed, consumed));
            }
            self.line.push(byte);
            consumed += 1;
            self.count_head_byte()?;
            if let StatusStep::Finished = step {
                return Ok((StatusStep::Finished, consumed));
            }
        }
        Ok((StatusStep::Accept, consumed))
    }

    fn step_status(&mut self, byte: u8) -> StatusStep {
        use StatusState::*;

        let next = match (self.status_state, byte) {
            (Start, b'H') => H,
            (H, b'T') => HT,
            (HT, b'T') => HTT,
            (HTT, b'P') => HTTP,
            (HTTP, b'/') => FirstMajor,
            (FirstMajor, b'0'..=b'9') => {
                self.major = u16::from(byte - b'0');
                Major
            }
            (Major, b'.') => FirstMinor,
            (Major, b'0'..=b'9') => {
                self.major = self.major * 10 + u16::from(byte - b'0');
                if self.major > 99 {
                    return StatusStep::Malformed;
                }
                Major
            }
            (FirstMinor, b'0'..=b'9') => {
                self.minor = u16::from(byte - b'0');
                Minor
            }
            (Minor, b' ') => Code,
            (Minor, b'0'..=b'9') => {
                self.minor = self.minor * 10 + u16::from(byte - b'0');
                if self.minor > 99 {
                    return StatusStep::Malformed;
                }
                Minor
            }
            (Code, b' ') if self.code_digits == 0 => Code,
            (Code, b'0'..=b'9') => {
                if self.code_digits == 0 {
                    self.code_start = self.line.len();
                }
                self.code = self.code * 10 + u16::from(byte - b'0');
                self.code_digits += 1;
                if self.code_digits == 3 {
                    AfterCode
                } else {
                    Code
                }
            }
            // Some servers append a sub-status, as in "403.1".
            (AfterCode, b' ' | b'.') => Reason,
            (AfterCode | Reason, b'\r') => AlmostDone,
            (AfterCode | Reason | AlmostDone, b'\n') => return StatusStep::Finished,
            (Reason, _) => Reason,
            _ => return StatusStep::Malformed,
        };
        self.status_state = next;
        StatusStep::Accept
    }

    fn complete_status_line(&mut self) -> Result<(), ProtocolError> {
        if self.code < 100 {
            return Err(ProtocolError::InvalidStatus(self.code));
        }

        let mut end = self.line.len() - 1;
        if end > 0 && self.line[end - 1] == b'\r' {
            end -= 1;
        }
        let text = String::from_utf8_lossy(&self.line[self.code_start..end]).into_owned();
        let reason = text.get(4..).unwrap_or_default().to_string();

        tracing::debug!(status = %text, "Upstream status line parsed");
        self.status = Some(StatusLine {
            version: Version {
                major: self.major,
                minor: self.minor,
            },
            code: self.code,
            reason,
            text,
        });
        self.line = Vec::new();
        Ok(())
    }

    /// Switch to passthrough: everything accepted so far plus the unconsumed
    /// rest of `buf` becomes body.
    fn enter_legacy(&mut self, buf: &mut BytesMut, consumed: usize) {
        let rest = &buf[consumed..];
        let mut replay = BytesMut::with_capacity(self.line.len() + rest.len());
        replay.extend_from_slice(&self.line);
        replay.extend_from_slice(rest);
        *buf = replay;

        self.line = Vec::new();
        self.status = Some(StatusLine::legacy());
        self.phase = Phase::LegacyNoHeader;
    }

    fn parse_headers(&mut self, buf: &mut BytesMut) -> Result<ParseOutcome, ProtocolError> {
        let mut consumed = 0;
        let mut outcome = ParseOutcome::Incomplete;

        for &byte in buf.iter() {
            consumed += 1;
            self.count_head_byte()?;
            match self.step_header(byte)? {
                HeaderStep::Accept => {}
                HeaderStep::Field => self.push_field(),
                HeaderStep::HeadDone => {
                    outcome = ParseOutcome::Headers;
                    break;
                }
            }
        }

        buf.advance(consumed);
        if outcome == ParseOutcome::Headers {
            self.synthesize_defaults();
            self.phase = Phase::Done;
            tracing::debug!(headers = self.headers.len(), "Upstream header block parsed");
        }
        Ok(outcome)
    }

    fn step_header(&mut self, byte: u8) -> Result<HeaderStep, ProtocolError> {
        use HeaderState::*;

        let next = match (self.header_state, byte) {
            (LineStart, b'\r') => HeadAlmostDone,
            (LineStart, b'\n') | (HeadAlmostDone, b'\n') => {
                self.header_state = LineStart;
                return Ok(HeaderStep::HeadDone);
            }
            (LineStart, b' ' | b'\t') => {
                return Err(ProtocolError::InvalidHeader("obsolete line folding"));
            }
            (LineStart | Name, b) if is_token(b) => {
                self.name.push(b);
                Name
            }
            (Name, b':') => SpaceBeforeValue,
            (Name, b'\r' | b'\n') => {
                return Err(ProtocolError::InvalidHeader("missing colon"));
            }
            (LineStart | Name, _) => {
                return Err(ProtocolError::InvalidHeader("invalid character in name"));
            }
            (SpaceBeforeValue, b' ' | b'\t') => SpaceBeforeValue,
            (SpaceBeforeValue | Value, b'\r') => LineAlmostDone,
            (SpaceBeforeValue | Value | LineAlmostDone, b'\n') => {
                self.header_state = LineStart;
                return Ok(HeaderStep::Field);
            }
            (SpaceBeforeValue | Value, b) if is_value_byte(b) => {
                self.value.push(b);
                Value
            }
            (SpaceBeforeValue | Value, _) => {
                return Err(ProtocolError::InvalidHeader("invalid character in value"));
            }
            (LineAlmostDone | HeadAlmostDone, _) => {
                return Err(ProtocolError::InvalidHeader("CR not followed by LF"));
            }
        };
        self.header_state = next;
        Ok(HeaderStep::Accept)
    }

    fn push_field(&mut self) {
        while matches!(self.value.last(), Some(b' ' | b'\t')) {
            self.value.pop();
        }
        let name = String::from_utf8_lossy(&self.name).into_owned();
        let value = Bytes::from(std::mem::take(&mut self.value));
        self.name.clear();
        self.headers.push(HeaderField::new(&name, value));
    }

    fn synthesize_defaults(&mut self) {
        for name in ["Server", "Date"] {
            let present = self
                .headers
                .iter()
                .any(|h| h.lowercase_name.eq_ignore_ascii_case(name));
            if !present {
                self.headers.push(HeaderField::synthesized(name));
            }
        }
    }

    fn count_head_byte(&mut self) -> Result<(), ProtocolError> {
        self.head_bytes += 1;
        if self.head_bytes > self.max_head_bytes {
            return Err(ProtocolError::HeaderTooLarge {
                limit: self.max_head_bytes,
            });
        }
        Ok(())
    }
}

/// RFC 9110 `tchar`.
fn is_token(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

/// Visible characters, spaces, tabs and obs-text.
fn is_value_byte(b: u8) -> bool {
    b == b'\t' || (b >= 0x20 && b != 0x7f)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 4096;

    fn feed(parser: &mut ResponseParser, bytes: &[u8]) -> (ParseOutcome, BytesMut) {
        let mut buf = BytesMut::from(bytes);
        let outcome = parser.parse(&mut buf).unwrap();
        (outcome, buf)
    }

    #[test]
    fn parses_full_head_and_leaves_body() {
        let mut parser = ResponseParser::new(LIMIT);
        let (outcome, rest) = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nServer: nginx\r\nDate: today\r\n\r\n<html/>",
        );
        assert_eq!(outcome, ParseOutcome::Headers);
        assert_eq!(&rest[..], b"<html/>");

        let head = parser.take_head().unwrap();
        assert!(!head.legacy);
        assert_eq!(head.status.code, 200);
        assert_eq!(head.status.text, "200 OK");
        assert_eq!(head.status.reason, "OK");
        assert_eq!(head.status.version, Version::HTTP_11);
        assert_eq!(head.headers.len(), 3);
        assert_eq!(head.headers[0].name, "Content-Type");
        assert_eq!(head.headers[0].lowercase_name, "content-type");
        assert_eq!(head.headers[0].value_str(), Some("text/html"));
    }

    #[test]
    fn resumes_across_every_split_point() {
        let raw: &[u8] = b"HTTP/1.0 404 Not Found\r\nX-One: 1\r\nX-Two:  spaced  \r\n\r\nbody";
        for split in 0..raw.len() {
            let mut parser = ResponseParser::new(LIMIT);
            let mut buf = BytesMut::from(&raw[..split]);
            let first = parser.parse(&mut buf).unwrap();
            if first == ParseOutcome::Headers {
                buf.extend_from_slice(&raw[split..]);
            } else {
                assert!(buf.is_empty(), "split {split}: unconsumed bytes");
                buf.extend_from_slice(&raw[split..]);
                assert_eq!(parser.parse(&mut buf).unwrap(), ParseOutcome::Headers);
            }
            assert_eq!(&buf[..], b"body", "split {split}");
            let head = parser.take_head().unwrap();
            assert_eq!(head.status.code, 404);
            assert_eq!(head.headers[1].value_str(), Some("spaced"));
        }
    }

    #[test]
    fn synthesizes_missing_server_and_date() {
        let mut parser = ResponseParser::new(LIMIT);
        feed(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n");
        let head = parser.take_head().unwrap();
        let names: Vec<_> = head.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["Content-Type", "Server", "Date"]);
        assert_eq!(head.headers[1].tag, HeaderTag::Default);
        assert!(head.headers[1].value.is_empty());
        assert!(head.headers[2].value.is_empty());
    }

    #[test]
    fn keeps_backend_server_header() {
        let mut parser = ResponseParser::new(LIMIT);
        feed(&mut parser, b"HTTP/1.1 200 OK\r\nSERVER: backend\r\n\r\n");
        let head = parser.take_head().unwrap();
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers[0].value_str(), Some("backend"));
        assert_eq!(head.headers[1].name, "Date");
    }

    #[test]
    fn malformed_status_line_replays_everything_as_body() {
        let mut parser = ResponseParser::new(LIMIT);
        let mut buf = BytesMut::from(&b"HT"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseOutcome::Incomplete);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"ML is here");
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseOutcome::Legacy);
        assert_eq!(&buf[..], b"HTML is here");
        assert_eq!(parser.phase(), Phase::LegacyNoHeader);

        let head = parser.take_head().unwrap();
        assert!(head.legacy);
        assert_eq!(head.status.code, 200);
        assert_eq!(head.status.version, Version::HTTP_09);
        assert!(head.headers.is_empty());
    }

    #[test]
    fn eof_before_status_line_is_legacy() {
        let mut parser = ResponseParser::new(LIMIT);
        let (_, mut rest) = feed(&mut parser, b"HTTP/1.");
        assert_eq!(parser.finish(&mut rest).unwrap(), ParseOutcome::Legacy);
        assert_eq!(&rest[..], b"HTTP/1.");
    }

    #[test]
    fn eof_inside_headers_is_fatal() {
        let mut parser = ResponseParser::new(LIMIT);
        let (_, mut rest) = feed(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Ty");
        assert_eq!(parser.finish(&mut rest), Err(ProtocolError::HeaderTruncated));
    }

    #[test]
    fn status_without_reason_and_bare_lf() {
        let mut parser = ResponseParser::new(LIMIT);
        let (outcome, rest) = feed(&mut parser, b"HTTP/1.1 204\nX-A: b\n\n");
        assert_eq!(outcome, ParseOutcome::Headers);
        assert!(rest.is_empty());
        let head = parser.take_head().unwrap();
        assert_eq!(head.status.code, 204);
        assert_eq!(head.status.text, "204");
        assert_eq!(head.status.reason, "");
    }

    #[test]
    fn invalid_header_lines() {
        let cases: [&[u8]; 5] = [
            b"HTTP/1.1 200 OK\r\nNo Colon Here\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nMissing\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nA: b\r\n folded\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nA: b\rX\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nA: b\x00c\r\n\r\n",
        ];
        for raw in cases {
            let mut parser = ResponseParser::new(LIMIT);
            let mut buf = BytesMut::from(raw);
            assert!(
                matches!(parser.parse(&mut buf), Err(ProtocolError::InvalidHeader(_))),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn status_code_below_100_rejected() {
        let mut parser = ResponseParser::new(LIMIT);
        let mut buf = BytesMut::from(&b"HTTP/1.1 099 Odd\r\n\r\n"[..]);
        assert_eq!(parser.parse(&mut buf), Err(ProtocolError::InvalidStatus(99)));
    }

    #[test]
    fn head_size_limit() {
        let mut parser = ResponseParser::new(32);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nX-Long: aaaaaaaaaaaaaaaaaaaa\r\n\r\n"[..]);
        assert_eq!(
            parser.parse(&mut buf),
            Err(ProtocolError::HeaderTooLarge { limit: 32 })
        );
    }

    #[test]
    fn take_head_only_once() {
        let mut parser = ResponseParser::new(LIMIT);
        feed(&mut parser, b"HTTP/1.1 200 OK\r\n\r\n");
        assert!(parser.take_head().is_some());
        assert!(parser.take_head().is_none());
    }
}
