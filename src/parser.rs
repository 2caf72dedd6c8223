//! Incremental HTTP/1.x message parser.
//!
//! Bytes are fed in with [`Parser::execute`] in whatever pieces the transport delivers them and the
//! parser reports what it finds through [`ParserCallbacks`]. Start line and header text is passed
//! through as fragments: one header line may produce several field and value callbacks when it is
//! split across buffers, and reassembling them is up to the caller.
//!
//! Framing headers (`Content-Length`, `Transfer-Encoding`, `Connection` and `Upgrade`) are also
//! interpreted here so the parser knows where each message ends.

use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

use crate::ascii::{COLON, CR, HT, LF, SP, atoi, is_token};
use crate::header::has_token;
use crate::request::Method;
use crate::response::StatusCode;

const MAX_TOKEN: usize = 8;
const MAX_SPECIAL_NAME: usize = 24;
const MAX_SPECIAL_VALUE: usize = 256;
const MAX_CHUNK_LINE: usize = 1024;

/// Parse failures, named after the classic `http_errno` codes.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    CbMessageBegin,
    CbUrl,
    CbStatus,
    CbHeaderField,
    CbHeaderValue,
    CbHeadersComplete,
    CbBody,
    CbMessageComplete,
    InvalidEofState,
    HeaderOverflow,
    ClosedConnection,
    InvalidVersion,
    InvalidStatus,
    InvalidMethod,
    InvalidUrl,
    InvalidHeaderToken,
    InvalidContentLength,
    UnexpectedContentLength,
    InvalidChunkSize,
    LfExpected,
}

impl ParseError {
    /// The `http_errno` style name, e.g. `HPE_INVALID_METHOD`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CbMessageBegin => "HPE_CB_message_begin",
            Self::CbUrl => "HPE_CB_url",
            Self::CbStatus => "HPE_CB_status",
            Self::CbHeaderField => "HPE_CB_header_field",
            Self::CbHeaderValue => "HPE_CB_header_value",
            Self::CbHeadersComplete => "HPE_CB_headers_complete",
            Self::CbBody => "HPE_CB_body",
            Self::CbMessageComplete => "HPE_CB_message_complete",
            Self::InvalidEofState => "HPE_INVALID_EOF_STATE",
            Self::HeaderOverflow => "HPE_HEADER_OVERFLOW",
            Self::ClosedConnection => "HPE_CLOSED_CONNECTION",
            Self::InvalidVersion => "HPE_INVALID_VERSION",
            Self::InvalidStatus => "HPE_INVALID_STATUS",
            Self::InvalidMethod => "HPE_INVALID_METHOD",
            Self::InvalidUrl => "HPE_INVALID_URL",
            Self::InvalidHeaderToken => "HPE_INVALID_HEADER_TOKEN",
            Self::InvalidContentLength => "HPE_INVALID_CONTENT_LENGTH",
            Self::UnexpectedContentLength => "HPE_UNEXPECTED_CONTENT_LENGTH",
            Self::InvalidChunkSize => "HPE_INVALID_CHUNK_SIZE",
            Self::LfExpected => "HPE_LF_EXPECTED",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::CbMessageBegin
            | Self::CbUrl
            | Self::CbStatus
            | Self::CbHeaderField
            | Self::CbHeaderValue
            | Self::CbHeadersComplete
            | Self::CbBody
            | Self::CbMessageComplete => "callback failed",
            Self::InvalidEofState => "stream ended at an unexpected time",
            Self::HeaderOverflow => "too many header bytes seen",
            Self::ClosedConnection => "data received after completed connection: close message",
            Self::InvalidVersion => "invalid HTTP version",
            Self::InvalidStatus => "invalid HTTP status code",
            Self::InvalidMethod => "invalid HTTP method",
            Self::InvalidUrl => "invalid URL",
            Self::InvalidHeaderToken => "invalid character in header",
            Self::InvalidContentLength => "invalid character in content-length header",
            Self::UnexpectedContentLength => "unexpected content-length header",
            Self::InvalidChunkSize => "invalid character in chunk size header",
            Self::LfExpected => "LF character expected",
        };
        write!(f, "{}: {}", self.name(), msg)
    }
}

impl core::error::Error for ParseError {}

/// Which side of the conversation is parsed.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParserKind {
    /// Requests, on a server
    Request,
    /// Responses, on a client
    Response,
}

/// What to do after the headers of a message.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeadersAction {
    /// Read the body as framed by the headers
    Continue,
    /// The message has no body, as for the response to a `HEAD` request
    SkipBody,
    /// No body and no further messages on this connection
    SkipBodyAndClose,
}

/// Whether to keep going after a complete message.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Flow {
    /// Parse the next message
    Continue,
    /// Stop until [`Parser::resume`] is called
    Pause,
}

/// Facts about the current message known once its headers are in.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MessageInfo {
    /// Request method
    pub method: Option<Method>,
    /// Response status code
    pub status: u16,
    /// HTTP major version
    pub version_major: u8,
    /// HTTP minor version
    pub version_minor: u8,
    /// The connection stays open after this message
    pub keep_alive: bool,
    /// The connection switches protocol after this message
    pub upgrade: bool,
    /// Declared body length
    pub content_length: Option<u64>,
    /// The body uses chunked transfer encoding
    pub chunked: bool,
}

/// Receiver of parser events.
///
/// An error returned by a callback stops parsing and is returned from [`Parser::execute`].
#[allow(missing_docs)]
pub trait ParserCallbacks {
    fn on_message_begin(&mut self) -> Result<(), ParseError> {
        Ok(())
    }

    fn on_url(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        let _ = fragment;
        Ok(())
    }

    fn on_status(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        let _ = fragment;
        Ok(())
    }

    fn on_header_field(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        let _ = fragment;
        Ok(())
    }

    /// An empty fragment marks a header with an empty value.
    fn on_header_value(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        let _ = fragment;
        Ok(())
    }

    fn on_headers_complete(&mut self, info: &MessageInfo) -> Result<HeadersAction, ParseError> {
        let _ = info;
        Ok(HeadersAction::Continue)
    }

    fn on_body(&mut self, data: &[u8]) -> Result<(), ParseError> {
        let _ = data;
        Ok(())
    }

    fn on_message_complete(&mut self, info: &MessageInfo) -> Result<Flow, ParseError> {
        let _ = info;
        Ok(Flow::Continue)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Start,
    Method,
    Url,
    ReqVersion,
    ReqLineLf,
    ResVersion,
    StatusCode,
    Status,
    ResLineLf,
    HeaderStart,
    HeaderField,
    HeaderValueStart,
    HeaderValue,
    HeaderValueLf,
    HeaderLineEnd,
    HeaderFold,
    HeadersLf,
    Body,
    BodyToEof,
    ChunkSize,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    Trailer,
    Upgraded,
    Closed,
}

impl State {
    fn in_head(&self) -> bool {
        matches!(
            self,
            Self::Method
                | Self::Url
                | Self::ReqVersion
                | Self::ReqLineLf
                | Self::ResVersion
                | Self::StatusCode
                | Self::Status
                | Self::ResLineLf
                | Self::HeaderStart
                | Self::HeaderField
                | Self::HeaderValueStart
                | Self::HeaderValue
                | Self::HeaderValueLf
                | Self::HeaderLineEnd
                | Self::HeaderFold
                | Self::HeadersLf
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Special {
    None,
    ContentLength,
    TransferEncoding,
    Connection,
    Upgrade,
}

/// The message parser. One instance parses every message on a connection.
pub struct Parser {
    kind: ParserKind,
    state: State,
    max_header_size: usize,
    header_bytes: usize,
    error: Option<ParseError>,
    paused: bool,
    info: MessageInfo,
    token: [u8; MAX_TOKEN],
    token_len: usize,
    name: [u8; MAX_SPECIAL_NAME],
    name_len: usize,
    special: Special,
    value: Vec<u8>,
    line: Vec<u8>,
    remaining: u64,
    trailer_len: usize,
    url_seen: bool,
    conn_close: bool,
    conn_keep_alive: bool,
    conn_upgrade: bool,
    has_upgrade: bool,
}

impl Parser {
    /// New parser. The start line and headers of a message may not exceed `max_header_size` bytes.
    pub fn new(kind: ParserKind, max_header_size: usize) -> Self {
        Self {
            kind,
            state: State::Start,
            max_header_size,
            header_bytes: 0,
            error: None,
            paused: false,
            info: MessageInfo::default(),
            token: [0; MAX_TOKEN],
            token_len: 0,
            name: [0; MAX_SPECIAL_NAME],
            name_len: 0,
            special: Special::None,
            value: Vec::new(),
            line: Vec::new(),
            remaining: 0,
            trailer_len: 0,
            url_seen: false,
            conn_close: false,
            conn_keep_alive: false,
            conn_upgrade: false,
            has_upgrade: false,
        }
    }

    /// Forget everything, including a previous error.
    pub fn reset(&mut self) {
        *self = Self::new(self.kind, self.max_header_size);
    }

    /// What is being parsed.
    pub fn kind(&self) -> ParserKind {
        self.kind
    }

    /// The sticky error, if parsing failed.
    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    /// Info about the current or last message.
    pub fn info(&self) -> &MessageInfo {
        &self.info
    }

    /// `true` after a callback asked to pause.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Continue after a pause.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// `true` once the connection switched protocol. Nothing more is parsed afterwards.
    pub fn is_upgrade(&self) -> bool {
        self.state == State::Upgraded
    }

    /// `true` between messages.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Start | State::Closed)
    }

    /// `true` after a message that ends the connection.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Parse `data`, returning how many bytes were consumed. Fewer than `data.len()` are consumed
    /// only when parsing paused or the connection upgraded.
    pub fn execute(
        &mut self,
        cb: &mut dyn ParserCallbacks,
        data: &[u8],
    ) -> Result<usize, ParseError> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let mut i = 0;
        while i < data.len() && !self.paused && self.state != State::Upgraded {
            let before = i;
            let head = self.state.in_head();
            i = match self.step(cb, data, i) {
                Ok(next) => next,
                Err(e) => return Err(self.fail(e)),
            };
            if head {
                self.header_bytes += i - before;
                if self.header_bytes > self.max_header_size {
                    return Err(self.fail(ParseError::HeaderOverflow));
                }
            }
        }
        Ok(i)
    }

    /// The transport closed. Completes a response delimited by the end of the connection.
    pub fn finish(&mut self, cb: &mut dyn ParserCallbacks) -> Result<(), ParseError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        match self.state {
            State::Start | State::Closed | State::Upgraded => Ok(()),
            State::BodyToEof => self
                .message_complete(cb)
                .map_err(|e| self.fail(e)),
            _ => Err(self.fail(ParseError::InvalidEofState)),
        }
    }

    fn fail(&mut self, e: ParseError) -> ParseError {
        warn!("http parse error: {}", e.name());
        self.error = Some(e);
        e
    }

    fn begin_message(&mut self, cb: &mut dyn ParserCallbacks) -> Result<(), ParseError> {
        self.info = MessageInfo::default();
        self.header_bytes = 0;
        self.token_len = 0;
        self.url_seen = false;
        self.conn_close = false;
        self.conn_keep_alive = false;
        self.conn_upgrade = false;
        self.has_upgrade = false;
        self.state = match self.kind {
            ParserKind::Request => State::Method,
            ParserKind::Response => State::ResVersion,
        };
        cb.on_message_begin()
    }

    /// Append to the token buffer, failing with `err` on overflow.
    fn push_token(&mut self, bytes: &[u8], err: ParseError) -> Result<(), ParseError> {
        let end = self.token_len + bytes.len();
        if end > MAX_TOKEN {
            return Err(err);
        }
        self.token[self.token_len..end].copy_from_slice(bytes);
        self.token_len = end;
        Ok(())
    }

    fn parse_version(&mut self) -> Result<(), ParseError> {
        match &self.token[..self.token_len] {
            [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
                if major.is_ascii_digit() && minor.is_ascii_digit() =>
            {
                self.info.version_major = major - b'0';
                self.info.version_minor = minor - b'0';
                self.token_len = 0;
                Ok(())
            }
            _ => Err(ParseError::InvalidVersion),
        }
    }

    fn step(
        &mut self,
        cb: &mut dyn ParserCallbacks,
        data: &[u8],
        i: usize,
    ) -> Result<usize, ParseError> {
        let rest = &data[i..];
        match self.state {
            State::Start => {
                if rest[0] == CR || rest[0] == LF {
                    return Ok(i + 1);
                }
                self.begin_message(cb).map_err(|_| ParseError::CbMessageBegin)?;
                Ok(i)
            }

            State::Closed => {
                if rest[0] == CR || rest[0] == LF {
                    Ok(i + 1)
                } else {
                    Err(ParseError::ClosedConnection)
                }
            }

            State::Method => match rest.iter().position(|&b| b == SP) {
                Some(n) => {
                    self.push_token(&rest[..n], ParseError::InvalidMethod)?;
                    let method = Method::try_from(&self.token[..self.token_len])?;
                    self.info.method = Some(method);
                    self.token_len = 0;
                    self.state = State::Url;
                    Ok(i + n + 1)
                }
                None => {
                    self.push_token(rest, ParseError::InvalidMethod)?;
                    Ok(data.len())
                }
            },

            State::Url => {
                let end = rest
                    .iter()
                    .position(|&b| b == SP || b == CR || b == LF || b < 0x20);
                let n = end.unwrap_or(rest.len());
                if n > 0 {
                    self.url_seen = true;
                    cb.on_url(&rest[..n]).map_err(|_| ParseError::CbUrl)?;
                }
                match end {
                    Some(_) if rest[n] == SP && self.url_seen => {
                        self.state = State::ReqVersion;
                        Ok(i + n + 1)
                    }
                    Some(_) => Err(ParseError::InvalidUrl),
                    None => Ok(data.len()),
                }
            }

            State::ReqVersion => match rest.iter().position(|&b| b == CR || b == LF) {
                Some(n) => {
                    self.push_token(&rest[..n], ParseError::InvalidVersion)?;
                    self.parse_version()?;
                    self.state = if rest[n] == CR {
                        State::ReqLineLf
                    } else {
                        State::HeaderStart
                    };
                    Ok(i + n + 1)
                }
                None => {
                    self.push_token(rest, ParseError::InvalidVersion)?;
                    Ok(data.len())
                }
            },

            State::ReqLineLf | State::ResLineLf => {
                if rest[0] != LF {
                    return Err(ParseError::LfExpected);
                }
                self.state = State::HeaderStart;
                Ok(i + 1)
            }

            State::ResVersion => match rest.iter().position(|&b| b == SP) {
                Some(n) => {
                    self.push_token(&rest[..n], ParseError::InvalidVersion)?;
                    self.parse_version()?;
                    self.state = State::StatusCode;
                    Ok(i + n + 1)
                }
                None => {
                    self.push_token(rest, ParseError::InvalidVersion)?;
                    Ok(data.len())
                }
            },

            State::StatusCode => {
                let end = rest.iter().position(|&b| b == SP || b == CR || b == LF);
                let n = end.unwrap_or(rest.len());
                if !rest[..n].iter().all(u8::is_ascii_digit) {
                    return Err(ParseError::InvalidStatus);
                }
                self.push_token(&rest[..n], ParseError::InvalidStatus)?;
                let Some(_) = end else {
                    return Ok(data.len());
                };
                if self.token_len != 3 {
                    return Err(ParseError::InvalidStatus);
                }
                self.info.status = atoi(&self.token[..3])
                    .and_then(|s| u16::try_from(s).ok())
                    .ok_or(ParseError::InvalidStatus)?;
                self.token_len = 0;
                self.state = match rest[n] {
                    SP => State::Status,
                    CR => State::ResLineLf,
                    _ => State::HeaderStart,
                };
                Ok(i + n + 1)
            }

            State::Status => {
                let end = rest.iter().position(|&b| b == CR || b == LF);
                let n = end.unwrap_or(rest.len());
                if n > 0 {
                    cb.on_status(&rest[..n]).map_err(|_| ParseError::CbStatus)?;
                }
                match end {
                    Some(_) => {
                        self.state = if rest[n] == CR {
                            State::ResLineLf
                        } else {
                            State::HeaderStart
                        };
                        Ok(i + n + 1)
                    }
                    None => Ok(data.len()),
                }
            }

            State::HeaderStart => match rest[0] {
                CR => {
                    self.state = State::HeadersLf;
                    Ok(i + 1)
                }
                LF => {
                    self.headers_complete(cb)?;
                    Ok(i + 1)
                }
                b if is_token(b) => {
                    self.name_len = 0;
                    self.special = Special::None;
                    self.value.clear();
                    self.state = State::HeaderField;
                    Ok(i)
                }
                _ => Err(ParseError::InvalidHeaderToken),
            },

            State::HeaderField => {
                let end = rest.iter().position(|&b| !is_token(b));
                let n = end.unwrap_or(rest.len());
                if n > 0 {
                    self.push_name(&rest[..n]);
                    cb.on_header_field(&rest[..n])
                        .map_err(|_| ParseError::CbHeaderField)?;
                }
                match end {
                    Some(_) if rest[n] == COLON => {
                        self.special = self.classify();
                        self.state = State::HeaderValueStart;
                        Ok(i + n + 1)
                    }
                    Some(_) => Err(ParseError::InvalidHeaderToken),
                    None => Ok(data.len()),
                }
            }

            State::HeaderValueStart => {
                let n = rest.iter().take_while(|&&b| b == SP || b == HT).count();
                if n == rest.len() {
                    return Ok(data.len());
                }
                if rest[n] == CR || rest[n] == LF {
                    cb.on_header_value(&[])
                        .map_err(|_| ParseError::CbHeaderValue)?;
                }
                self.state = State::HeaderValue;
                Ok(i + n)
            }

            State::HeaderFold => {
                let n = rest.iter().take_while(|&&b| b == SP || b == HT).count();
                if n == rest.len() {
                    return Ok(data.len());
                }
                self.state = State::HeaderValue;
                Ok(i + n)
            }

            State::HeaderValue => {
                let end = rest.iter().position(|&b| b == CR || b == LF);
                let n = end.unwrap_or(rest.len());
                if n > 0 {
                    self.capture(&rest[..n]);
                    cb.on_header_value(&rest[..n])
                        .map_err(|_| ParseError::CbHeaderValue)?;
                }
                match end {
                    Some(_) => {
                        self.state = if rest[n] == CR {
                            State::HeaderValueLf
                        } else {
                            State::HeaderLineEnd
                        };
                        Ok(i + n + 1)
                    }
                    None => Ok(data.len()),
                }
            }

            State::HeaderValueLf => {
                if rest[0] != LF {
                    return Err(ParseError::LfExpected);
                }
                self.state = State::HeaderLineEnd;
                Ok(i + 1)
            }

            State::HeaderLineEnd => {
                if rest[0] == SP || rest[0] == HT {
                    self.capture(&[SP]);
                    cb.on_header_value(&[SP])
                        .map_err(|_| ParseError::CbHeaderValue)?;
                    self.state = State::HeaderFold;
                    return Ok(i + 1);
                }
                self.end_header()?;
                self.state = State::HeaderStart;
                Ok(i)
            }

            State::HeadersLf => {
                if rest[0] != LF {
                    return Err(ParseError::LfExpected);
                }
                self.headers_complete(cb)?;
                Ok(i + 1)
            }

            State::Body | State::ChunkData => {
                let n = rest.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
                cb.on_body(&rest[..n]).map_err(|_| ParseError::CbBody)?;
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    if self.state == State::Body {
                        self.message_complete(cb)?;
                    } else {
                        self.state = State::ChunkDataCr;
                    }
                }
                Ok(i + n)
            }

            State::BodyToEof => {
                cb.on_body(rest).map_err(|_| ParseError::CbBody)?;
                Ok(data.len())
            }

            State::ChunkSize => {
                let end = rest.iter().position(|&b| b == LF);
                let n = end.map_or(rest.len(), |n| n + 1);
                if self.line.len() + n > MAX_CHUNK_LINE {
                    return Err(ParseError::InvalidChunkSize);
                }
                self.line.extend_from_slice(&rest[..n]);
                if end.is_none() {
                    return Ok(data.len());
                }

                let size = match httparse::parse_chunk_size(&self.line) {
                    Ok(httparse::Status::Complete((_, size))) => size,
                    _ => return Err(ParseError::InvalidChunkSize),
                };
                self.line.clear();
                if size == 0 {
                    self.trailer_len = 0;
                    self.state = State::Trailer;
                } else {
                    self.remaining = size;
                    self.state = State::ChunkData;
                }
                Ok(i + n)
            }

            State::ChunkDataCr => match rest[0] {
                CR => {
                    self.state = State::ChunkDataLf;
                    Ok(i + 1)
                }
                LF => {
                    self.state = State::ChunkSize;
                    Ok(i + 1)
                }
                _ => Err(ParseError::InvalidChunkSize),
            },

            State::ChunkDataLf => {
                if rest[0] != LF {
                    return Err(ParseError::LfExpected);
                }
                self.state = State::ChunkSize;
                Ok(i + 1)
            }

            State::Trailer => match rest.iter().position(|&b| b == LF) {
                Some(n) => {
                    self.trailer_len += rest[..n].iter().filter(|&&b| b != CR).count();
                    if self.trailer_len == 0 {
                        self.message_complete(cb)?;
                    }
                    self.trailer_len = 0;
                    Ok(i + n + 1)
                }
                None => {
                    self.trailer_len += rest.iter().filter(|&&b| b != CR).count();
                    Ok(data.len())
                }
            },

            State::Upgraded => Ok(data.len()),
        }
    }

    fn push_name(&mut self, bytes: &[u8]) {
        let end = self.name_len + bytes.len();
        if end <= MAX_SPECIAL_NAME {
            self.name[self.name_len..end].copy_from_slice(bytes);
        }
        self.name_len = end;
    }

    fn classify(&self) -> Special {
        if self.name_len > MAX_SPECIAL_NAME {
            return Special::None;
        }
        let name = &self.name[..self.name_len];
        [
            (b"content-length".as_slice(), Special::ContentLength),
            (b"transfer-encoding".as_slice(), Special::TransferEncoding),
            (b"connection".as_slice(), Special::Connection),
            (b"upgrade".as_slice(), Special::Upgrade),
        ]
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map_or(Special::None, |(_, s)| s)
    }

    fn capture(&mut self, bytes: &[u8]) {
        if self.special == Special::None {
            return;
        }
        let room = MAX_SPECIAL_VALUE.saturating_sub(self.value.len());
        self.value.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn end_header(&mut self) -> Result<(), ParseError> {
        let value = core::str::from_utf8(&self.value).unwrap_or_default();
        match self.special {
            Special::None => {}
            Special::ContentLength => {
                let len = atoi(value.trim().as_bytes()).ok_or(ParseError::InvalidContentLength)?;
                match self.info.content_length {
                    Some(prev) if prev != len => return Err(ParseError::UnexpectedContentLength),
                    _ => self.info.content_length = Some(len),
                }
            }
            Special::TransferEncoding => {
                self.info.chunked = value
                    .rsplit(',')
                    .next()
                    .is_some_and(|t| t.trim().eq_ignore_ascii_case("chunked"));
            }
            Special::Connection => {
                self.conn_close |= has_token(value, "close");
                self.conn_keep_alive |= has_token(value, "keep-alive");
                self.conn_upgrade |= has_token(value, "upgrade");
            }
            Special::Upgrade => self.has_upgrade = true,
        }
        self.special = Special::None;
        self.value.clear();
        Ok(())
    }

    fn headers_complete(&mut self, cb: &mut dyn ParserCallbacks) -> Result<(), ParseError> {
        let info = &mut self.info;
        info.keep_alive = if (info.version_major, info.version_minor) >= (1, 1) {
            !self.conn_close
        } else {
            self.conn_keep_alive
        };
        info.upgrade = match self.kind {
            ParserKind::Request => {
                (self.has_upgrade && self.conn_upgrade) || info.method == Some(Method::CONNECT)
            }
            ParserKind::Response => info.status == 101,
        };
        if info.chunked {
            info.content_length = None;
        }

        let action = cb
            .on_headers_complete(&self.info)
            .map_err(|_| ParseError::CbHeadersComplete)?;
        if action == HeadersAction::SkipBodyAndClose {
            self.info.upgrade = true;
        }
        if self.info.upgrade || action != HeadersAction::Continue {
            return self.message_complete(cb);
        }

        self.state = match (self.info.chunked, self.info.content_length) {
            (true, _) => State::ChunkSize,
            (false, Some(0)) => return self.message_complete(cb),
            (false, Some(len)) => {
                self.remaining = len;
                State::Body
            }
            (false, None) => match self.kind {
                ParserKind::Request => return self.message_complete(cb),
                ParserKind::Response if StatusCode::from(self.info.status).forbids_body() => {
                    return self.message_complete(cb);
                }
                ParserKind::Response => {
                    self.info.keep_alive = false;
                    State::BodyToEof
                }
            },
        };
        Ok(())
    }

    fn message_complete(&mut self, cb: &mut dyn ParserCallbacks) -> Result<(), ParseError> {
        let flow = cb
            .on_message_complete(&self.info)
            .map_err(|_| ParseError::CbMessageComplete)?;
        self.state = if self.info.upgrade {
            State::Upgraded
        } else if self.info.keep_alive {
            State::Start
        } else {
            State::Closed
        };
        if flow == Flow::Pause {
            self.paused = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::String;
    use std::vec;
    use std::vec::Vec;

    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Message {
        url: String,
        status: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        info: MessageInfo,
    }

    #[derive(Default)]
    struct Recorder {
        messages: Vec<Message>,
        in_value: bool,
        action: Option<HeadersAction>,
        pause: bool,
        fail_body: bool,
    }

    impl Recorder {
        fn current(&mut self) -> &mut Message {
            self.messages.last_mut().unwrap()
        }
    }

    impl ParserCallbacks for Recorder {
        fn on_message_begin(&mut self) -> Result<(), ParseError> {
            self.messages.push(Message::default());
            self.in_value = false;
            Ok(())
        }

        fn on_url(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
            self.current().url.push_str(core::str::from_utf8(fragment).unwrap());
            Ok(())
        }

        fn on_status(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
            self.current().status.push_str(core::str::from_utf8(fragment).unwrap());
            Ok(())
        }

        fn on_header_field(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
            let s = core::str::from_utf8(fragment).unwrap();
            if self.in_value || self.current().headers.is_empty() {
                self.current().headers.push((String::from(s), String::new()));
            } else {
                self.current().headers.last_mut().unwrap().0.push_str(s);
            }
            self.in_value = false;
            Ok(())
        }

        fn on_header_value(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
            let s = core::str::from_utf8(fragment).unwrap();
            self.current().headers.last_mut().unwrap().1.push_str(s);
            self.in_value = true;
            Ok(())
        }

        fn on_headers_complete(&mut self, info: &MessageInfo) -> Result<HeadersAction, ParseError> {
            self.current().info = *info;
            Ok(self.action.unwrap_or(HeadersAction::Continue))
        }

        fn on_body(&mut self, data: &[u8]) -> Result<(), ParseError> {
            if self.fail_body {
                return Err(ParseError::CbBody);
            }
            self.current().body.extend_from_slice(data);
            Ok(())
        }

        fn on_message_complete(&mut self, _info: &MessageInfo) -> Result<Flow, ParseError> {
            Ok(if self.pause { Flow::Pause } else { Flow::Continue })
        }
    }

    fn parse_all(kind: ParserKind, data: &[u8]) -> (Parser, Recorder) {
        let mut parser = Parser::new(kind, 4096);
        let mut rec = Recorder::default();
        assert_eq!(parser.execute(&mut rec, data), Ok(data.len()));
        (parser, rec)
    }

    const REQUEST: &[u8] = b"POST /form?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\nX-Empty:\r\n\r\nhello";

    #[test]
    fn test_request() {
        let (parser, rec) = parse_all(ParserKind::Request, REQUEST);
        assert!(parser.is_idle());
        let msg = &rec.messages[0];
        assert_eq!(msg.url, "/form?x=1");
        assert_eq!(
            msg.headers,
            vec![
                ("Host".into(), "example.com".into()),
                ("Content-Length".into(), "5".into()),
                ("X-Empty".into(), "".into()),
            ]
        );
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.info.method, Some(Method::POST));
        assert_eq!(msg.info.content_length, Some(5));
        assert!(msg.info.keep_alive);
    }

    #[test]
    fn test_byte_by_byte() {
        let (_, whole) = parse_all(ParserKind::Request, REQUEST);
        let mut parser = Parser::new(ParserKind::Request, 4096);
        let mut rec = Recorder::default();
        for b in REQUEST {
            assert_eq!(parser.execute(&mut rec, core::slice::from_ref(b)), Ok(1));
        }
        assert_eq!(rec.messages, whole.messages);
    }

    #[test]
    fn test_response_and_folding() {
        let data = b"HTTP/1.1 404 Not Found\r\nX-Long: a\r\n  b\r\nContent-Length: 2\r\n\r\nno";
        let (_, rec) = parse_all(ParserKind::Response, data);
        let msg = &rec.messages[0];
        assert_eq!(msg.status, "Not Found");
        assert_eq!(msg.info.status, 404);
        assert_eq!(msg.headers[0], ("X-Long".into(), "a b".into()));
        assert_eq!(msg.body, b"no");
    }

    #[test]
    fn test_chunked_with_trailer() {
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n1\r\n!\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let (parser, rec) = parse_all(ParserKind::Response, data);
        assert!(parser.is_idle());
        assert_eq!(rec.messages[0].body, b"hello!");
        assert!(rec.messages[0].info.chunked);
    }

    #[test]
    fn test_body_until_eof() {
        let mut parser = Parser::new(ParserKind::Response, 4096);
        let mut rec = Recorder::default();
        parser
            .execute(&mut rec, b"HTTP/1.0 200 OK\r\n\r\nsome")
            .unwrap();
        parser.execute(&mut rec, b" data").unwrap();
        assert!(!parser.is_idle());
        parser.finish(&mut rec).unwrap();
        assert_eq!(rec.messages[0].body, b"some data");
        assert!(!rec.messages[0].info.keep_alive);
    }

    #[test]
    fn test_truncated_message() {
        let mut parser = Parser::new(ParserKind::Response, 4096);
        let mut rec = Recorder::default();
        parser
            .execute(&mut rec, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .unwrap();
        assert_eq!(parser.finish(&mut rec), Err(ParseError::InvalidEofState));
    }

    #[test]
    fn test_no_body_statuses() {
        let (parser, rec) = parse_all(ParserKind::Response, b"HTTP/1.1 304 Not Modified\r\nETag: \"x\"\r\n\r\n");
        assert!(parser.is_idle());
        assert_eq!(rec.messages.len(), 1);
    }

    #[test]
    fn test_skip_body_for_head() {
        let mut parser = Parser::new(ParserKind::Response, 4096);
        let mut rec = Recorder {
            action: Some(HeadersAction::SkipBody),
            ..Default::default()
        };
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        assert_eq!(parser.execute(&mut rec, data), Ok(data.len()));
        assert_eq!(rec.messages.len(), 2);
        assert!(rec.messages[0].body.is_empty());
    }

    #[test]
    fn test_pipelined_requests() {
        let data = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let (_, rec) = parse_all(ParserKind::Request, data);
        let urls: Vec<&str> = rec.messages.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(urls, vec!["/a", "/b"]);
    }

    #[test]
    fn test_pause() {
        let data = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut parser = Parser::new(ParserKind::Request, 4096);
        let mut rec = Recorder {
            pause: true,
            ..Default::default()
        };
        let n = parser.execute(&mut rec, data).unwrap();
        assert_eq!(n, 19);
        assert!(parser.is_paused());
        assert_eq!(parser.execute(&mut rec, &data[n..]), Ok(0));
        parser.resume();
        assert_eq!(parser.execute(&mut rec, &data[n..]), Ok(data.len() - n));
        assert_eq!(rec.messages.len(), 2);
    }

    #[test]
    fn test_upgrade_stops_parsing() {
        let head = b"GET /ws HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let mut data = head.to_vec();
        data.extend_from_slice(&[0x81, 0x00]);
        let mut parser = Parser::new(ParserKind::Request, 4096);
        let mut rec = Recorder::default();
        assert_eq!(parser.execute(&mut rec, &data), Ok(head.len()));
        assert!(parser.is_upgrade());
        assert!(rec.messages[0].info.upgrade);
        assert_eq!(parser.execute(&mut rec, &data[head.len()..]), Ok(0));
    }

    #[test]
    fn test_connection_close() {
        let data = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let (mut parser, mut rec) = parse_all(ParserKind::Request, data);
        assert!(!rec.messages[0].info.keep_alive);
        assert_eq!(
            parser.execute(&mut rec, b"GET / HTTP/1.1\r\n\r\n"),
            Err(ParseError::ClosedConnection)
        );
    }

    #[test]
    fn test_http10_keep_alive() {
        let (_, rec) = parse_all(ParserKind::Request, b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(rec.messages[0].info.keep_alive);
        let (_, rec) = parse_all(ParserKind::Request, b"GET / HTTP/1.0\r\n\r\n");
        assert!(!rec.messages[0].info.keep_alive);
    }

    #[test]
    fn test_errors_are_sticky() {
        let mut parser = Parser::new(ParserKind::Request, 4096);
        let mut rec = Recorder::default();
        assert_eq!(
            parser.execute(&mut rec, b"FETCH / HTTP/1.1\r\n"),
            Err(ParseError::InvalidMethod)
        );
        assert_eq!(
            parser.execute(&mut rec, b"GET / HTTP/1.1\r\n"),
            Err(ParseError::InvalidMethod)
        );
        parser.reset();
        assert!(parser.execute(&mut rec, b"GET / HTTP/1.1\r\n").is_ok());
    }

    #[test]
    fn test_malformed_input() {
        let cases: [(&[u8], ParseError); 6] = [
            (b"GET / HTTX/1.1\r\n", ParseError::InvalidVersion),
            (b"GET /\r\n", ParseError::InvalidUrl),
            (b"GET / HTTP/1.1\r\nBad Header: x\r\n", ParseError::InvalidHeaderToken),
            (b"GET / HTTP/1.1\r\nContent-Length: 1x\r\n\r\n", ParseError::InvalidContentLength),
            (
                b"GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
                ParseError::UnexpectedContentLength,
            ),
            (b"GET / HTTP/1.1\rX", ParseError::LfExpected),
        ];
        for (data, err) in cases {
            let mut parser = Parser::new(ParserKind::Request, 4096);
            assert_eq!(parser.execute(&mut Recorder::default(), data), Err(err));
        }

        let mut parser = Parser::new(ParserKind::Response, 4096);
        assert_eq!(
            parser.execute(&mut Recorder::default(), b"HTTP/1.1 20 OK\r\n"),
            Err(ParseError::InvalidStatus)
        );
        let mut parser = Parser::new(ParserKind::Response, 4096);
        assert_eq!(
            parser.execute(
                &mut Recorder::default(),
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"
            ),
            Err(ParseError::InvalidChunkSize)
        );
    }

    #[test]
    fn test_header_overflow() {
        let mut parser = Parser::new(ParserKind::Request, 32);
        let mut rec = Recorder::default();
        assert_eq!(
            parser.execute(&mut rec, b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaa\r\n\r\n"),
            Err(ParseError::HeaderOverflow)
        );
    }

    #[test]
    fn test_callback_failure() {
        let mut parser = Parser::new(ParserKind::Request, 4096);
        let mut rec = Recorder {
            fail_body: true,
            ..Default::default()
        };
        assert_eq!(parser.execute(&mut rec, REQUEST), Err(ParseError::CbBody));
        assert_eq!(parser.error(), Some(ParseError::CbBody));
        assert_eq!(ParseError::CbBody.name(), "HPE_CB_body");
    }
}
