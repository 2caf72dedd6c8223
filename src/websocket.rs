//! Websockets over an upgraded HTTP connection.
//!
//! A connection becomes a websocket when an HTTP request is "upgraded": the server answers
//! `101 Switching Protocols` and from then on both sides exchange frames instead of HTTP
//! messages. Once upgraded, it cannot be downgraded.
//!
//! For more info:
//!
//! * <https://developer.mozilla.org/en-US/docs/Web/API/WebSockets_API/Writing_WebSocket_servers>
//! * <https://www.rfc-editor.org/rfc/rfc6455>
//!
//! On the server, register a [`WebsocketResource`] and implement [`WebsocketHandler`] for the
//! application:
//!
//! ```
//! use std::rc::Rc;
//!
//! use httpflow::config::{HttpServerConfig, WebsocketConfig};
//! use httpflow::server::HttpServer;
//! use httpflow::websocket::{WebsocketConnection, WebsocketHandler, WebsocketList, WebsocketResource};
//!
//! struct Chat;
//!
//! impl WebsocketHandler for Chat {
//!     fn on_message(&self, ws: &WebsocketConnection, text: &str) {
//!         if text == "ping" {
//!             let _ = ws.send_text("pong");
//!         }
//!     }
//! }
//!
//! let clients = WebsocketList::default();
//! let server = HttpServer::new(HttpServerConfig::default());
//! server.add_resource(
//!     "/ws",
//!     Rc::new(WebsocketResource::new(Rc::new(Chat), WebsocketConfig::default()).with_list(clients.clone())),
//! );
//! clients.broadcast_text("hello everyone");
//! ```
//!
//! Frames sent from outside a connection event, such as a broadcast, are queued and go out on the
//! connection's next event.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::{Rc, Weak};
use alloc::string::String;
use alloc::vec::Vec;
use core::any::Any;
use core::cell::{Cell, RefCell};
use core::fmt::{Display, Formatter};

use base64ct::{Base64, Encoding};
use rand_core::RngCore;
use sha1::{Digest, Sha1};

use crate::client::{ClientError, ClientState, ConnectionEvent, Transmit};
use crate::config::{HttpClientConfig, WebsocketConfig};
use crate::endpoint::Protocol;
use crate::header::HeaderField;
use crate::http_client::HttpClientConnection;
use crate::request::{Method, Request, Uri};
use crate::response::{Response, StatusCode};
use crate::server::{HandlerError, HttpResource};
use crate::stream::{DataSource, MemoryStream, XorStream, apply_mask};
use crate::transport::TransportError;

const SEC_WEBSOCKET_ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const WEBSOCKET_VERSION: &str = "13";

/// Close status: normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Close status: protocol error
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut key_hasher = Sha1::new();
    key_hasher.update(key.trim().as_bytes());
    key_hasher.update(SEC_WEBSOCKET_ACCEPT_MAGIC.as_bytes());
    Base64::encode_string(&key_hasher.finalize())
}

/// A random `Sec-WebSocket-Key`.
pub fn generate_key(rng: &mut dyn RngCore) -> String {
    let mut raw = [0u8; 16];
    rng.fill_bytes(&mut raw);
    Base64::encode_string(&raw)
}

/// Errors raised while handling a websocket connection.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WebsocketError {
    /// A reserved header bit was set without a negotiated extension
    ReservedBitsSet,
    /// An opcode outside the defined set
    InvalidOpcode(u8),
    /// A continuation frame without a message to continue, or a new message inside a
    /// fragmented one
    InvalidContinuation,
    /// A control frame without FIN
    FragmentedControl,
    /// A control frame payload over 125 bytes
    ControlTooLong,
    /// A length not in its shortest encoding
    NonCanonicalLength,
    /// A client frame without a mask
    UnmaskedFrame,
    /// The reassembled message exceeds the configured limit
    MessageTooLarge,
    /// A text message that is not UTF-8
    InvalidText,
    /// A payload whose length is not known up front
    UnknownLength,
    /// The connection is not open
    NotOpen,
    /// The upgrade handshake was refused or did not verify
    HandshakeFailed,
}

impl Display for WebsocketError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ReservedBitsSet => f.write_str("reserved bits set"),
            Self::InvalidOpcode(op) => write!(f, "invalid opcode {op}"),
            Self::InvalidContinuation => f.write_str("unexpected continuation"),
            Self::FragmentedControl => f.write_str("fragmented control frame"),
            Self::ControlTooLong => f.write_str("control frame too long"),
            Self::NonCanonicalLength => f.write_str("non canonical payload length"),
            Self::UnmaskedFrame => f.write_str("client frame not masked"),
            Self::MessageTooLarge => f.write_str("message too large"),
            Self::InvalidText => f.write_str("text message is not UTF-8"),
            Self::UnknownLength => f.write_str("payload length unknown"),
            Self::NotOpen => f.write_str("websocket not open"),
            Self::HandshakeFailed => f.write_str("handshake failed"),
        }
    }
}

impl core::error::Error for WebsocketError {}

/// Frame type.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    /// Continues a fragmented message
    Continuation = 0,
    /// UTF-8 text
    Text = 1,
    /// Binary data
    Binary = 2,
    /// Close handshake
    Close = 8,
    /// Ping
    Ping = 9,
    /// Pong
    Pong = 10,
}

impl Opcode {
    /// `true` for close, ping and pong.
    pub fn is_control(&self) -> bool {
        (*self as u8) & 0x08 != 0
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WebsocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Continuation),
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            8 => Ok(Self::Close),
            9 => Ok(Self::Ping),
            10 => Ok(Self::Pong),
            other => Err(WebsocketError::InvalidOpcode(other)),
        }
    }
}

/// Encodes and decodes frame headers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameHeader {
    /// Last frame of a message
    pub fin: bool,
    /// Frame type
    pub opcode: Opcode,
    /// Masking key
    pub mask: Option<[u8; 4]>,
    /// Payload length
    pub len: u64,
}

/// Longest possible header.
pub const MAX_HEADER_LEN: usize = 14;

fn header_len(head: &[u8; MAX_HEADER_LEN]) -> usize {
    let ext = match head[1] & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask = if head[1] & 0x80 != 0 { 4 } else { 0 };
    2 + ext + mask
}

impl FrameHeader {
    fn decode(value: &[u8]) -> Result<Self, WebsocketError> {
        if value[0] & 0x70 != 0 {
            return Err(WebsocketError::ReservedBitsSet);
        }
        let fin = value[0] & 0x80 != 0;
        let opcode = Opcode::try_from(value[0] & 0x0F)?;
        let masked = value[1] & 0x80 != 0;

        let (len, mask_offset) = match value[1] & 0x7F {
            126 => {
                let len = u16::from_be_bytes([value[2], value[3]]) as u64;
                if len < 126 {
                    return Err(WebsocketError::NonCanonicalLength);
                }
                (len, 4)
            }
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&value[2..10]);
                let len = u64::from_be_bytes(raw);
                if len <= u16::MAX as u64 || len >> 63 != 0 {
                    return Err(WebsocketError::NonCanonicalLength);
                }
                (len, 10)
            }
            len => (len as u64, 2),
        };

        let mask = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&value[mask_offset..mask_offset + 4]);
            Some(key)
        } else {
            None
        };

        if opcode.is_control() {
            if !fin {
                return Err(WebsocketError::FragmentedControl);
            }
            if len > 125 {
                return Err(WebsocketError::ControlTooLong);
            }
        }

        Ok(Self {
            fin,
            opcode,
            mask,
            len,
        })
    }

    /// Write the header into `dest`, returning its length. The shortest length encoding is used:
    /// up to 125 inline, up to 65535 in 16 bits, 64 bits beyond.
    pub fn encode(&self, dest: &mut [u8; MAX_HEADER_LEN]) -> usize {
        *dest = [0; MAX_HEADER_LEN];

        // fin 1 MSB byte 1, opcode 4 LSB bits
        if self.fin {
            dest[0] |= 0b1000_0000;
        }
        dest[0] |= self.opcode as u8 & 0b0000_1111;

        // masked 1 MSB byte 2
        if self.mask.is_some() {
            dest[1] |= 0b1000_0000;
        }

        let mut mask_offset = 2;
        if self.len <= 125 {
            dest[1] |= self.len as u8;
        } else if self.len <= u16::MAX as u64 {
            dest[1] |= 126;
            [dest[2], dest[3]] = (self.len as u16).to_be_bytes();
            mask_offset = 4;
        } else {
            dest[1] |= 127;
            dest[2..10].copy_from_slice(&self.len.to_be_bytes());
            mask_offset = 10;
        }

        if let Some(mask) = self.mask {
            dest[mask_offset..mask_offset + 4].copy_from_slice(&mask);
            return mask_offset + 4;
        }
        mask_offset
    }
}

/// What the [`FrameParser`] found.
#[derive(Debug, PartialEq)]
pub enum FrameEvent<'a> {
    /// A frame header
    Begin(FrameHeader),
    /// Unmasked payload bytes of the current frame
    Payload(&'a [u8]),
    /// The current frame is complete
    End(FrameHeader),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum FrameState {
    Header,
    Payload {
        header: FrameHeader,
        remaining: u64,
        offset: usize,
    },
}

/// Incremental frame parser. Input can be split at any byte.
pub struct FrameParser {
    state: FrameState,
    head: [u8; MAX_HEADER_LEN],
    have: usize,
    require_mask: bool,
    fragmented: bool,
    scratch: Vec<u8>,
    error: Option<WebsocketError>,
}

impl FrameParser {
    /// New parser. A server parser rejects unmasked frames.
    pub fn new(require_mask: bool) -> Self {
        Self {
            state: FrameState::Header,
            head: [0; MAX_HEADER_LEN],
            have: 0,
            require_mask,
            fragmented: false,
            scratch: Vec::new(),
            error: None,
        }
    }

    /// The error that stopped the parser.
    pub fn error(&self) -> Option<WebsocketError> {
        self.error
    }

    /// Parse `data`, reporting each piece to `f`. Errors are sticky.
    pub fn parse(
        &mut self,
        data: &[u8],
        f: &mut dyn FnMut(FrameEvent<'_>) -> Result<(), WebsocketError>,
    ) -> Result<(), WebsocketError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.run(data, f).inspect_err(|e| self.error = Some(*e))
    }

    fn run(
        &mut self,
        data: &[u8],
        f: &mut dyn FnMut(FrameEvent<'_>) -> Result<(), WebsocketError>,
    ) -> Result<(), WebsocketError> {
        let mut i = 0;
        while i < data.len() {
            match self.state {
                FrameState::Header => {
                    let need = if self.have < 2 { 2 } else { header_len(&self.head) };
                    let take = (need - self.have).min(data.len() - i);
                    self.head[self.have..self.have + take].copy_from_slice(&data[i..i + take]);
                    self.have += take;
                    i += take;
                    if self.have < 2 || self.have < header_len(&self.head) {
                        continue;
                    }

                    let header = FrameHeader::decode(&self.head[..self.have])?;
                    self.have = 0;
                    self.check(&header)?;
                    trace!("frame {:?} len {}", header.opcode, header.len);
                    f(FrameEvent::Begin(header))?;
                    if header.len == 0 {
                        f(FrameEvent::End(header))?;
                    } else {
                        self.state = FrameState::Payload {
                            header,
                            remaining: header.len,
                            offset: 0,
                        };
                    }
                }
                FrameState::Payload {
                    header,
                    remaining,
                    offset,
                } => {
                    let take = (data.len() - i).min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    self.scratch.clear();
                    self.scratch.extend_from_slice(&data[i..i + take]);
                    if let Some(mask) = header.mask {
                        apply_mask(&mut self.scratch, mask, offset % 4);
                    }
                    f(FrameEvent::Payload(&self.scratch))?;
                    i += take;

                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.state = FrameState::Header;
                        f(FrameEvent::End(header))?;
                    } else {
                        self.state = FrameState::Payload {
                            header,
                            remaining,
                            offset: offset + take,
                        };
                    }
                }
            }
        }
        Ok(())
    }

    fn check(&mut self, header: &FrameHeader) -> Result<(), WebsocketError> {
        if self.require_mask && header.mask.is_none() {
            return Err(WebsocketError::UnmaskedFrame);
        }
        match header.opcode {
            Opcode::Continuation if !self.fragmented => Err(WebsocketError::InvalidContinuation),
            Opcode::Continuation => {
                self.fragmented = !header.fin;
                Ok(())
            }
            Opcode::Text | Opcode::Binary if self.fragmented => {
                Err(WebsocketError::InvalidContinuation)
            }
            Opcode::Text | Opcode::Binary => {
                self.fragmented = !header.fin;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Lifecycle of a websocket.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WebsocketState {
    /// Handshake in progress
    Connecting,
    /// Frames flow both ways
    Open,
    /// A close frame has been sent or received
    Closing,
    /// Gone
    Closed,
}

/// Application callbacks for websocket connections.
pub trait WebsocketHandler {
    /// The connection is open.
    fn on_connected(&self, ws: &WebsocketConnection) {
        let _ = ws;
    }

    /// A text message arrived.
    fn on_message(&self, ws: &WebsocketConnection, text: &str) {
        let _ = (ws, text);
    }

    /// A binary message arrived.
    fn on_binary(&self, ws: &WebsocketConnection, data: &[u8]) {
        let _ = (ws, data);
    }

    /// A pong arrived.
    fn on_pong(&self, ws: &WebsocketConnection, data: &[u8]) {
        let _ = (ws, data);
    }

    /// The connection is gone. Called once.
    fn on_disconnected(&self, ws: &WebsocketConnection) {
        let _ = ws;
    }
}

enum Incoming {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Vec<u8>),
}

struct Inner {
    state: WebsocketState,
    config: WebsocketConfig,
    rng: Option<Box<dyn RngCore>>,
    parser: FrameParser,
    message: Vec<u8>,
    message_opcode: Opcode,
    control: Vec<u8>,
    outbox: VecDeque<(Box<dyn DataSource>, bool)>,
    user_data: Option<Rc<dyn Any>>,
    disconnected: bool,
}

impl Inner {
    fn queue(
        &mut self,
        opcode: Opcode,
        payload: Box<dyn DataSource>,
        close_after: bool,
    ) -> Result<(), WebsocketError> {
        let len = payload.available().ok_or(WebsocketError::UnknownLength)?;
        let mask = match self.rng.as_mut() {
            Some(rng) => {
                let mut key = [0u8; 4];
                rng.fill_bytes(&mut key);
                Some(key)
            }
            None => None,
        };
        let header = FrameHeader {
            fin: true,
            opcode,
            mask,
            len: len as u64,
        };
        let mut head = [0u8; MAX_HEADER_LEN];
        let n = header.encode(&mut head);
        self.outbox
            .push_back((Box::new(MemoryStream::from(&head[..n])), false));
        let payload = match mask {
            Some(mask) => Box::new(XorStream::new(payload, mask)) as Box<dyn DataSource>,
            None => payload,
        };
        self.outbox.push_back((payload, close_after));
        Ok(())
    }

    fn receive(&mut self, data: &[u8]) -> Result<Vec<Incoming>, WebsocketError> {
        let Inner {
            parser,
            message,
            message_opcode,
            control,
            config,
            ..
        } = self;
        let mut incoming = Vec::new();
        let mut current = Opcode::Continuation;

        parser.parse(data, &mut |event| {
            match event {
                FrameEvent::Begin(header) => {
                    current = header.opcode;
                    match header.opcode {
                        Opcode::Text | Opcode::Binary => {
                            message.clear();
                            *message_opcode = header.opcode;
                        }
                        Opcode::Continuation => {}
                        _ => control.clear(),
                    }
                    if !header.opcode.is_control()
                        && message.len() as u64 + header.len > config.max_message_size as u64
                    {
                        return Err(WebsocketError::MessageTooLarge);
                    }
                }
                FrameEvent::Payload(bytes) => {
                    if current.is_control() {
                        control.extend_from_slice(bytes);
                    } else {
                        message.extend_from_slice(bytes);
                    }
                }
                FrameEvent::End(header) => match header.opcode {
                    Opcode::Ping => incoming.push(Incoming::Ping(core::mem::take(control))),
                    Opcode::Pong => incoming.push(Incoming::Pong(core::mem::take(control))),
                    Opcode::Close => incoming.push(Incoming::Close(core::mem::take(control))),
                    _ if header.fin => {
                        let data = core::mem::take(message);
                        if *message_opcode == Opcode::Text {
                            let text =
                                String::from_utf8(data).map_err(|_| WebsocketError::InvalidText)?;
                            incoming.push(Incoming::Text(text));
                        } else {
                            incoming.push(Incoming::Binary(data));
                        }
                    }
                    _ => {}
                },
            }
            Ok(())
        })?;
        Ok(incoming)
    }
}

/// Handle to one websocket. Clones refer to the same connection.
#[derive(Clone)]
pub struct WebsocketConnection {
    inner: Rc<RefCell<Inner>>,
}

impl WebsocketConnection {
    fn new(config: WebsocketConfig, rng: Option<Box<dyn RngCore>>) -> Self {
        let is_client = rng.is_some();
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: WebsocketState::Connecting,
                config,
                rng,
                parser: FrameParser::new(!is_client),
                message: Vec::new(),
                message_opcode: Opcode::Binary,
                control: Vec::new(),
                outbox: VecDeque::new(),
                user_data: None,
                disconnected: false,
            })),
        }
    }

    /// Server side connection. Frames are sent unmasked and must arrive masked.
    pub fn server(config: WebsocketConfig) -> Self {
        Self::new(config, None)
    }

    /// Client side connection. Every frame sent is masked with a key from `rng`.
    pub fn client(config: WebsocketConfig, rng: Box<dyn RngCore>) -> Self {
        Self::new(config, Some(rng))
    }

    /// Current state.
    pub fn state(&self) -> WebsocketState {
        self.inner.borrow().state
    }

    /// `true` while frames may be sent.
    pub fn is_open(&self) -> bool {
        self.state() == WebsocketState::Open
    }

    /// `true` if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &WebsocketConnection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach application data.
    pub fn set_user_data(&self, data: Rc<dyn Any>) {
        self.inner.borrow_mut().user_data = Some(data);
    }

    /// Application data, if attached.
    pub fn user_data(&self) -> Option<Rc<dyn Any>> {
        self.inner.borrow().user_data.clone()
    }

    /// Send a text message.
    pub fn send_text(&self, text: &str) -> Result<(), WebsocketError> {
        self.send(Opcode::Text, Box::new(MemoryStream::from(text)))
    }

    /// Send a binary message.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WebsocketError> {
        self.send(Opcode::Binary, Box::new(MemoryStream::from(data)))
    }

    /// Send a message from a stream of known length.
    pub fn send(&self, opcode: Opcode, payload: Box<dyn DataSource>) -> Result<(), WebsocketError> {
        let mut inner = self.inner.borrow_mut();
        if inner.state != WebsocketState::Open {
            return Err(WebsocketError::NotOpen);
        }
        inner.queue(opcode, payload, false)
    }

    /// Send a ping.
    pub fn ping(&self, payload: &[u8]) -> Result<(), WebsocketError> {
        if payload.len() > 125 {
            return Err(WebsocketError::ControlTooLong);
        }
        self.send(Opcode::Ping, Box::new(MemoryStream::from(payload)))
    }

    /// Start the close handshake with status 1000. Does nothing unless the connection is open.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state != WebsocketState::Open {
            return;
        }
        debug!("websocket closing");
        inner.state = WebsocketState::Closing;
        let payload = CLOSE_NORMAL.to_be_bytes();
        if let Err(e) = inner.queue(Opcode::Close, Box::new(MemoryStream::from(&payload[..])), true) {
            warn!("cannot queue close: {:?}", e);
        }
    }

    fn flush(&self, tx: &mut dyn Transmit) {
        let mut inner = self.inner.borrow_mut();
        while let Some((stream, close_after)) = inner.outbox.pop_front() {
            if let Err(e) = tx.send(stream, close_after) {
                warn!("websocket send failed: {:?}", e);
                inner.outbox.clear();
                return;
            }
        }
    }

    fn weak(&self) -> Weak<RefCell<Inner>> {
        Rc::downgrade(&self.inner)
    }
}

/// Registry of open websockets, for broadcasting.
#[derive(Clone, Default)]
pub struct WebsocketList {
    items: Rc<RefCell<Vec<Weak<RefCell<Inner>>>>>,
}

impl WebsocketList {
    /// Add a connection.
    pub fn add(&self, ws: &WebsocketConnection) {
        self.items.borrow_mut().push(ws.weak());
    }

    /// Remove a connection.
    pub fn remove(&self, ws: &WebsocketConnection) {
        self.items
            .borrow_mut()
            .retain(|w| w.strong_count() > 0 && !core::ptr::eq(w.as_ptr(), Rc::as_ptr(&ws.inner)));
    }

    /// Live connections.
    pub fn connections(&self) -> Vec<WebsocketConnection> {
        let mut items = self.items.borrow_mut();
        items.retain(|w| w.strong_count() > 0);
        items
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|inner| WebsocketConnection { inner })
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections().len()
    }

    /// `true` without live connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `text` to every open connection, returning how many took it. Each recipient gets its
    /// own frame.
    pub fn broadcast_text(&self, text: &str) -> usize {
        self.connections()
            .iter()
            .filter(|ws| ws.send_text(text).is_ok())
            .count()
    }

    /// Send `data` to every open connection, returning how many took it.
    pub fn broadcast_binary(&self, data: &[u8]) -> usize {
        self.connections()
            .iter()
            .filter(|ws| ws.send_binary(data).is_ok())
            .count()
    }
}

/// The [`Protocol`] running a websocket after the handshake.
pub struct WebsocketSession {
    ws: WebsocketConnection,
    handler: Rc<dyn WebsocketHandler>,
    list: Option<WebsocketList>,
}

impl WebsocketSession {
    /// Session for `ws`.
    pub fn new(ws: WebsocketConnection, handler: Rc<dyn WebsocketHandler>, list: Option<WebsocketList>) -> Self {
        Self { ws, handler, list }
    }

    /// The connection.
    pub fn connection(&self) -> &WebsocketConnection {
        &self.ws
    }

    fn dispatch(&mut self, tx: &mut dyn Transmit, message: Incoming) -> Result<(), WebsocketError> {
        match message {
            Incoming::Text(text) => self.handler.on_message(&self.ws, &text),
            Incoming::Binary(data) => self.handler.on_binary(&self.ws, &data),
            Incoming::Pong(data) => self.handler.on_pong(&self.ws, &data),
            Incoming::Ping(data) => {
                trace!("ping, {} bytes", data.len());
                let mut inner = self.ws.inner.borrow_mut();
                if inner.state == WebsocketState::Open {
                    inner.queue(Opcode::Pong, Box::new(MemoryStream::from(data)), false)?;
                }
            }
            Incoming::Close(data) => {
                let mut inner = self.ws.inner.borrow_mut();
                if inner.state == WebsocketState::Open {
                    debug!("websocket closed by peer");
                    inner.state = WebsocketState::Closing;
                    inner.queue(Opcode::Close, Box::new(MemoryStream::from(data)), true)?;
                } else {
                    drop(inner);
                    tx.close();
                }
            }
        }
        Ok(())
    }

    fn disconnected(&mut self) {
        let first = {
            let mut inner = self.ws.inner.borrow_mut();
            inner.state = WebsocketState::Closed;
            inner.outbox.clear();
            !core::mem::replace(&mut inner.disconnected, true)
        };
        if first {
            if let Some(list) = &self.list {
                list.remove(&self.ws);
            }
            self.handler.on_disconnected(&self.ws);
        }
    }
}

impl Protocol for WebsocketSession {
    fn on_connected(&mut self, tx: &mut dyn Transmit) -> Result<(), HandlerError> {
        self.ws.inner.borrow_mut().state = WebsocketState::Open;
        if let Some(list) = &self.list {
            list.add(&self.ws);
        }
        info!("websocket open");
        self.handler.on_connected(&self.ws);
        self.ws.flush(tx);
        Ok(())
    }

    fn on_receive(&mut self, tx: &mut dyn Transmit, data: &[u8]) -> Result<(), HandlerError> {
        let incoming = self.ws.inner.borrow_mut().receive(data);
        let incoming = incoming.inspect_err(|e| warn!("websocket error: {:?}", e))?;
        for message in incoming {
            self.dispatch(tx, message)?;
        }
        self.ws.flush(tx);
        Ok(())
    }

    fn on_ready_to_send(&mut self, tx: &mut dyn Transmit, _event: ConnectionEvent) {
        self.ws.flush(tx);
    }

    fn on_error(&mut self, err: TransportError) {
        warn!("websocket transport error: {:?}", err);
    }

    fn on_finished(&mut self, state: ClientState) {
        debug!("websocket finished: {:?}", state);
        self.disconnected();
    }
}

/// Server resource accepting websocket upgrades.
pub struct WebsocketResource {
    handler: Rc<dyn WebsocketHandler>,
    config: WebsocketConfig,
    list: Option<WebsocketList>,
    protocol: Option<&'static str>,
}

impl WebsocketResource {
    /// Resource running `handler` for every accepted connection.
    pub fn new(handler: Rc<dyn WebsocketHandler>, config: WebsocketConfig) -> Self {
        Self {
            handler,
            config,
            list: None,
            protocol: None,
        }
    }

    /// Register accepted connections in `list`.
    pub fn with_list(mut self, list: WebsocketList) -> Self {
        self.list = Some(list);
        self
    }

    /// Agree to `protocol` when the client offers it in `Sec-WebSocket-Protocol`.
    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

impl HttpResource for WebsocketResource {
    fn on_request_complete(
        &self,
        _request: &mut Request,
        response: &mut Response,
    ) -> Result<(), HandlerError> {
        response.set_status(StatusCode::BadRequest);
        response.send_string("websocket upgrade required");
        Ok(())
    }

    fn on_upgrade(&self, request: &mut Request, response: &mut Response) -> Option<Box<dyn Protocol>> {
        let headers = &request.headers;
        if !headers.has_token(HeaderField::Upgrade, "websocket") {
            response.set_status(StatusCode::BadRequest);
            return None;
        }
        if headers.get(HeaderField::SecWebSocketVersion).map(str::trim) != Some(WEBSOCKET_VERSION) {
            warn!("unsupported websocket version");
            response.set_status(StatusCode::BadRequest);
            response
                .headers
                .set(HeaderField::SecWebSocketVersion, WEBSOCKET_VERSION);
            return None;
        }
        let Some(key) = headers.get(HeaderField::SecWebSocketKey) else {
            response.set_status(StatusCode::BadRequest);
            return None;
        };

        response.set_status(StatusCode::SwitchingProtocols);
        response.headers.set(HeaderField::Connection, "Upgrade");
        response.headers.set(HeaderField::Upgrade, "websocket");
        response
            .headers
            .set(HeaderField::SecWebSocketAccept, accept_key(key));
        if let Some(protocol) = self.protocol
            && headers.has_token(HeaderField::SecWebSocketProtocol, protocol)
        {
            response
                .headers
                .set(HeaderField::SecWebSocketProtocol, protocol);
        }

        let ws = WebsocketConnection::server(self.config);
        Some(Box::new(WebsocketSession::new(
            ws,
            self.handler.clone(),
            self.list.clone(),
        )))
    }
}

/// One generator feeding both the HTTP handshake and the frame masks.
struct SharedRng(Rc<RefCell<Box<dyn RngCore>>>);

impl RngCore for SharedRng {
    fn next_u32(&mut self) -> u32 {
        self.0.borrow_mut().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.borrow_mut().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.borrow_mut().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.0.borrow_mut().try_fill_bytes(dest)
    }
}

/// A client [`Protocol`]: sends the upgrade request, verifies the answer, then runs the
/// websocket.
///
/// Connect the endpoint to [`uri`](Self::uri)'s host and port.
pub struct WebsocketClient {
    uri: Uri,
    key: String,
    http: HttpClientConnection,
    rejected: Rc<Cell<bool>>,
    ws: WebsocketConnection,
    handler: Rc<dyn WebsocketHandler>,
    session: Option<WebsocketSession>,
}

impl WebsocketClient {
    /// Client for a `ws://` or `wss://` `url`.
    pub fn new(
        url: &str,
        handler: Rc<dyn WebsocketHandler>,
        config: WebsocketConfig,
        rng: Box<dyn RngCore>,
    ) -> Result<Self, ClientError> {
        let uri = Uri::parse(url)?;
        let rng = Rc::new(RefCell::new(rng));
        let key = generate_key(&mut SharedRng(rng.clone()));
        let rejected = Rc::new(Cell::new(false));

        let flag = rejected.clone();
        let request = Request::new(Method::GET, uri.clone())
            .with_header(HeaderField::Upgrade, "websocket")
            .with_header(HeaderField::Connection, "Upgrade")
            .with_header(HeaderField::SecWebSocketKey, key.as_str())
            .with_header(HeaderField::SecWebSocketVersion, WEBSOCKET_VERSION)
            .on_complete(Box::new(move |_req: &Request, resp: &mut Response, _ok: bool| {
                warn!("websocket handshake refused: {}", resp.status.as_u16());
                flag.set(true);
                Ok(())
            }));

        let mut http = HttpClientConnection::new(
            HttpClientConfig::default(),
            Box::new(SharedRng(rng.clone())),
        );
        http.send(request)?;

        Ok(Self {
            uri,
            key,
            http,
            rejected,
            ws: WebsocketConnection::client(config, Box::new(SharedRng(rng))),
            handler,
            session: None,
        })
    }

    /// Where to connect.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The websocket. Frames can only be sent once it is open.
    pub fn connection(&self) -> WebsocketConnection {
        self.ws.clone()
    }

    fn verify(&self, response: &Response) -> Result<(), WebsocketError> {
        let accept = response.headers.get(HeaderField::SecWebSocketAccept);
        if response.status != StatusCode::SwitchingProtocols
            || !response.headers.has_token(HeaderField::Upgrade, "websocket")
            || accept.map(str::trim) != Some(accept_key(&self.key).as_str())
        {
            warn!("websocket handshake did not verify");
            return Err(WebsocketError::HandshakeFailed);
        }
        Ok(())
    }
}

impl Protocol for WebsocketClient {
    fn on_connected(&mut self, tx: &mut dyn Transmit) -> Result<(), HandlerError> {
        self.http.on_connected(tx)
    }

    fn on_receive(&mut self, tx: &mut dyn Transmit, data: &[u8]) -> Result<(), HandlerError> {
        if let Some(session) = self.session.as_mut() {
            return session.on_receive(tx, data);
        }

        self.http.on_receive(tx, data)?;
        if self.rejected.get() {
            return Err(WebsocketError::HandshakeFailed.into());
        }
        let Some(upgrade) = self.http.take_upgrade() else {
            return Ok(());
        };
        self.verify(&upgrade.response)?;

        let mut session = WebsocketSession::new(self.ws.clone(), self.handler.clone(), None);
        session.on_connected(tx)?;
        if !upgrade.trailing.is_empty() {
            session.on_receive(tx, &upgrade.trailing)?;
        }
        self.session = Some(session);
        Ok(())
    }

    fn on_ready_to_send(&mut self, tx: &mut dyn Transmit, event: ConnectionEvent) {
        match self.session.as_mut() {
            Some(session) => session.on_ready_to_send(tx, event),
            None => self.http.on_ready_to_send(tx, event),
        }
    }

    fn on_error(&mut self, err: TransportError) {
        match self.session.as_mut() {
            Some(session) => session.on_error(err),
            None => self.http.on_error(err),
        }
    }

    fn on_finished(&mut self, state: ClientState) {
        match self.session.as_mut() {
            Some(session) => session.on_finished(state),
            None => {
                self.ws.inner.borrow_mut().state = WebsocketState::Closed;
                self.http.on_finished(state);
            }
        }
    }
}
