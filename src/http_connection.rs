//! Glue between the [`Parser`] and the HTTP client and server connections.
//!
//! The adapter reassembles the URL and header fragments the parser reports into an
//! [`HttpHeaders`] map and hands complete pieces to an [`HttpHandler`].

use alloc::string::String;
use alloc::vec::Vec;

use crate::header::HttpHeaders;
use crate::parser::{Flow, HeadersAction, MessageInfo, ParseError, Parser, ParserCallbacks, ParserKind};
use crate::server::HandlerError;

/// Receiver of complete message parts.
pub trait HttpHandler {
    /// A new message starts.
    fn on_message_begin(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// The request target of a request.
    fn on_path(&mut self, url: &str) -> Result<(), HandlerError> {
        let _ = url;
        Ok(())
    }

    /// All headers are in.
    fn on_headers_complete(
        &mut self,
        info: &MessageInfo,
        headers: HttpHeaders,
    ) -> Result<HeadersAction, HandlerError>;

    /// A piece of the decoded body.
    fn on_body(&mut self, data: &[u8]) -> Result<(), HandlerError>;

    /// The message is complete.
    fn on_message_complete(&mut self, info: &MessageInfo) -> Result<Flow, HandlerError>;
}

/// Outcome of feeding a buffer to the adapter.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Received {
    /// The whole buffer was consumed
    All,
    /// The handler paused after a message. `consumed` bytes were used.
    Paused {
        /// Bytes used
        consumed: usize,
    },
    /// The connection switched protocol. Bytes after `consumed` belong to the new protocol.
    Upgrade {
        /// Bytes used by HTTP
        consumed: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum HeaderPhase {
    Start,
    Field,
    Value,
}

/// Accumulates split header lines.
struct HeaderBuilder {
    phase: HeaderPhase,
    field: Vec<u8>,
    value: Vec<u8>,
}

impl HeaderBuilder {
    fn new() -> Self {
        Self {
            phase: HeaderPhase::Start,
            field: Vec::new(),
            value: Vec::new(),
        }
    }

    fn field(&mut self, fragment: &[u8], headers: &mut HttpHeaders) {
        match self.phase {
            HeaderPhase::Value => {
                self.commit(headers);
                self.field.clear();
            }
            HeaderPhase::Start => self.field.clear(),
            HeaderPhase::Field => {}
        }
        self.field.extend_from_slice(fragment);
        self.phase = HeaderPhase::Field;
    }

    fn value(&mut self, fragment: &[u8]) {
        if self.phase != HeaderPhase::Value {
            self.value.clear();
        }
        self.value.extend_from_slice(fragment);
        self.phase = HeaderPhase::Value;
    }

    fn finish(&mut self, headers: &mut HttpHeaders) {
        if self.phase != HeaderPhase::Start {
            self.commit(headers);
        }
        self.phase = HeaderPhase::Start;
        self.field.clear();
        self.value.clear();
    }

    fn commit(&mut self, headers: &mut HttpHeaders) {
        let name = String::from_utf8_lossy(&self.field);
        let value = String::from_utf8_lossy(&self.value);
        trace!("header {}: {}", &*name, value.trim());
        headers.append(&*name, value.trim());
    }
}

struct Bridge<'a, 'h> {
    builder: &'a mut HeaderBuilder,
    url: &'a mut Vec<u8>,
    headers: &'a mut HttpHeaders,
    handler: &'a mut (dyn HttpHandler + 'h),
    error: &'a mut Option<HandlerError>,
}

impl Bridge<'_, '_> {
    fn check<T>(&mut self, res: Result<T, HandlerError>, err: ParseError) -> Result<T, ParseError> {
        res.map_err(|e| {
            *self.error = Some(e);
            err
        })
    }
}

impl ParserCallbacks for Bridge<'_, '_> {
    fn on_message_begin(&mut self) -> Result<(), ParseError> {
        self.url.clear();
        self.headers.clear();
        let res = self.handler.on_message_begin();
        self.check(res, ParseError::CbMessageBegin)
    }

    fn on_url(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        self.url.extend_from_slice(fragment);
        Ok(())
    }

    fn on_header_field(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        self.builder.field(fragment, self.headers);
        Ok(())
    }

    fn on_header_value(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        self.builder.value(fragment);
        Ok(())
    }

    fn on_headers_complete(&mut self, info: &MessageInfo) -> Result<HeadersAction, ParseError> {
        self.builder.finish(self.headers);
        if !self.url.is_empty() {
            let url = String::from_utf8_lossy(&self.url[..]);
            let res = self.handler.on_path(&url);
            self.check(res, ParseError::CbHeadersComplete)?;
        }
        let headers = core::mem::take(self.headers);
        let res = self.handler.on_headers_complete(info, headers);
        self.check(res, ParseError::CbHeadersComplete)
    }

    fn on_body(&mut self, data: &[u8]) -> Result<(), ParseError> {
        let res = self.handler.on_body(data);
        self.check(res, ParseError::CbBody)
    }

    fn on_message_complete(&mut self, info: &MessageInfo) -> Result<Flow, ParseError> {
        let res = self.handler.on_message_complete(info);
        self.check(res, ParseError::CbMessageComplete)
    }
}

/// A [`Parser`] that reassembles URL and headers.
pub struct HttpParserAdapter {
    parser: Parser,
    builder: HeaderBuilder,
    url: Vec<u8>,
    headers: HttpHeaders,
}

impl HttpParserAdapter {
    /// New adapter.
    pub fn new(kind: ParserKind, max_header_size: usize) -> Self {
        Self {
            parser: Parser::new(kind, max_header_size),
            builder: HeaderBuilder::new(),
            url: Vec::new(),
            headers: HttpHeaders::new(),
        }
    }

    /// The parser.
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// Start over, forgetting any partial message and error.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.builder = HeaderBuilder::new();
        self.url.clear();
        self.headers.clear();
    }

    /// Continue after [`Received::Paused`].
    pub fn resume(&mut self) {
        self.parser.resume();
    }

    /// `true` between messages.
    pub fn is_idle(&self) -> bool {
        self.parser.is_idle()
    }

    /// Feed `data`. A failing handler callback returns the handler's own error, anything else
    /// wrong with the input returns [`HandlerError::ParseError`].
    pub fn receive(
        &mut self,
        handler: &mut dyn HttpHandler,
        data: &[u8],
    ) -> Result<Received, HandlerError> {
        let mut error = None;
        let mut bridge = Bridge {
            builder: &mut self.builder,
            url: &mut self.url,
            headers: &mut self.headers,
            handler,
            error: &mut error,
        };
        let res = self.parser.execute(&mut bridge, data);
        let consumed = match res {
            Ok(n) => n,
            Err(e) => return Err(error.unwrap_or(HandlerError::ParseError(e))),
        };

        if self.parser.is_upgrade() {
            debug!("protocol upgrade after {} bytes", consumed);
            Ok(Received::Upgrade { consumed })
        } else if self.parser.is_paused() {
            Ok(Received::Paused { consumed })
        } else {
            Ok(Received::All)
        }
    }

    /// The transport closed.
    pub fn finish(&mut self, handler: &mut dyn HttpHandler) -> Result<(), HandlerError> {
        let mut error = None;
        let mut bridge = Bridge {
            builder: &mut self.builder,
            url: &mut self.url,
            headers: &mut self.headers,
            handler,
            error: &mut error,
        };
        let res = self.parser.finish(&mut bridge);
        res.map_err(|e| error.unwrap_or(HandlerError::ParseError(e)))
    }
}
