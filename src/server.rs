//! Server side request dispatch.
//!
//! An [`HttpServer`] holds the resource table shared by every accepted connection. Each accepted
//! socket gets its own [`HttpServerConnection`], which parses requests, routes them to an
//! [`HttpResource`] and sends the response back with the same backpressure rules used for every
//! other stream.
//!
//! ```
//! use std::rc::Rc;
//!
//! use httpflow::config::HttpServerConfig;
//! use httpflow::server::{FnResource, HttpServer};
//!
//! let server = HttpServer::new(HttpServerConfig::default());
//! server.add_resource(
//!     "/",
//!     Rc::new(FnResource::new(|_req, resp| {
//!         resp.send_string("<html>...</html>");
//!         Ok(())
//!     })),
//! );
//! let _connection = server.connection();
//! ```

use alloc::boxed::Box;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::{Display, Formatter};

use crate::ascii::{AsciiInt, CRLF};
use crate::client::{ClientError, ClientState, ConnectionEvent, Transmit};
use crate::config::HttpServerConfig;
use crate::endpoint::Protocol;
use crate::header::{HeaderField, HttpHeaders};
use crate::http_connection::{HttpHandler, HttpParserAdapter, Received};
use crate::parser::{Flow, HeadersAction, MessageInfo, ParseError, ParserKind};
use crate::request::{Method, Request, Uri};
use crate::response::{Response, StatusCode};
use crate::stream::{ChunkedStream, DataSource, decode_form};
use crate::transport::{Clock, TransportError};
use crate::websocket::WebsocketError;

const MAX_SEND_STEPS: usize = 16;

/// Returned by resources and protocol callbacks. Errors from other layers are wrapped in their
/// own variant, other failures are a `CustomError`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandlerError {
    /// Custom errors as specified by the resource author
    CustomError(&'static str),
    /// Malformed HTTP
    ParseError(ParseError),
    /// Websocket framing or handshake failure
    WebsocketError(WebsocketError),
    /// Sending failed
    ClientError(ClientError),
}

impl From<ParseError> for HandlerError {
    fn from(value: ParseError) -> Self {
        Self::ParseError(value)
    }
}

impl From<WebsocketError> for HandlerError {
    fn from(value: WebsocketError) -> Self {
        Self::WebsocketError(value)
    }
}

impl From<ClientError> for HandlerError {
    fn from(value: ClientError) -> Self {
        Self::ClientError(value)
    }
}

impl From<&'static str> for HandlerError {
    fn from(value: &'static str) -> Self {
        Self::CustomError(value)
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::CustomError(msg) => f.write_str(msg),
            Self::ParseError(e) => write!(f, "{e}"),
            Self::WebsocketError(e) => write!(f, "websocket: {e}"),
            Self::ClientError(e) => write!(f, "send: {e}"),
        }
    }
}

impl core::error::Error for HandlerError {}

/// A handler for one path. Only [`on_request_complete`](Self::on_request_complete) is required.
pub trait HttpResource {
    /// The request headers are in.
    fn on_headers_complete(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), HandlerError> {
        let _ = (request, response);
        Ok(())
    }

    /// A piece of the request body. Return `false` to leave the chunk to the body parser
    /// registered for the request's content type.
    fn on_body(&self, request: &mut Request, data: &[u8]) -> Result<bool, HandlerError> {
        let _ = (request, data);
        Ok(false)
    }

    /// The whole request is in. Fill in `response`.
    fn on_request_complete(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), HandlerError>;

    /// The request asks to switch protocol. Accepting returns the protocol taking over the
    /// connection after `response` (normally `101`) has been sent. Refusing leaves the response
    /// to describe why, and the connection closes after it.
    fn on_upgrade(&self, request: &mut Request, response: &mut Response) -> Option<Box<dyn Protocol>> {
        let _ = request;
        response.set_status(StatusCode::BadRequest);
        None
    }
}

type CompleteFn = dyn Fn(&mut Request, &mut Response) -> Result<(), HandlerError>;

/// A resource from a closure.
pub struct FnResource {
    on_complete: Box<CompleteFn>,
}

impl FnResource {
    /// Resource calling `f` once each request is complete.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Request, &mut Response) -> Result<(), HandlerError> + 'static,
    {
        Self {
            on_complete: Box::new(f),
        }
    }
}

impl HttpResource for FnResource {
    fn on_request_complete(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), HandlerError> {
        (self.on_complete)(request, response)
    }
}

/// Path to resource table.
///
/// Paths match exactly after a trailing `/` is removed, so `/status/` and `/status` are the same
/// resource. A resource registered at `*` catches every other path, and the default resource
/// catches whatever is left.
#[derive(Default)]
pub struct ResourceTree {
    resources: Vec<(String, Rc<dyn HttpResource>)>,
    default: Option<Rc<dyn HttpResource>>,
}

fn normalize(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(p) if !p.is_empty() => p,
        _ => path,
    }
}

impl ResourceTree {
    /// Register `resource` for `path`, replacing any previous one.
    pub fn set(&mut self, path: &str, resource: Rc<dyn HttpResource>) {
        let path = normalize(path);
        match self.resources.iter_mut().find(|(p, _)| p == path) {
            Some(entry) => entry.1 = resource,
            None => self.resources.push((String::from(path), resource)),
        }
    }

    /// Remove the resource for `path`.
    pub fn remove(&mut self, path: &str) -> bool {
        let path = normalize(path);
        let before = self.resources.len();
        self.resources.retain(|(p, _)| p != path);
        self.resources.len() != before
    }

    /// Resource for paths nothing else matches.
    pub fn set_default(&mut self, resource: Rc<dyn HttpResource>) {
        self.default = Some(resource);
    }

    /// Find the resource for `path`.
    pub fn find(&self, path: &str) -> Option<Rc<dyn HttpResource>> {
        let path = normalize(path);
        let exact = |want: &str| {
            self.resources
                .iter()
                .find(|(p, _)| p == want)
                .map(|(_, r)| r.clone())
        };
        exact(path)
            .or_else(|| exact("*"))
            .or_else(|| self.default.clone())
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// `true` if no path is registered.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Decodes a request body into the request.
pub trait BodyParser {
    /// A piece of the body.
    fn on_data(&mut self, request: &mut Request, data: &[u8]);

    /// The body is complete.
    fn on_end(&mut self, request: &mut Request);
}

/// Creates a [`BodyParser`] for one request.
pub type BodyParserFactory = fn() -> Box<dyn BodyParser>;

/// `application/x-www-form-urlencoded` into [`Request::post_params`].
#[derive(Default)]
pub struct FormUrlencodedParser {
    data: Vec<u8>,
}

impl FormUrlencodedParser {
    /// Factory suitable for [`HttpServer::add_body_parser`].
    pub fn factory() -> Box<dyn BodyParser> {
        Box::new(Self::default())
    }
}

impl BodyParser for FormUrlencodedParser {
    fn on_data(&mut self, _request: &mut Request, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    fn on_end(&mut self, request: &mut Request) {
        let text = String::from_utf8_lossy(&self.data);
        request.post_params.extend(decode_form(&text));
        self.data.clear();
    }
}

type ParserTable = Vec<(String, BodyParserFactory)>;

fn find_body_parser(parsers: &ParserTable, content_type: &str) -> Option<Box<dyn BodyParser>> {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    let major = mime.split('/').next().unwrap_or_default();
    let wildcard = format!("{major}/*");
    [mime, wildcard.as_str(), "*"].iter().find_map(|want| {
        parsers
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(want))
            .map(|(_, factory)| factory())
    })
}

/// Shared state of a listening server. Create one [`HttpServerConnection`] per accepted socket
/// with [`connection`](Self::connection).
pub struct HttpServer {
    config: HttpServerConfig,
    resources: Rc<RefCell<ResourceTree>>,
    parsers: Rc<RefCell<ParserTable>>,
    clock: Option<Rc<dyn Clock>>,
}

impl HttpServer {
    /// New server. The form urlencoded body parser is registered.
    pub fn new(config: HttpServerConfig) -> Self {
        let server = Self {
            config,
            resources: Rc::new(RefCell::new(ResourceTree::default())),
            parsers: Rc::new(RefCell::new(Vec::new())),
            clock: None,
        };
        server.add_body_parser(
            "application/x-www-form-urlencoded",
            FormUrlencodedParser::factory,
        );
        server
    }

    /// Settings.
    pub fn config(&self) -> &HttpServerConfig {
        &self.config
    }

    /// Register `resource` at `path`.
    pub fn add_resource(&self, path: &str, resource: Rc<dyn HttpResource>) {
        self.resources.borrow_mut().set(path, resource);
    }

    /// Register the resource used when no path matches.
    pub fn set_default_resource(&self, resource: Rc<dyn HttpResource>) {
        self.resources.borrow_mut().set_default(resource);
    }

    /// The resource table.
    pub fn resources(&self) -> Rc<RefCell<ResourceTree>> {
        self.resources.clone()
    }

    /// Register a body parser for `content_type`. Types are matched exactly, then as `major/*`,
    /// then `*`.
    pub fn add_body_parser(&self, content_type: &str, factory: BodyParserFactory) {
        let mut parsers = self.parsers.borrow_mut();
        parsers.retain(|(t, _)| !t.eq_ignore_ascii_case(content_type));
        parsers.push((String::from(content_type), factory));
    }

    /// Clock providing `Date` headers.
    pub fn set_clock(&mut self, clock: Rc<dyn Clock>) {
        self.clock = Some(clock);
    }

    /// Protocol for a newly accepted socket.
    pub fn connection(&self) -> HttpServerConnection {
        HttpServerConnection::new(
            self.config,
            self.resources.clone(),
            self.parsers.clone(),
            self.clock.clone(),
        )
    }
}

/// Where a server connection is in the request/response cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServerState {
    /// Waiting for, or parsing, a request
    Ready,
    /// A request is complete and its response is due
    ParsingCompleted,
    /// The response head is being built
    StartSending,
    /// The response head is being sent
    SendingHeaders,
    /// The response body is about to be queued
    StartBody,
    /// The response body is being sent
    SendingBody,
    /// The response is out
    Sent,
    /// Another protocol owns the connection
    Upgraded,
}

struct Current {
    request: Request,
    response: Response,
    resource: Option<Rc<dyn HttpResource>>,
    parser: Option<Box<dyn BodyParser>>,
}

struct Completed {
    request: Request,
    response: Response,
    keep_alive: bool,
    upgrade: Option<Box<dyn Protocol>>,
}

/// Receive side of a server connection.
struct Exchange {
    resources: Rc<RefCell<ResourceTree>>,
    parsers: Rc<RefCell<ParserTable>>,
    path: String,
    current: Option<Current>,
    completed: Option<Completed>,
}

impl HttpHandler for Exchange {
    fn on_message_begin(&mut self) -> Result<(), HandlerError> {
        self.path.clear();
        self.current = None;
        Ok(())
    }

    fn on_path(&mut self, url: &str) -> Result<(), HandlerError> {
        self.path.push_str(url);
        Ok(())
    }

    fn on_headers_complete(
        &mut self,
        info: &MessageInfo,
        headers: HttpHeaders,
    ) -> Result<HeadersAction, HandlerError> {
        let method = info
            .method
            .ok_or(HandlerError::ParseError(ParseError::InvalidMethod))?;
        let uri = Uri::parse(&self.path).map_err(|_| ParseError::InvalidUrl)?;
        debug!("{} {}", method.as_str(), uri.path.as_str());

        let resource = self.resources.borrow().find(&uri.decoded_path());
        let parser = match headers.get(HeaderField::ContentType) {
            Some(content_type) => find_body_parser(&self.parsers.borrow(), content_type),
            None => None,
        };

        let mut request = Request::new(method, uri);
        request.headers = headers;
        let mut response = Response::new();
        if let Some(resource) = &resource {
            resource.on_headers_complete(&mut request, &mut response)?;
        }

        self.current = Some(Current {
            request,
            response,
            resource,
            parser,
        });
        Ok(HeadersAction::Continue)
    }

    fn on_body(&mut self, data: &[u8]) -> Result<(), HandlerError> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        if let Some(resource) = &current.resource
            && resource.on_body(&mut current.request, data)?
        {
            return Ok(());
        }
        if let Some(parser) = current.parser.as_mut() {
            parser.on_data(&mut current.request, data);
        }
        Ok(())
    }

    fn on_message_complete(&mut self, info: &MessageInfo) -> Result<Flow, HandlerError> {
        let Some(Current {
            mut request,
            mut response,
            resource,
            parser,
        }) = self.current.take()
        else {
            return Err(HandlerError::CustomError("request incomplete"));
        };
        if let Some(mut parser) = parser {
            parser.on_end(&mut request);
        }

        let mut keep_alive = info.keep_alive;
        let mut upgrade = None;
        match resource {
            Some(resource) if info.upgrade => {
                upgrade = resource.on_upgrade(&mut request, &mut response);
                if upgrade.is_none() {
                    keep_alive = false;
                }
            }
            Some(resource) => resource.on_request_complete(&mut request, &mut response)?,
            None => {
                warn!("no resource for {}", request.uri.path.as_str());
                error_page(&mut response, StatusCode::NotFound, "Not Found");
                keep_alive &= !info.upgrade;
            }
        }

        self.completed = Some(Completed {
            request,
            response,
            keep_alive,
            upgrade,
        });
        Ok(Flow::Pause)
    }
}

/// Replace the response with a minimal HTML page.
fn error_page(response: &mut Response, status: StatusCode, message: &str) {
    response.reset();
    response.set_status(status);
    response.headers.set(HeaderField::ContentType, "text/html");
    response.send_string(format!("<H2 color='#444'>{message}</H2>"));
}

fn error_status(err: &HandlerError) -> (StatusCode, &'static str) {
    match err {
        HandlerError::ParseError(ParseError::HeaderOverflow) => {
            (StatusCode::HeaderFieldsTooLarge, ParseError::HeaderOverflow.name())
        }
        HandlerError::ParseError(e) => (StatusCode::BadRequest, e.name()),
        HandlerError::CustomError(msg) => (StatusCode::InternalServerError, msg),
        _ => (
            StatusCode::InternalServerError,
            StatusCode::InternalServerError.reason(),
        ),
    }
}

/// The server [`Protocol`] for one accepted socket.
pub struct HttpServerConnection {
    config: HttpServerConfig,
    clock: Option<Rc<dyn Clock>>,
    adapter: HttpParserAdapter,
    exchange: Exchange,
    state: ServerState,
    backlog: Vec<u8>,
    body: Option<Box<dyn DataSource>>,
    close_after: bool,
    upgraded: Option<Box<dyn Protocol>>,
}

impl HttpServerConnection {
    fn new(
        config: HttpServerConfig,
        resources: Rc<RefCell<ResourceTree>>,
        parsers: Rc<RefCell<ParserTable>>,
        clock: Option<Rc<dyn Clock>>,
    ) -> Self {
        Self {
            config,
            clock,
            adapter: HttpParserAdapter::new(ParserKind::Request, config.max_header_size),
            exchange: Exchange {
                resources,
                parsers,
                path: String::new(),
                current: None,
                completed: None,
            },
            state: ServerState::Ready,
            backlog: Vec::new(),
            body: None,
            close_after: false,
            upgraded: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Pipelined request bytes waiting for the current response to finish.
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    fn headers_sent(&self) -> bool {
        matches!(
            self.state,
            ServerState::SendingHeaders
                | ServerState::StartBody
                | ServerState::SendingBody
                | ServerState::Sent
        )
    }

    /// Parse `data` in `Ready` state. At most one request is taken per call, anything after it
    /// goes to the backlog.
    fn process(&mut self, tx: &mut dyn Transmit, data: &[u8]) -> Result<(), HandlerError> {
        match self.adapter.receive(&mut self.exchange, data) {
            Ok(Received::All) => {}
            Ok(Received::Paused { consumed }) => {
                self.adapter.resume();
                let mut rest = Vec::from(&data[consumed..]);
                rest.append(&mut self.backlog);
                self.backlog = rest;
            }
            Ok(Received::Upgrade { consumed }) => return self.upgrade(tx, &data[consumed..]),
            Err(e) => {
                warn!("bad request: {:?}", e);
                return self.fail(tx, e);
            }
        }

        if self.exchange.completed.is_some() {
            self.state = ServerState::ParsingCompleted;
        }
        Ok(())
    }

    fn fail(&mut self, tx: &mut dyn Transmit, err: HandlerError) -> Result<(), HandlerError> {
        if self.headers_sent() {
            return Err(err);
        }
        let (status, message) = error_status(&err);
        let mut response = Response::new();
        error_page(&mut response, status, message);
        self.exchange.current = None;
        self.exchange.completed = Some(Completed {
            request: Request::new(Method::GET, Uri::default()),
            response,
            keep_alive: false,
            upgrade: None,
        });
        self.backlog.clear();
        self.state = ServerState::ParsingCompleted;
        self.send_pending(tx);
        Ok(())
    }

    fn upgrade(&mut self, tx: &mut dyn Transmit, trailing: &[u8]) -> Result<(), HandlerError> {
        let Some(mut completed) = self.exchange.completed.take() else {
            return Err(HandlerError::CustomError("upgrade without request"));
        };
        let Some(mut protocol) = completed.upgrade.take() else {
            // refused, the response explains why and the connection closes
            self.exchange.completed = Some(completed);
            self.state = ServerState::ParsingCompleted;
            return Ok(());
        };

        info!("switching protocol on {}", completed.request.uri.path.as_str());
        let mut head = Vec::new();
        completed.response.write_status_line(&mut head);
        completed.response.headers.write_to(&mut head);
        head.extend_from_slice(CRLF);
        tx.send_bytes(&head, false)?;
        self.state = ServerState::Upgraded;

        protocol.on_connected(tx)?;
        if !trailing.is_empty() {
            protocol.on_receive(tx, trailing)?;
        }
        self.upgraded = Some(protocol);
        Ok(())
    }

    /// Finish the response headers. Conditional requests are settled here, before anything is
    /// sent.
    fn prepare(&mut self, completed: &mut Completed) {
        let request = &completed.request;
        let response = &mut completed.response;

        if self.config.enable_etag
            && !response.headers.contains(HeaderField::ETag)
            && let Some(id) = response.body_id()
        {
            response.headers.set(HeaderField::ETag, Response::etag_for(&id));
        }
        if let Some(etag) = response.headers.get(HeaderField::ETag).map(String::from) {
            let listed = |value: &str| {
                value
                    .split(',')
                    .any(|t| t.trim() == etag || t.trim() == "*")
            };
            if let Some(value) = request.headers.get(HeaderField::IfNoneMatch)
                && listed(value)
                && matches!(request.method, Method::GET | Method::HEAD)
            {
                debug!("{} not modified", etag.as_str());
                response.set_status(StatusCode::NotModified);
                response.take_body();
            } else if let Some(value) = request.headers.get(HeaderField::IfMatch)
                && !listed(value)
            {
                response.set_status(StatusCode::PreconditionFailed);
                response.take_body();
            }
        }

        let mut body = response.take_body();
        if response.status.forbids_body() {
            body = None;
            response.headers.remove(HeaderField::ContentLength);
            response.headers.remove(HeaderField::TransferEncoding);
        } else {
            match body.as_ref().map(|b| b.available()) {
                Some(Some(len)) => response
                    .headers
                    .set(HeaderField::ContentLength, AsciiInt::from(len).as_str()),
                Some(None) => {
                    response.headers.remove(HeaderField::ContentLength);
                    response.headers.set(HeaderField::TransferEncoding, "chunked");
                    body = body.map(|b| Box::new(ChunkedStream::new(b)) as Box<dyn DataSource>);
                }
                None => {
                    if !response.headers.contains(HeaderField::ContentLength) {
                        response.headers.set(HeaderField::ContentLength, "0");
                    }
                }
            }
        }
        if request.method == Method::HEAD {
            body = None;
        }

        let close = !completed.keep_alive
            || response.headers.has_token(HeaderField::Connection, "close");
        response.headers.set(
            HeaderField::Connection,
            if close { "close" } else { "keep-alive" },
        );
        if let Some(name) = self.config.server_name
            && !response.headers.contains(HeaderField::Server)
        {
            response.headers.set(HeaderField::Server, name);
        }
        if !response.headers.contains(HeaderField::Date)
            && let Some(date) = self.clock.as_ref().and_then(|c| c.http_date())
        {
            response.headers.set(HeaderField::Date, date);
        }

        self.close_after = close;
        self.body = body;
    }

    fn send_pending(&mut self, tx: &mut dyn Transmit) {
        for _ in 0..MAX_SEND_STEPS {
            match self.state {
                ServerState::Ready => {
                    if self.backlog.is_empty() {
                        return;
                    }
                    let backlog = core::mem::take(&mut self.backlog);
                    trace!("parsing {} pipelined bytes", backlog.len());
                    if let Err(e) = self.process(tx, &backlog) {
                        warn!("pipelined request failed: {:?}", e);
                        tx.close();
                        return;
                    }
                    if self.state == ServerState::Ready {
                        return;
                    }
                }
                ServerState::ParsingCompleted => self.state = ServerState::StartSending,
                ServerState::StartSending => {
                    let Some(mut completed) = self.exchange.completed.take() else {
                        self.state = ServerState::Ready;
                        continue;
                    };
                    self.prepare(&mut completed);
                    if self.close_after {
                        tx.set_timeout(1);
                    }

                    let mut head = Vec::new();
                    completed.response.write_status_line(&mut head);
                    completed.response.headers.write_to(&mut head);
                    head.extend_from_slice(CRLF);
                    debug!(
                        "response {} for {}",
                        completed.response.status.as_u16(),
                        completed.request.uri.path.as_str()
                    );
                    let force_close = self.close_after && self.body.is_none();
                    if let Err(e) = tx.send_bytes(&head, force_close) {
                        warn!("cannot send response: {:?}", e);
                        tx.close();
                        return;
                    }
                    self.state = ServerState::SendingHeaders;
                }
                ServerState::SendingHeaders => {
                    if tx.push().is_err() {
                        tx.close();
                        return;
                    }
                    if tx.is_processing() {
                        return;
                    }
                    self.state = ServerState::StartBody;
                }
                ServerState::StartBody => match self.body.take() {
                    Some(body) => {
                        if tx.send(body, self.close_after).is_err() {
                            tx.close();
                            return;
                        }
                        self.state = ServerState::SendingBody;
                    }
                    None => self.state = ServerState::Sent,
                },
                ServerState::SendingBody => {
                    if tx.push().is_err() {
                        tx.close();
                        return;
                    }
                    if tx.is_processing() {
                        return;
                    }
                    self.state = ServerState::Sent;
                }
                ServerState::Sent => {
                    if self.close_after {
                        // the transport closes once the last byte is acknowledged
                        return;
                    }
                    self.state = ServerState::Ready;
                }
                ServerState::Upgraded => return,
            }
        }
    }
}

impl Protocol for HttpServerConnection {
    fn on_connected(&mut self, tx: &mut dyn Transmit) -> Result<(), HandlerError> {
        tx.set_timeout(self.config.idle_timeout);
        Ok(())
    }

    fn on_receive(&mut self, tx: &mut dyn Transmit, data: &[u8]) -> Result<(), HandlerError> {
        if let Some(protocol) = self.upgraded.as_mut() {
            return protocol.on_receive(tx, data);
        }
        if self.state != ServerState::Ready {
            if self.close_after {
                return Ok(());
            }
            if self.backlog.len() + data.len() > self.config.max_backlog {
                warn!("request backlog full");
                return Err(HandlerError::CustomError("request backlog full"));
            }
            self.backlog.extend_from_slice(data);
            return Ok(());
        }
        self.process(tx, data)
    }

    fn on_ready_to_send(&mut self, tx: &mut dyn Transmit, event: ConnectionEvent) {
        if let Some(protocol) = self.upgraded.as_mut() {
            protocol.on_ready_to_send(tx, event);
            return;
        }
        self.send_pending(tx);
    }

    fn on_error(&mut self, err: TransportError) {
        if let Some(protocol) = self.upgraded.as_mut() {
            protocol.on_error(err);
        }
    }

    fn on_finished(&mut self, state: ClientState) {
        if let Some(protocol) = self.upgraded.as_mut() {
            protocol.on_finished(state);
        }
        debug!("server connection finished: {:?}", state);
    }
}
