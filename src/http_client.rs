//! Client side HTTP/1.1 request pipeline.
//!
//! Requests wait in a FIFO until the connection is ready. Once a request's headers are sent it
//! moves to the execution queue, and every response that arrives is matched to the head of that
//! queue. Responses therefore pair with requests strictly in send order.
//!
//! A request is only sent ahead of an outstanding response when both it and the request sent
//! before it are `GET` or `HEAD`.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use rand_core::RngCore;

use crate::ascii::{AsciiInt, CRLF, SP};
use crate::client::{ClientError, ClientState, ConnectionEvent, Transmit};
use crate::config::{HttpClientConfig, RetryPolicy};
use crate::endpoint::Protocol;
use crate::header::{HeaderField, HttpHeaders};
use crate::http_connection::{HttpHandler, HttpParserAdapter, Received};
use crate::parser::{Flow, HeadersAction, MessageInfo, ParserKind};
use crate::request::{Method, Request};
use crate::response::{HTTP_PROTO, Response};
use crate::server::HandlerError;
use crate::stream::{ChunkedStream, DataSource, MemoryStream, MultipartStream, UrlencodedStream};
use crate::transport::TransportError;

const MAX_SEND_STEPS: usize = 16;

impl RetryPolicy {
    /// `true` if a request with `method` may be resent automatically.
    pub fn allows(&self, method: Method) -> bool {
        match self {
            Self::Never => false,
            Self::Idempotent => method.is_idempotent(),
            Self::Always => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum SendState {
    Ready,
    SendingHeaders,
    StartBody,
    SendingBody,
}

/// A request whose response switched the connection to another protocol.
pub struct Upgrade {
    /// The request
    pub request: Request,
    /// The `101` response
    pub response: Response,
    /// Bytes received after the response, belonging to the new protocol
    pub trailing: Vec<u8>,
}

fn notify(request: &mut Request, response: &mut Response, ok: bool) -> Result<(), HandlerError> {
    match request.on_complete.take() {
        Some(mut delegate) => {
            let res = delegate(request, response, ok);
            request.on_complete = Some(delegate);
            res
        }
        None => Ok(()),
    }
}

/// Report a failure where there is no connection left to abort.
fn notify_failed(request: &mut Request, response: &mut Response) {
    if let Err(e) = notify(request, response, false) {
        warn!("completion of {} failed: {:?}", request.uri.path.as_str(), e);
    }
}

/// Receive side of the pipeline.
struct Pipeline {
    waiting: VecDeque<Request>,
    executing: VecDeque<Request>,
    incoming: Option<(Request, Response)>,
    upgrade: Option<Upgrade>,
    retry_policy: RetryPolicy,
    buffer_limit: usize,
}

impl Pipeline {
    fn retry_or_fail(
        &mut self,
        mut request: Request,
        mut response: Response,
    ) -> Result<(), HandlerError> {
        if request.retries > 0 && self.retry_policy.allows(request.method) && request.rewind() {
            request.retries -= 1;
            info!(
                "retrying {} {}, {} left",
                request.method.as_str(),
                request.uri.path.as_str(),
                request.retries
            );
            self.waiting.push_front(request);
            Ok(())
        } else {
            notify(&mut request, &mut response, false)
        }
    }

    /// The connection went away. Every request still waiting for its response goes back to the
    /// head of the waiting queue in its original order, unless its payload cannot be resent.
    fn requeue_in_flight(&mut self) {
        let mut in_flight: Vec<Request> = self.incoming.take().map(|(r, _)| r).into_iter().collect();
        in_flight.extend(self.executing.drain(..));

        for mut request in in_flight.into_iter().rev() {
            if request.rewind() {
                debug!("requeue {}", request.uri.path.as_str());
                self.waiting.push_front(request);
            } else {
                warn!("cannot resend {}", request.uri.path.as_str());
                notify_failed(&mut request, &mut Response::new());
            }
        }
    }
}

impl HttpHandler for Pipeline {
    fn on_message_begin(&mut self) -> Result<(), HandlerError> {
        match self.executing.pop_front() {
            Some(request) => {
                trace!("response for {}", request.uri.path.as_str());
                self.incoming = Some((request, Response::new()));
                Ok(())
            }
            None => {
                warn!("response without request");
                Err(HandlerError::CustomError("unexpected response"))
            }
        }
    }

    fn on_headers_complete(
        &mut self,
        info: &MessageInfo,
        headers: HttpHeaders,
    ) -> Result<HeadersAction, HandlerError> {
        let Some((request, response)) = self.incoming.as_mut() else {
            return Err(HandlerError::CustomError("unexpected response"));
        };
        response.status = info.status.into();
        response.headers = headers;
        match request.response_stream.take() {
            Some(stream) => response.set_buffer(stream),
            None if request.on_body.is_none() => {
                response.set_buffer(Box::new(MemoryStream::with_limit(self.buffer_limit)))
            }
            None => {}
        }

        if let Some(mut delegate) = request.on_headers_complete.take() {
            let res = delegate(request, response);
            request.on_headers_complete = Some(delegate);
            res?;
        }

        Ok(if request.method == Method::HEAD {
            HeadersAction::SkipBody
        } else {
            HeadersAction::Continue
        })
    }

    fn on_body(&mut self, data: &[u8]) -> Result<(), HandlerError> {
        let Some((request, response)) = self.incoming.as_mut() else {
            return Err(HandlerError::CustomError("unexpected response"));
        };
        if let Some(mut delegate) = request.on_body.take() {
            let res = delegate(request, data);
            request.on_body = Some(delegate);
            return res;
        }
        if response.write_body(data) < data.len() {
            trace!("response body truncated");
        }
        Ok(())
    }

    fn on_message_complete(&mut self, info: &MessageInfo) -> Result<Flow, HandlerError> {
        let Some((mut request, mut response)) = self.incoming.take() else {
            return Err(HandlerError::CustomError("unexpected response"));
        };

        if info.upgrade {
            info!("upgraded by {}", request.uri.path.as_str());
            self.upgrade = Some(Upgrade {
                request,
                response,
                trailing: Vec::new(),
            });
            return Ok(Flow::Continue);
        }

        if response.is_success() {
            notify(&mut request, &mut response, true)?;
        } else {
            debug!("request failed with {}", response.status.as_u16());
            self.retry_or_fail(request, response)?;
        }
        Ok(Flow::Continue)
    }
}

/// The client [`Protocol`]: queues requests and sends them over one connection.
///
/// Requests added with [`send`](Self::send) go out on the next ready event. To use an idle,
/// still-connected connection for new requests, queue them and resume the endpoint.
pub struct HttpClientConnection {
    config: HttpClientConfig,
    adapter: HttpParserAdapter,
    pipeline: Pipeline,
    send_state: SendState,
    body: Option<Box<dyn DataSource>>,
    last_method: Option<Method>,
    rng: Box<dyn RngCore>,
}

impl HttpClientConnection {
    /// New connection. `rng` provides multipart boundaries.
    pub fn new(config: HttpClientConfig, rng: Box<dyn RngCore>) -> Self {
        Self {
            config,
            adapter: HttpParserAdapter::new(ParserKind::Response, config.max_header_size),
            pipeline: Pipeline {
                waiting: VecDeque::new(),
                executing: VecDeque::new(),
                incoming: None,
                upgrade: None,
                retry_policy: config.retry_policy,
                buffer_limit: config.response_buffer_limit,
            },
            send_state: SendState::Ready,
            body: None,
            last_method: None,
            rng,
        }
    }

    /// Queue a request.
    pub fn send(&mut self, request: Request) -> Result<(), ClientError> {
        if self.pipeline.waiting.len() >= self.config.queue_capacity {
            warn!("request queue full");
            return Err(ClientError::QueueFull);
        }
        self.pipeline.waiting.push_back(request);
        Ok(())
    }

    /// Requests not yet sent.
    pub fn waiting(&self) -> usize {
        self.pipeline.waiting.len()
    }

    /// Requests sent and waiting for their response.
    pub fn executing(&self) -> usize {
        self.pipeline.executing.len() + usize::from(self.pipeline.incoming.is_some())
    }

    /// `true` when nothing is queued, in flight or being sent.
    pub fn is_idle(&self) -> bool {
        self.waiting() == 0 && self.executing() == 0 && self.send_state == SendState::Ready
    }

    /// The upgrade, once a response switched protocol.
    pub fn take_upgrade(&mut self) -> Option<Upgrade> {
        self.pipeline.upgrade.take()
    }

    /// `true` once a response switched protocol.
    pub fn is_upgraded(&self) -> bool {
        self.pipeline.upgrade.is_some()
    }

    fn reset(&mut self) {
        self.adapter.reset();
        self.send_state = SendState::Ready;
        self.body = None;
        self.last_method = None;
    }

    fn can_dispatch(&self) -> bool {
        let Some(next) = self.pipeline.waiting.front() else {
            return false;
        };
        if self.pipeline.upgrade.is_some() {
            return false;
        }
        if self.executing() == 0 {
            return true;
        }
        if self.pipeline.executing.len() >= self.config.queue_capacity {
            return false;
        }
        let ok = next.method.can_pipeline() && self.last_method.is_some_and(|m| m.can_pipeline());
        if !ok {
            trace!("{} waits for outstanding responses", next.method.as_str());
        }
        ok
    }

    fn send_pending(&mut self, tx: &mut dyn Transmit) -> Result<(), ClientError> {
        for _ in 0..MAX_SEND_STEPS {
            match self.send_state {
                SendState::Ready => {
                    if !self.can_dispatch() {
                        return Ok(());
                    }
                    let Some(request) = self.pipeline.waiting.pop_front() else {
                        return Ok(());
                    };
                    self.dispatch(tx, request)?;
                    self.send_state = SendState::SendingHeaders;
                }
                SendState::SendingHeaders => {
                    tx.push()?;
                    if tx.is_processing() {
                        return Ok(());
                    }
                    self.send_state = SendState::StartBody;
                }
                SendState::StartBody => match self.body.take() {
                    Some(body) => {
                        tx.send(body, false)?;
                        self.send_state = SendState::SendingBody;
                    }
                    None => self.send_state = SendState::Ready,
                },
                SendState::SendingBody => {
                    tx.push()?;
                    if tx.is_processing() {
                        return Ok(());
                    }
                    self.send_state = SendState::Ready;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, tx: &mut dyn Transmit, mut request: Request) -> Result<(), ClientError> {
        if !request.keep_for_retry() {
            request.retries = 0;
        }

        let body = self.take_payload(&mut request);
        if !request.headers.contains(HeaderField::Host) {
            request.headers.set(HeaderField::Host, request.uri.host_header());
        }
        let body = match body {
            Some(body) => match body.available() {
                Some(len) => {
                    if !request.headers.contains(HeaderField::ContentLength) {
                        request
                            .headers
                            .set(HeaderField::ContentLength, AsciiInt::from(len).as_str());
                    }
                    Some(body)
                }
                None => {
                    request.headers.remove(HeaderField::ContentLength);
                    request.headers.set(HeaderField::TransferEncoding, "chunked");
                    Some(Box::new(ChunkedStream::new(body)) as Box<dyn DataSource>)
                }
            },
            None => {
                if !request.method.can_pipeline()
                    && !request.headers.contains(HeaderField::ContentLength)
                {
                    request.headers.set(HeaderField::ContentLength, "0");
                }
                None
            }
        };

        let mut head = Vec::new();
        head.extend_from_slice(request.method.as_str().as_bytes());
        head.push(SP);
        head.extend_from_slice(request.uri.path_and_query().as_bytes());
        head.push(SP);
        head.extend_from_slice(HTTP_PROTO.as_bytes());
        head.extend_from_slice(CRLF);
        request.headers.write_to(&mut head);
        head.extend_from_slice(CRLF);

        if let Err(e) = tx.send_bytes(&head, false) {
            warn!("cannot send request: {:?}", e);
            if request.rewind() {
                self.pipeline.waiting.push_front(request);
            } else {
                notify_failed(&mut request, &mut Response::new());
            }
            return Err(e);
        }

        debug!(
            "sent {} {}",
            request.method.as_str(),
            request.uri.path.as_str()
        );
        self.body = body;
        self.last_method = Some(request.method);
        self.pipeline.executing.push_back(request);
        Ok(())
    }

    /// Pick the body: file attachments make it multipart, form parameters make it urlencoded,
    /// otherwise the raw body is sent.
    fn take_payload(&mut self, request: &mut Request) -> Option<Box<dyn DataSource>> {
        if request.has_files() {
            let boundary = MultipartStream::generate_boundary(self.rng.as_mut());
            let files = request.take_files();
            let stream = MultipartStream::new(boundary, &request.post_params, files);
            request
                .headers
                .set(HeaderField::ContentType, stream.content_type());
            Some(Box::new(stream))
        } else if !request.post_params.is_empty() {
            request
                .headers
                .set(HeaderField::ContentType, "application/x-www-form-urlencoded");
            Some(Box::new(UrlencodedStream::new(&request.post_params)))
        } else {
            request.take_body()
        }
    }
}

impl Protocol for HttpClientConnection {
    fn on_connected(&mut self, _tx: &mut dyn Transmit) -> Result<(), HandlerError> {
        self.reset();
        Ok(())
    }

    fn on_receive(&mut self, tx: &mut dyn Transmit, data: &[u8]) -> Result<(), HandlerError> {
        if let Some(upgrade) = self.pipeline.upgrade.as_mut() {
            upgrade.trailing.extend_from_slice(data);
            return Ok(());
        }

        match self.adapter.receive(&mut self.pipeline, data) {
            Ok(Received::Upgrade { consumed }) => {
                if let Some(upgrade) = self.pipeline.upgrade.as_mut() {
                    upgrade.trailing.extend_from_slice(&data[consumed..]);
                }
                Ok(())
            }
            Ok(_) => {
                if self.adapter.parser().is_closed() {
                    debug!("server closes connection");
                    tx.close();
                }
                Ok(())
            }
            Err(e) => {
                if let Some((mut request, mut response)) = self.pipeline.incoming.take() {
                    notify_failed(&mut request, &mut response);
                }
                Err(e)
            }
        }
    }

    fn on_ready_to_send(&mut self, tx: &mut dyn Transmit, _event: ConnectionEvent) {
        if let Err(e) = self.send_pending(tx) {
            warn!("request send failed: {:?}", e);
            tx.close();
        }
    }

    fn on_error(&mut self, err: TransportError) {
        warn!("http connection error: {:?}", err);
    }

    fn on_finished(&mut self, state: ClientState) {
        if self.pipeline.incoming.is_some() && self.pipeline.upgrade.is_none() {
            match self.adapter.finish(&mut self.pipeline) {
                Ok(()) => {}
                Err(HandlerError::ParseError(e)) => {
                    // part of the response arrived, the request is not resent
                    warn!("response cut short: {:?}", e);
                    if let Some((mut request, _)) = self.pipeline.incoming.take() {
                        notify_failed(&mut request, &mut Response::new());
                    }
                }
                Err(e) => warn!("response completion failed: {:?}", e),
            }
        }
        debug!("http connection finished: {:?}", state);
        self.pipeline.requeue_in_flight();
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::rc::Rc;
    use alloc::string::String;
    use core::cell::RefCell;
    use std::vec;

    use super::*;
    use crate::config::{ConnectionConfig, HttpServerConfig};
    use crate::endpoint::Endpoint;
    use crate::server::{FnResource, HttpServer};
    use crate::stream::{FileStream, ReadWriteStream};
    use crate::testing::{MemFs, MockSocket, TestRng};

    type Log = Rc<RefCell<Vec<(String, bool, String)>>>;

    fn endpoint(config: HttpClientConfig) -> Endpoint<MockSocket, HttpClientConnection> {
        let mut ep = Endpoint::new(
            MockSocket::new(4096),
            ConnectionConfig::default(),
            HttpClientConnection::new(config, Box::new(TestRng::new(7))),
        );
        ep.connect("example.com", 80, false).unwrap();
        ep
    }

    fn logged(log: &Log, request: Request) -> Request {
        let log = log.clone();
        request.on_complete(Box::new(move |req, resp, ok| {
            log.borrow_mut()
                .push((req.uri.path.clone(), ok, resp.body_to_string()));
            Ok(())
        }))
    }

    fn written(ep: &mut Endpoint<MockSocket, HttpClientConnection>) -> String {
        String::from_utf8(ep.socket_mut().take_written()).unwrap()
    }

    #[test]
    fn test_pipelined_gets_match_in_order() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        for path in ["/a", "/b", "/c"] {
            let url = alloc::format!("http://example.com{path}");
            let req = logged(&log, Request::get(&url).unwrap());
            ep.protocol_mut().send(req).unwrap();
        }
        ep.on_connected(Ok(()));

        let out = written(&mut ep);
        assert_eq!(
            out,
            "GET /a HTTP/1.1\r\nHost: example.com\r\n\r\nGET /b HTTP/1.1\r\nHost: example.com\r\n\r\nGET /c HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
        assert_eq!(ep.protocol().executing(), 3);

        let responses = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nAHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nBHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nC";
        // arbitrary segmentation
        for piece in responses.chunks(7) {
            ep.on_receive(Some(piece));
        }
        assert_eq!(
            *log.borrow(),
            vec![
                ("/a".into(), true, "A".into()),
                ("/b".into(), true, "B".into()),
                ("/c".into(), true, "C".into()),
            ]
        );
        assert!(ep.protocol().is_idle());
    }

    #[test]
    fn test_pipelined_against_server() {
        let server = HttpServer::new(HttpServerConfig::default());
        server.add_resource(
            "*",
            Rc::new(FnResource::new(|req, resp| {
                resp.send_string(alloc::format!("body of {}", req.uri.path));
                Ok(())
            })),
        );
        let mut srv = Endpoint::new(
            MockSocket::new(4096),
            ConnectionConfig::server(),
            server.connection(),
        );
        srv.attach().unwrap();

        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        for path in ["/a", "/b"] {
            let url = alloc::format!("http://example.com{path}");
            ep.protocol_mut()
                .send(logged(&log, Request::get(&url).unwrap()))
                .unwrap();
        }
        ep.on_connected(Ok(()));

        let requests = ep.socket_mut().take_written();
        srv.on_receive(Some(&requests));
        let responses = srv.socket_mut().take_written();
        ep.on_receive(Some(&responses));

        assert_eq!(
            *log.borrow(),
            vec![
                ("/a".into(), true, "body of /a".into()),
                ("/b".into(), true, "body of /b".into()),
            ]
        );
    }

    #[test]
    fn test_post_waits_for_outstanding_response() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(logged(&log, Request::get("http://example.com/first").unwrap()))
            .unwrap();
        ep.protocol_mut()
            .send(logged(
                &log,
                Request::post("http://example.com/form")
                    .unwrap()
                    .with_post_param("name", "a b"),
            ))
            .unwrap();
        ep.on_connected(Ok(()));

        assert_eq!(
            written(&mut ep),
            "GET /first HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
        assert_eq!(ep.protocol().waiting(), 1);

        ep.on_receive(Some(&b"HTTP/1.1 204 No Content\r\n\r\n"[..]));
        assert_eq!(
            written(&mut ep),
            "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nHost: example.com\r\nContent-Length: 8\r\n\r\nname=a%20b"
        );
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_get_after_post_is_not_pipelined() {
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(
                Request::post("http://example.com/p")
                    .unwrap()
                    .with_body(Box::new(MemoryStream::from("x"))),
            )
            .unwrap();
        ep.protocol_mut()
            .send(Request::get("http://example.com/g").unwrap())
            .unwrap();
        ep.on_connected(Ok(()));
        assert!(written(&mut ep).starts_with("POST /p"));
        assert_eq!(ep.protocol().waiting(), 1);
    }

    #[test]
    fn test_retry_then_fail() {
        let mut attempts = 0;
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(logged(
                &log,
                Request::get("http://example.com/flaky").unwrap().with_retries(2),
            ))
            .unwrap();
        ep.on_connected(Ok(()));

        for _ in 0..3 {
            let out = written(&mut ep);
            assert!(out.starts_with("GET /flaky HTTP/1.1\r\n"));
            attempts += 1;
            assert!(log.borrow().is_empty());
            ep.on_receive(Some(
                &b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\n\r\noops"[..],
            ));
        }

        assert_eq!(attempts, 3);
        assert!(written(&mut ep).is_empty());
        assert_eq!(*log.borrow(), vec![("/flaky".into(), false, "oops".into())]);
    }

    #[test]
    fn test_post_not_retried_by_default() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(logged(
                &log,
                Request::post("http://example.com/p")
                    .unwrap()
                    .with_body(Box::new(MemoryStream::from("x")))
                    .with_retries(2),
            ))
            .unwrap();
        ep.on_connected(Ok(()));
        written(&mut ep);
        ep.on_receive(Some(&b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n"[..]));
        assert!(written(&mut ep).is_empty());
        assert!(!log.borrow()[0].1);
    }

    #[test]
    fn test_post_retried_when_always() {
        let mut ep = endpoint(HttpClientConfig::default().with_retry_policy(RetryPolicy::Always));
        ep.protocol_mut()
            .send(
                Request::post("http://example.com/p")
                    .unwrap()
                    .with_body(Box::new(MemoryStream::from("xyz")))
                    .with_retries(1),
            )
            .unwrap();
        ep.on_connected(Ok(()));
        assert!(written(&mut ep).ends_with("\r\n\r\nxyz"));
        ep.on_receive(Some(&b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n"[..]));
        assert!(written(&mut ep).ends_with("\r\n\r\nxyz"));
    }

    #[test]
    fn test_unknown_length_is_chunked() {
        struct Unsized(MemoryStream);
        impl DataSource for Unsized {
            fn read_block(&mut self, buf: &mut [u8]) -> usize {
                self.0.read_block(buf)
            }
            fn seek(&mut self, len: usize) -> bool {
                self.0.seek(len)
            }
            fn is_finished(&self) -> bool {
                self.0.is_finished()
            }
        }

        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(
                Request::post("http://example.com/up")
                    .unwrap()
                    .with_body(Box::new(Unsized(MemoryStream::from("hello")))),
            )
            .unwrap();
        ep.on_connected(Ok(()));
        assert_eq!(
            written(&mut ep),
            "POST /up HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn test_multipart_upload() {
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(
                Request::post("http://example.com/upload")
                    .unwrap()
                    .with_post_param("kind", "log")
                    .with_file("file", Box::new(MemoryStream::from("contents"))),
            )
            .unwrap();
        ep.on_connected(Ok(()));
        let out = written(&mut ep);
        assert!(out.contains("Content-Type: multipart/form-data; boundary=----httpflow"));
        assert!(out.contains("name=\"kind\"\r\n\r\nlog\r\n"));
        assert!(out.contains("filename=\"file\"\r\nContent-Type: application/octet-stream\r\n\r\ncontents\r\n"));
    }

    #[test]
    fn test_backpressure_resumes_body() {
        let mut ep = Endpoint::new(
            MockSocket::new(40),
            ConnectionConfig::default(),
            HttpClientConnection::new(HttpClientConfig::default(), Box::new(TestRng::new(1))),
        );
        ep.connect("example.com", 80, false).unwrap();
        let body: String = core::iter::repeat_n('x', 100).collect();
        ep.protocol_mut()
            .send(
                Request::post("http://example.com/big")
                    .unwrap()
                    .with_body(Box::new(MemoryStream::from(body.as_str()))),
            )
            .unwrap();
        ep.on_connected(Ok(()));

        let mut out = ep.socket_mut().take_written();
        assert_eq!(out.len(), 40);
        for _ in 0..10 {
            ep.socket_mut().ack(40);
            ep.on_sent(40);
            let more = ep.socket_mut().take_written();
            if more.is_empty() {
                break;
            }
            out.extend_from_slice(&more);
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with(&body));
        assert!(text.contains("Content-Length: 100\r\n"));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        let req = Request::new(Method::HEAD, crate::request::Uri::parse("http://example.com/h").unwrap());
        ep.protocol_mut().send(logged(&log, req)).unwrap();
        ep.protocol_mut()
            .send(logged(&log, Request::get("http://example.com/g").unwrap()))
            .unwrap();
        ep.on_connected(Ok(()));
        ep.on_receive(Some(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..],
        ));
        assert_eq!(
            *log.borrow(),
            vec![("/h".into(), true, "".into()), ("/g".into(), true, "ok".into())]
        );
    }

    #[test]
    fn test_response_stream_and_delegates() {
        struct Shared(Rc<RefCell<Vec<u8>>>);
        impl DataSource for Shared {
            fn read_block(&mut self, _buf: &mut [u8]) -> usize {
                0
            }
            fn seek(&mut self, _len: usize) -> bool {
                false
            }
            fn is_finished(&self) -> bool {
                true
            }
        }
        impl ReadWriteStream for Shared {
            fn write(&mut self, data: &[u8]) -> usize {
                self.0.borrow_mut().extend_from_slice(data);
                data.len()
            }
        }

        let sink = Rc::new(RefCell::new(Vec::new()));
        let statuses = Rc::new(RefCell::new(Vec::new()));
        let s = statuses.clone();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(
                Request::get("http://example.com/file")
                    .unwrap()
                    .with_response_stream(Box::new(Shared(sink.clone())))
                    .on_headers_complete(Box::new(move |_req, resp| {
                        s.borrow_mut().push(resp.status.as_u16());
                        Ok(())
                    })),
            )
            .unwrap();
        ep.on_connected(Ok(()));
        ep.on_receive(Some(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n"[..],
        ));
        assert_eq!(*sink.borrow(), b"abc");
        assert_eq!(*statuses.borrow(), vec![200]);
    }

    #[test]
    fn test_download_to_file() {
        let fs = Rc::new(MemFs::new());
        let file = FileStream::create(fs.clone(), "/dl.txt").unwrap();
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(logged(
                &log,
                Request::get("http://example.com/dl.txt")
                    .unwrap()
                    .with_response_stream(Box::new(file)),
            ))
            .unwrap();
        ep.on_connected(Ok(()));
        ep.on_receive(Some(&b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello"[..]));
        ep.on_receive(Some(&b" world"[..]));

        assert_eq!(log.borrow().len(), 1);
        assert!(log.borrow()[0].1);
        assert_eq!(fs.contents("/dl.txt").unwrap(), b"hello world");
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_completion_error_closes_connection() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(
                Request::get("http://example.com/a")
                    .unwrap()
                    .on_complete(Box::new(|_req, _resp, _ok| {
                        Err(HandlerError::CustomError("rejected"))
                    })),
            )
            .unwrap();
        ep.protocol_mut()
            .send(logged(&log, Request::get("http://example.com/b").unwrap()))
            .unwrap();
        ep.on_connected(Ok(()));
        assert!(written(&mut ep).contains("GET /b"));

        ep.on_receive(Some(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..]));

        assert_eq!(ep.socket_mut().closes, 1);
        assert!(!ep.client().connection().is_open());
        // the second request never got its response and waits for the next connection
        assert_eq!(ep.protocol().waiting(), 1);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_truncated_body_fails_request() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(logged(
                &log,
                Request::post("http://example.com/pay")
                    .unwrap()
                    .with_body(Box::new(MemoryStream::from("amount=5"))),
            ))
            .unwrap();
        ep.on_connected(Ok(()));
        written(&mut ep);

        ep.on_receive(Some(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]));
        assert!(log.borrow().is_empty());
        ep.on_receive(None);

        assert_eq!(*log.borrow(), vec![("/pay".into(), false, "".into())]);
        assert_eq!(ep.protocol().waiting(), 0);
        assert_eq!(ep.protocol().executing(), 0);
    }

    #[test]
    fn test_queue_capacity() {
        let mut conn = HttpClientConnection::new(
            HttpClientConfig::default().with_queue_capacity(1),
            Box::new(TestRng::new(1)),
        );
        conn.send(Request::get("http://example.com/").unwrap()).unwrap();
        assert_eq!(
            conn.send(Request::get("http://example.com/").unwrap()),
            Err(ClientError::QueueFull)
        );
    }

    #[test]
    fn test_requeue_after_connection_loss() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        for path in ["/a", "/b"] {
            let url = alloc::format!("http://example.com{path}");
            ep.protocol_mut()
                .send(logged(&log, Request::get(&url).unwrap()))
                .unwrap();
        }
        ep.on_connected(Ok(()));
        written(&mut ep);
        ep.on_error(TransportError::ConnectionReset);

        assert_eq!(ep.protocol().waiting(), 2);
        assert_eq!(ep.protocol().executing(), 0);
        assert!(log.borrow().is_empty());

        // a fresh connection sends them again in order
        ep.connect("example.com", 80, false).unwrap();
        ep.on_connected(Ok(()));
        let out = written(&mut ep);
        let a = out.find("GET /a").unwrap();
        let b = out.find("GET /b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_connection_close_response() {
        let log = Log::default();
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(logged(&log, Request::get("http://example.com/x").unwrap()))
            .unwrap();
        ep.on_connected(Ok(()));
        ep.on_receive(Some(&b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nuntil eof"[..]));
        assert!(log.borrow().is_empty());
        ep.on_receive(None);
        assert_eq!(*log.borrow(), vec![("/x".into(), true, "until eof".into())]);
    }

    #[test]
    fn test_upgrade_keeps_trailing_bytes() {
        let mut ep = endpoint(HttpClientConfig::default());
        ep.protocol_mut()
            .send(Request::get("http://example.com/ws").unwrap())
            .unwrap();
        ep.on_connected(Ok(()));
        ep.on_receive(Some(
            &b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x81\x02hi"[..],
        ));
        ep.on_receive(Some(&b"more"[..]));
        let upgrade = ep.protocol_mut().take_upgrade().unwrap();
        assert_eq!(upgrade.response.status.as_u16(), 101);
        assert_eq!(upgrade.trailing, b"\x81\x02himore");
    }
}
