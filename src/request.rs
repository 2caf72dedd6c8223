use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

use crate::ascii::atoi;
use crate::client::ClientError;
use crate::header::{HeaderName, HttpHeaders};
use crate::parser::ParseError;
use crate::response::Response;
use crate::server::HandlerError;
use crate::stream::{DataSource, ReadWriteStream, decode_component, decode_form};

const GET: &[u8] = b"GET";
const POST: &[u8] = b"POST";
const PUT: &[u8] = b"PUT";
const PATCH: &[u8] = b"PATCH";
const DELETE: &[u8] = b"DELETE";
const OPTIONS: &[u8] = b"OPTIONS";
const HEAD: &[u8] = b"HEAD";
const CONNECT: &[u8] = b"CONNECT";
const TRACE: &[u8] = b"TRACE";

/// Method such as GET. POST, DELETE etc.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Method {
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    OPTIONS,
    HEAD,
    CONNECT,
    TRACE,
}

impl Method {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::PUT => "PUT",
            Self::PATCH => "PATCH",
            Self::DELETE => "DELETE",
            Self::OPTIONS => "OPTIONS",
            Self::HEAD => "HEAD",
            Self::CONNECT => "CONNECT",
            Self::TRACE => "TRACE",
        }
    }

    /// Repeating the request has the same effect as sending it once.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::POST | Self::PATCH | Self::CONNECT)
    }

    /// May be sent while an earlier response is still outstanding.
    pub fn can_pipeline(&self) -> bool {
        matches!(self, Self::GET | Self::HEAD)
    }
}

impl TryFrom<&[u8]> for Method {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match value {
            GET => Ok(Self::GET),
            POST => Ok(Self::POST),
            PUT => Ok(Self::PUT),
            PATCH => Ok(Self::PATCH),
            DELETE => Ok(Self::DELETE),
            OPTIONS => Ok(Self::OPTIONS),
            HEAD => Ok(Self::HEAD),
            CONNECT => Ok(Self::CONNECT),
            TRACE => Ok(Self::TRACE),
            _ => Err(ParseError::InvalidMethod),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URI scheme.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        [Self::Http, Self::Https, Self::Ws, Self::Wss]
            .into_iter()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(s))
    }

    /// Scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// Port used when the URI names none.
    pub fn default_port(&self) -> u16 {
        if self.is_secure() { 443 } else { 80 }
    }

    /// Runs over TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Https | Self::Wss)
    }
}

/// A request target.
///
/// Absolute URIs carry scheme, host and port. Origin form targets as received by a server
/// (`/path?query`) only carry the path and query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Uri {
    /// Scheme, if absolute
    pub scheme: Option<Scheme>,
    /// Host, empty for origin form
    pub host: String,
    /// Explicit port, if given
    pub port: Option<u16>,
    /// Path, always starting with `/`
    pub path: String,
    /// Query without the leading `?`
    pub query: String,
}

impl Uri {
    /// Parse an absolute (`http://host:port/path?q`) or origin form (`/path?q`) URI.
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        let s = s.split('#').next().unwrap_or_default();
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (
                Some(Scheme::parse(scheme).ok_or(ClientError::InvalidUri)?),
                rest,
            ),
            None if s.starts_with('/') => (None, s),
            None => return Err(ClientError::InvalidUri),
        };

        let (authority, target) = match scheme {
            Some(_) => match rest.find(['/', '?']) {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, ""),
            },
            None => ("", rest),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = atoi(port.as_bytes())
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or(ClientError::InvalidUri)?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if scheme.is_some() && host.is_empty() {
            return Err(ClientError::InvalidUri);
        }

        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let path = if path.is_empty() { "/" } else { path };

        Ok(Self {
            scheme,
            host: String::from(host),
            port,
            path: String::from(path),
            query: String::from(query),
        })
    }

    /// Port to connect to.
    pub fn port_or_default(&self) -> u16 {
        self.port
            .unwrap_or_else(|| self.scheme.map_or(80, |s| s.default_port()))
    }

    /// `true` for `https` and `wss`.
    pub fn is_secure(&self) -> bool {
        self.scheme.is_some_and(|s| s.is_secure())
    }

    /// The request target on the wire: path plus query.
    pub fn path_and_query(&self) -> String {
        let mut s = self.path.clone();
        if !self.query.is_empty() {
            s.push('?');
            s.push_str(&self.query);
        }
        s
    }

    /// Value for the `Host` header.
    pub fn host_header(&self) -> String {
        match self.port {
            Some(port) if Some(port) != self.scheme.map(|s| s.default_port()) => {
                alloc::format!("{}:{}", self.host, port)
            }
            _ => self.host.clone(),
        }
    }

    /// Percent-decoded path.
    pub fn decoded_path(&self) -> String {
        decode_component(&self.path)
    }

    /// Decoded query parameters.
    pub fn query_params(&self) -> Vec<(String, String)> {
        decode_form(&self.query)
    }
}

/// Called once the response headers are in. An error aborts the connection.
pub type HeadersCompleteDelegate = Box<dyn FnMut(&Request, &Response) -> Result<(), HandlerError>>;

/// Receives response body chunks in place of the response buffer.
pub type BodyDelegate = Box<dyn FnMut(&Request, &[u8]) -> Result<(), HandlerError>>;

/// Called once with the final outcome of the request. An error aborts the connection.
pub type CompletionDelegate =
    Box<dyn FnMut(&Request, &mut Response, bool) -> Result<(), HandlerError>>;

/// An HTTP request.
///
/// Client code builds one and hands it to a connection, which then owns it until the completion
/// delegate has run. The body stream is moved out with [`take_body`](Self::take_body) when it is
/// queued for transmission, so the request never shares a stream with the connection.
///
/// On the server side the connection fills one in from the parser.
pub struct Request {
    /// Method
    pub method: Method,
    /// Target
    pub uri: Uri,
    /// Headers
    pub headers: HttpHeaders,
    /// Form parameters, sent urlencoded (or as multipart fields when files are attached). On the
    /// server this holds the decoded form body.
    pub post_params: Vec<(String, String)>,
    /// Number of automatic resends left after a failed response
    pub retries: u8,
    body: Option<Box<dyn DataSource>>,
    files: Vec<(String, Box<dyn DataSource>)>,
    retry_body: Option<Box<dyn DataSource>>,
    retry_files: Vec<(String, Box<dyn DataSource>)>,
    retry_kept: bool,
    payload_taken: bool,
    pub(crate) on_headers_complete: Option<HeadersCompleteDelegate>,
    pub(crate) on_body: Option<BodyDelegate>,
    pub(crate) on_complete: Option<CompletionDelegate>,
    pub(crate) response_stream: Option<Box<dyn ReadWriteStream>>,
}

impl Request {
    /// Empty request.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HttpHeaders::new(),
            post_params: Vec::new(),
            retries: 0,
            body: None,
            files: Vec::new(),
            retry_body: None,
            retry_files: Vec::new(),
            retry_kept: false,
            payload_taken: false,
            on_headers_complete: None,
            on_body: None,
            on_complete: None,
            response_stream: None,
        }
    }

    /// `GET url`.
    pub fn get(url: &str) -> Result<Self, ClientError> {
        Ok(Self::new(Method::GET, Uri::parse(url)?))
    }

    /// `POST url`.
    pub fn post(url: &str) -> Result<Self, ClientError> {
        Ok(Self::new(Method::POST, Uri::parse(url)?))
    }

    /// Set a header.
    pub fn with_header(mut self, name: impl Into<HeaderName>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Attach a raw body.
    pub fn with_body(mut self, body: Box<dyn DataSource>) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a form parameter.
    pub fn with_post_param(mut self, name: &str, value: &str) -> Self {
        self.post_params.push((String::from(name), String::from(value)));
        self
    }

    /// Attach a file, which turns the body into `multipart/form-data`.
    pub fn with_file(mut self, field: &str, file: Box<dyn DataSource>) -> Self {
        self.files.push((String::from(field), file));
        self
    }

    /// Allow `count` automatic resends.
    pub fn with_retries(mut self, count: u8) -> Self {
        self.retries = count;
        self
    }

    /// Write the response body into `stream` instead of the internal buffer.
    pub fn with_response_stream(mut self, stream: Box<dyn ReadWriteStream>) -> Self {
        self.response_stream = Some(stream);
        self
    }

    /// Set the headers complete delegate.
    pub fn on_headers_complete(mut self, delegate: HeadersCompleteDelegate) -> Self {
        self.on_headers_complete = Some(delegate);
        self
    }

    /// Set the body delegate.
    pub fn on_body(mut self, delegate: BodyDelegate) -> Self {
        self.on_body = Some(delegate);
        self
    }

    /// Set the completion delegate.
    pub fn on_complete(mut self, delegate: CompletionDelegate) -> Self {
        self.on_complete = Some(delegate);
        self
    }

    /// `true` while a raw body is attached.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Move the raw body out. The request no longer owns it afterwards.
    pub fn take_body(&mut self) -> Option<Box<dyn DataSource>> {
        let body = self.body.take();
        self.payload_taken |= body.is_some();
        body
    }

    /// `true` while files are attached.
    pub fn has_files(&self) -> bool {
        !self.files.is_empty()
    }

    pub(crate) fn take_files(&mut self) -> Vec<(String, Box<dyn DataSource>)> {
        self.payload_taken |= !self.files.is_empty();
        core::mem::take(&mut self.files)
    }

    /// Keep copies of the body and files so the request can be sent again. Returns `false` if a
    /// resend is not allowed or part of the payload cannot be copied.
    pub(crate) fn keep_for_retry(&mut self) -> bool {
        self.retry_kept = false;
        self.retry_body = None;
        self.retry_files.clear();
        if self.retries == 0 {
            return false;
        }
        if let Some(body) = &self.body {
            match body.duplicate() {
                Some(copy) => self.retry_body = Some(copy),
                None => return false,
            }
        }
        for (name, file) in &self.files {
            match file.duplicate() {
                Some(copy) => self.retry_files.push((name.clone(), copy)),
                None => return false,
            }
        }
        self.retry_kept = true;
        true
    }

    /// Make the request sendable again after its payload was taken. Returns `false` if the
    /// payload is gone for good.
    pub(crate) fn rewind(&mut self) -> bool {
        if !self.payload_taken {
            return true;
        }
        if !self.retry_kept {
            return false;
        }
        self.body = self.retry_body.take();
        self.files = core::mem::take(&mut self.retry_files);
        self.retry_kept = false;
        self.payload_taken = false;
        true
    }

    /// A parameter from the form body, falling back to the query string.
    pub fn param(&self, name: &str) -> Option<String> {
        self.post_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .or_else(|| {
                self.uri
                    .query_params()
                    .into_iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v)
            })
    }
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("retries", &self.retries)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;

    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn test_method() {
        assert_eq!(Method::try_from(&b"GET"[..]), Ok(Method::GET));
        assert_eq!(Method::try_from(&b"TRACE"[..]), Ok(Method::TRACE));
        assert_eq!(
            Method::try_from(&b"get"[..]),
            Err(ParseError::InvalidMethod)
        );
        assert!(Method::HEAD.can_pipeline());
        assert!(!Method::POST.can_pipeline());
        assert!(Method::PUT.is_idempotent());
        assert!(!Method::POST.is_idempotent());
    }

    #[test]
    fn test_absolute_uri() {
        let uri = Uri::parse("https://example.com:8443/a/b?x=1&y=two%20words#frag").unwrap();
        assert_eq!(uri.scheme, Some(Scheme::Https));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port_or_default(), 8443);
        assert_eq!(uri.path, "/a/b");
        assert_eq!(uri.path_and_query(), "/a/b?x=1&y=two%20words");
        assert_eq!(uri.host_header(), "example.com:8443");
        assert!(uri.is_secure());
        assert_eq!(
            uri.query_params(),
            vec![("x".into(), "1".into()), ("y".into(), "two words".into())]
        );
    }

    #[test]
    fn test_default_port_and_path() {
        let uri = Uri::parse("http://example.com").unwrap();
        assert_eq!(uri.port_or_default(), 80);
        assert_eq!(uri.path_and_query(), "/");
        assert_eq!(uri.host_header(), "example.com");

        let uri = Uri::parse("ws://example.com:80?q").unwrap();
        assert_eq!(uri.path_and_query(), "/?q");
        assert_eq!(uri.host_header(), "example.com");
    }

    #[test]
    fn test_origin_form() {
        let uri = Uri::parse("/index.html?foo=bar").unwrap();
        assert_eq!(uri.scheme, None);
        assert_eq!(uri.host, "");
        assert_eq!(uri.path, "/index.html");
        assert_eq!(uri.query, "foo=bar");
    }

    #[test]
    fn test_invalid_uri() {
        assert_eq!(Uri::parse("example.com"), Err(ClientError::InvalidUri));
        assert_eq!(Uri::parse("ftp://x/"), Err(ClientError::InvalidUri));
        assert_eq!(Uri::parse("http://x:99999/"), Err(ClientError::InvalidUri));
        assert_eq!(Uri::parse("http:///path"), Err(ClientError::InvalidUri));
    }

    #[test]
    fn test_body_taken_once() {
        let mut req = Request::post("http://example.com/upload")
            .unwrap()
            .with_body(Box::new(MemoryStream::from("data")));
        assert!(req.has_body());
        let body = req.take_body();
        assert!(body.is_some());
        assert!(!req.has_body());
        assert!(req.take_body().is_none());
        drop(req);
        drop(body);
    }

    #[test]
    fn test_rewind_restores_payload() {
        let mut req = Request::post("http://example.com/")
            .unwrap()
            .with_body(Box::new(MemoryStream::from("data")))
            .with_retries(1);
        assert!(req.rewind());
        assert!(req.keep_for_retry());
        let mut body = req.take_body().unwrap();
        assert!(body.seek(4));
        assert!(req.rewind());
        let mut again = req.take_body().unwrap();
        assert_eq!(crate::stream::read_to_end(again.as_mut()), b"data");
        // copies are used up
        assert!(!req.rewind());
    }

    #[test]
    fn test_rewind_without_copies() {
        let mut req = Request::post("http://example.com/")
            .unwrap()
            .with_body(Box::new(MemoryStream::from("data")));
        assert!(!req.keep_for_retry());
        req.take_body();
        assert!(!req.rewind());

        let mut get = Request::get("http://example.com/").unwrap();
        assert!(!get.keep_for_retry());
        assert!(get.rewind());
    }

    #[test]
    fn test_param_lookup() {
        let mut req = Request::new(Method::POST, Uri::parse("/form?a=1&b=2").unwrap());
        req.post_params.push(("a".into(), "form".into()));
        assert_eq!(req.param("a").as_deref(), Some("form"));
        assert_eq!(req.param("b").as_deref(), Some("2"));
        assert_eq!(req.param("c"), None);
    }
}
