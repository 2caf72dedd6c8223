use alloc::boxed::Box;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use crate::ascii::{AsciiInt, CRLF, SP};
use crate::header::{HeaderField, HttpHeaders};
use crate::stream::{DataSource, FileStream, MemoryStream, ReadWriteStream, read_to_end};
use crate::transport::{FileSystem, FsError};

pub(crate) const HTTP_PROTO: &str = "HTTP/1.1";

/// Status code of a response.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusCode {
    /// 101 Switching Protocols - eg from HTTP to Websocket
    SwitchingProtocols,
    /// 200 Ok
    OK,
    /// 201 Created
    Created,
    /// 204 No Content
    NoContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 302 Found
    Found,
    /// 304 Not Modified
    NotModified,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 412 Precondition Failed
    PreconditionFailed,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 431 Request Header Fields Too Large
    HeaderFieldsTooLarge,
    /// 500 Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// Any other code
    Other(u16),
}

const KNOWN: [StatusCode; 18] = [
    StatusCode::SwitchingProtocols,
    StatusCode::OK,
    StatusCode::Created,
    StatusCode::NoContent,
    StatusCode::MovedPermanently,
    StatusCode::Found,
    StatusCode::NotModified,
    StatusCode::BadRequest,
    StatusCode::Unauthorized,
    StatusCode::Forbidden,
    StatusCode::NotFound,
    StatusCode::MethodNotAllowed,
    StatusCode::PreconditionFailed,
    StatusCode::PayloadTooLarge,
    StatusCode::HeaderFieldsTooLarge,
    StatusCode::InternalServerError,
    StatusCode::NotImplemented,
    StatusCode::ServiceUnavailable,
];

impl StatusCode {
    /// Numeric code.
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::SwitchingProtocols => 101,
            Self::OK => 200,
            Self::Created => 201,
            Self::NoContent => 204,
            Self::MovedPermanently => 301,
            Self::Found => 302,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::PreconditionFailed => 412,
            Self::PayloadTooLarge => 413,
            Self::HeaderFieldsTooLarge => 431,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
            Self::Other(n) => *n,
        }
    }

    /// Reason phrase, empty for codes without one.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SwitchingProtocols => "Switching Protocols",
            Self::OK => "OK",
            Self::Created => "Created",
            Self::NoContent => "No Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::PreconditionFailed => "Precondition Failed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::Other(_) => "",
        }
    }

    /// 2xx and 3xx codes.
    pub fn is_success(&self) -> bool {
        (200..=399).contains(&self.as_u16())
    }

    /// Codes whose responses never carry a body.
    pub fn forbids_body(&self) -> bool {
        let code = self.as_u16();
        code < 200 || code == 204 || code == 304
    }
}

impl From<u16> for StatusCode {
    fn from(value: u16) -> Self {
        KNOWN
            .into_iter()
            .find(|s| s.as_u16() == value)
            .unwrap_or(Self::Other(value))
    }
}

/// Content type for a file name, by extension.
pub fn mime_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or_default();
    const TYPES: [(&str, &str); 12] = [
        ("html", "text/html"),
        ("htm", "text/html"),
        ("css", "text/css"),
        ("js", "text/javascript"),
        ("json", "application/json"),
        ("txt", "text/plain"),
        ("xml", "text/xml"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("gif", "image/gif"),
        ("svg", "image/svg+xml"),
        ("ico", "image/x-icon"),
    ];
    TYPES
        .iter()
        .find(|(e, _)| e.eq_ignore_ascii_case(ext))
        .map_or("application/octet-stream", |(_, t)| t)
}

/// An HTTP response.
///
/// A server fills in the status, headers and outgoing body. A client receives the status and
/// headers from the parser and the body into its buffer.
pub struct Response {
    /// Status
    pub status: StatusCode,
    /// Headers
    pub headers: HttpHeaders,
    body: Option<Box<dyn DataSource>>,
    buffer: Option<Box<dyn ReadWriteStream>>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// `200 OK` without body.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HttpHeaders::new(),
            body: None,
            buffer: None,
        }
    }

    /// Clear everything for the next message on the connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Set the status.
    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// `true` for 2xx and 3xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Send `body` as the response body.
    pub fn set_body(&mut self, body: Box<dyn DataSource>) -> &mut Self {
        self.body = Some(body);
        self
    }

    /// `true` while an outgoing body is attached.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Move the outgoing body out.
    pub fn take_body(&mut self) -> Option<Box<dyn DataSource>> {
        self.body.take()
    }

    /// Length of the outgoing body, if known.
    pub fn body_len(&self) -> Option<usize> {
        self.body.as_ref().and_then(|b| b.available())
    }

    /// Identity of the outgoing body, used as ETag.
    pub(crate) fn body_id(&self) -> Option<String> {
        self.body.as_ref().and_then(|b| b.id())
    }

    /// Send a string body.
    pub fn send_string(&mut self, body: impl Into<String>) -> &mut Self {
        self.set_body(Box::new(MemoryStream::from(body.into())))
    }

    /// Send a file. The content type is chosen by extension unless already set.
    pub fn send_file(&mut self, fs: Rc<dyn FileSystem>, path: &str) -> Result<&mut Self, FsError> {
        let file = FileStream::open(fs, path)?;
        if !self.headers.contains(HeaderField::ContentType) {
            self.headers.set(HeaderField::ContentType, mime_type(path));
        }
        Ok(self.set_body(Box::new(file)))
    }

    /// `302 Found` pointing at `location`.
    pub fn redirect(&mut self, location: &str) -> &mut Self {
        self.status = StatusCode::Found;
        self.headers.set(HeaderField::Location, location);
        self
    }

    /// Receive the incoming body into `buffer`.
    pub fn set_buffer(&mut self, buffer: Box<dyn ReadWriteStream>) {
        self.buffer = Some(buffer);
    }

    /// Store an incoming body chunk. Returns the number of bytes kept.
    pub(crate) fn write_body(&mut self, data: &[u8]) -> usize {
        match &mut self.buffer {
            Some(buffer) => buffer.write(data),
            None => 0,
        }
    }

    /// Move the incoming body buffer out.
    pub fn take_buffer(&mut self) -> Option<Box<dyn ReadWriteStream>> {
        self.buffer.take()
    }

    /// Consume the incoming body as text.
    pub fn body_to_string(&mut self) -> String {
        match &mut self.buffer {
            Some(buffer) => {
                let data = read_to_end(buffer.as_mut());
                String::from_utf8_lossy(&data).into_owned()
            }
            None => String::new(),
        }
    }

    /// Append the status line.
    pub(crate) fn write_status_line(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(HTTP_PROTO.as_bytes());
        out.push(SP);
        out.extend_from_slice(AsciiInt::from(self.status.as_u16() as u64).as_bytes());
        out.push(SP);
        out.extend_from_slice(self.status.reason().as_bytes());
        out.extend_from_slice(CRLF);
    }

    /// Quoted ETag for an id.
    pub(crate) fn etag_for(id: &str) -> String {
        format!("\"{id}\"")
    }
}

impl core::fmt::Debug for Response {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}
