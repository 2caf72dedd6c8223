use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

use crate::ascii::{COLON, CRLF, SP, atoi};

/// Well known header fields.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderField {
    Accept,
    AccessControlAllowOrigin,
    Authorization,
    CacheControl,
    Connection,
    ContentDisposition,
    ContentEncoding,
    ContentLength,
    ContentType,
    Date,
    ETag,
    Expect,
    Host,
    IfMatch,
    IfModifiedSince,
    IfNoneMatch,
    LastModified,
    Location,
    ProxyAuthenticate,
    SecWebSocketAccept,
    SecWebSocketKey,
    SecWebSocketProtocol,
    SecWebSocketVersion,
    Server,
    SetCookie,
    TransferEncoding,
    Upgrade,
    UserAgent,
    WwwAuthenticate,
}

const KNOWN: [HeaderField; 29] = [
    HeaderField::Accept,
    HeaderField::AccessControlAllowOrigin,
    HeaderField::Authorization,
    HeaderField::CacheControl,
    HeaderField::Connection,
    HeaderField::ContentDisposition,
    HeaderField::ContentEncoding,
    HeaderField::ContentLength,
    HeaderField::ContentType,
    HeaderField::Date,
    HeaderField::ETag,
    HeaderField::Expect,
    HeaderField::Host,
    HeaderField::IfMatch,
    HeaderField::IfModifiedSince,
    HeaderField::IfNoneMatch,
    HeaderField::LastModified,
    HeaderField::Location,
    HeaderField::ProxyAuthenticate,
    HeaderField::SecWebSocketAccept,
    HeaderField::SecWebSocketKey,
    HeaderField::SecWebSocketProtocol,
    HeaderField::SecWebSocketVersion,
    HeaderField::Server,
    HeaderField::SetCookie,
    HeaderField::TransferEncoding,
    HeaderField::Upgrade,
    HeaderField::UserAgent,
    HeaderField::WwwAuthenticate,
];

impl HeaderField {
    /// Canonical field name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "Accept",
            Self::AccessControlAllowOrigin => "Access-Control-Allow-Origin",
            Self::Authorization => "Authorization",
            Self::CacheControl => "Cache-Control",
            Self::Connection => "Connection",
            Self::ContentDisposition => "Content-Disposition",
            Self::ContentEncoding => "Content-Encoding",
            Self::ContentLength => "Content-Length",
            Self::ContentType => "Content-Type",
            Self::Date => "Date",
            Self::ETag => "ETag",
            Self::Expect => "Expect",
            Self::Host => "Host",
            Self::IfMatch => "If-Match",
            Self::IfModifiedSince => "If-Modified-Since",
            Self::IfNoneMatch => "If-None-Match",
            Self::LastModified => "Last-Modified",
            Self::Location => "Location",
            Self::ProxyAuthenticate => "Proxy-Authenticate",
            Self::SecWebSocketAccept => "Sec-WebSocket-Accept",
            Self::SecWebSocketKey => "Sec-WebSocket-Key",
            Self::SecWebSocketProtocol => "Sec-WebSocket-Protocol",
            Self::SecWebSocketVersion => "Sec-WebSocket-Version",
            Self::Server => "Server",
            Self::SetCookie => "Set-Cookie",
            Self::TransferEncoding => "Transfer-Encoding",
            Self::Upgrade => "Upgrade",
            Self::UserAgent => "User-Agent",
            Self::WwwAuthenticate => "WWW-Authenticate",
        }
    }

    /// Look up a well known field by name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        KNOWN
            .iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(name))
            .copied()
    }

    /// Fields sent as separate header lines rather than one comma separated list.
    pub fn is_multi_value(&self) -> bool {
        matches!(
            self,
            Self::SetCookie | Self::WwwAuthenticate | Self::ProxyAuthenticate
        )
    }
}

/// A header field name: either a well known [`HeaderField`] or any other name.
///
/// Names compare case-insensitively, and converting from a string yields the well known tag when
/// there is one, so `"content-type"` and `HeaderField::ContentType` address the same entry.
#[derive(Clone, Debug)]
pub enum HeaderName {
    /// A well known field
    Known(HeaderField),
    /// Any other field, as received or set
    Custom(String),
}

impl HeaderName {
    /// The field name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(f) => f.as_str(),
            Self::Custom(s) => s.as_str(),
        }
    }

    fn is_multi_value(&self) -> bool {
        matches!(self, Self::Known(f) if f.is_multi_value())
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Known(a), Self::Known(b)) => a == b,
            _ => self.as_str().eq_ignore_ascii_case(other.as_str()),
        }
    }
}

impl Eq for HeaderName {}

impl From<HeaderField> for HeaderName {
    fn from(value: HeaderField) -> Self {
        Self::Known(value)
    }
}

impl From<&str> for HeaderName {
    fn from(value: &str) -> Self {
        match HeaderField::from_name(value) {
            Some(f) => Self::Known(f),
            None => Self::Custom(String::from(value)),
        }
    }
}

impl From<String> for HeaderName {
    fn from(value: String) -> Self {
        match HeaderField::from_name(&value) {
            Some(f) => Self::Known(f),
            None => Self::Custom(value),
        }
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `true` if the comma separated `value` contains `token`, ignoring case.
pub fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// An insertion ordered header map.
///
/// Each logical field has at most one entry, except the multi value fields (`Set-Cookie`,
/// `WWW-Authenticate`, `Proxy-Authenticate`) which [`append`](Self::append) adds as separate
/// lines.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpHeaders {
    entries: Vec<(HeaderName, String)>,
}

impl HttpHeaders {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value of `name`.
    pub fn get(&self, name: impl Into<HeaderName>) -> Option<&str> {
        let name = name.into();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `name`, in insertion order.
    pub fn get_all(&self, name: impl Into<HeaderName>) -> impl Iterator<Item = &str> {
        let name = name.into();
        self.entries
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `true` if `name` is present.
    pub fn contains(&self, name: impl Into<HeaderName>) -> bool {
        self.get(name).is_some()
    }

    /// Set `name` to `value`, replacing any existing value in place.
    pub fn set(&mut self, name: impl Into<HeaderName>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(i) => {
                self.entries[i].1 = value;
                let mut idx = 0;
                self.entries.retain(|(n, _)| {
                    idx += 1;
                    idx - 1 <= i || *n != name
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Add `value` to `name`. Multi value fields get a new line, other fields have the value
    /// joined onto the existing one with a comma.
    pub fn append(&mut self, name: impl Into<HeaderName>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if name.is_multi_value() {
            self.entries.push((name, value));
            return;
        }
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Remove every value of `name`, returning the first.
    pub fn remove(&mut self, name: impl Into<HeaderName>) -> Option<String> {
        let name = name.into();
        let first = self.entries.iter().position(|(n, _)| *n == name)?;
        let (_, value) = self.entries.remove(first);
        self.entries.retain(|(n, _)| *n != name);
        Some(value)
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &str)> {
        self.entries.iter().map(|(n, v)| (n, v.as_str()))
    }

    /// Copy every entry of `other` into `self` with [`set`](Self::set) semantics.
    pub fn merge(&mut self, other: &HttpHeaders) {
        for (name, value) in other.iter() {
            if name.is_multi_value() {
                self.append(name.clone(), value);
            } else {
                self.set(name.clone(), value);
            }
        }
    }

    /// `Content-Length` as a number.
    pub fn content_length(&self) -> Option<u64> {
        self.get(HeaderField::ContentLength)
            .and_then(|v| atoi(v.trim().as_bytes()))
    }

    /// `true` if `name` lists `token`, as in `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: impl Into<HeaderName>, token: &str) -> bool {
        let name = name.into();
        self.entries
            .iter()
            .any(|(n, v)| *n == name && has_token(v, token))
    }

    /// Append the wire form, one `Name: value\r\n` line per entry.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(&[COLON, SP]);
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;
    use std::vec::Vec;

    use super::*;

    #[test]
    fn test_known_lookup() {
        assert_eq!(
            HeaderField::from_name("content-TYPE"),
            Some(HeaderField::ContentType)
        );
        assert_eq!(
            HeaderField::from_name("sec-websocket-key"),
            Some(HeaderField::SecWebSocketKey)
        );
        assert_eq!(HeaderField::from_name("X-Custom"), None);
        for f in KNOWN {
            assert_eq!(HeaderField::from_name(f.as_str()), Some(f));
        }
    }

    #[test]
    fn test_tag_and_string_agree() {
        let mut h = HttpHeaders::new();
        h.set(HeaderField::ContentType, "text/html");
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get("Content-Type"), Some("text/html"));

        h.set("CONTENT-TYPE", "application/json");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(HeaderField::ContentType), Some("application/json"));

        h.set("X-Request-Id", "1");
        h.set("x-request-id", "2");
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("X-REQUEST-ID"), Some("2"));
    }

    #[test]
    fn test_custom_name_matches_known() {
        let mut h = HttpHeaders::new();
        h.set(HeaderName::Custom("host".into()), "a");
        h.set(HeaderField::Host, "b");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("HOST"), Some("b"));
    }

    #[test]
    fn test_set_keeps_order() {
        let mut h = HttpHeaders::new();
        h.set(HeaderField::Host, "example.com");
        h.set(HeaderField::ContentLength, "0");
        h.set(HeaderField::Host, "example.org");
        let names: Vec<&str> = h.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Host", "Content-Length"]);
    }

    #[test]
    fn test_multi_value() {
        let mut h = HttpHeaders::new();
        h.append(HeaderField::SetCookie, "a=1");
        h.append("set-cookie", "b=2");
        h.append(HeaderField::Accept, "text/html");
        h.append(HeaderField::Accept, "*/*");
        assert_eq!(h.len(), 3);
        assert_eq!(
            h.get_all(HeaderField::SetCookie).collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
        assert_eq!(h.get(HeaderField::Accept), Some("text/html, */*"));

        h.set(HeaderField::SetCookie, "c=3");
        assert_eq!(h.get_all("Set-Cookie").count(), 1);
        assert_eq!(h.remove("set-cookie"), Some("c=3".into()));
        assert!(!h.contains(HeaderField::SetCookie));
    }

    #[test]
    fn test_tokens_and_length() {
        let mut h = HttpHeaders::new();
        h.set(HeaderField::Connection, "keep-alive, Upgrade");
        h.set(HeaderField::ContentLength, " 42 ");
        assert!(h.has_token(HeaderField::Connection, "upgrade"));
        assert!(!h.has_token(HeaderField::Connection, "close"));
        assert_eq!(h.content_length(), Some(42));
    }

    #[test]
    fn test_write_to() {
        let mut h = HttpHeaders::new();
        h.set(HeaderField::Host, "example.com");
        h.set("X-Thing", "yes");
        let mut out = Vec::new();
        h.write_to(&mut out);
        assert_eq!(out, b"Host: example.com\r\nX-Thing: yes\r\n");
    }
}
