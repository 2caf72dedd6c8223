//! Lazy byte producers consumed by the connection write path.
//!
//! A [`DataSource`] is read in two steps: [`read_block`](DataSource::read_block) copies the next
//! bytes without consuming them, then [`seek`](DataSource::seek) consumes however many the socket
//! actually accepted. This lets a writer retry the unsent tail on the next event without any
//! extra buffering.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use rand_core::RngCore;

use crate::ascii::{AsciiInt, CRLF};
use crate::transport::{FileHandle, FileStat, FileSystem, FsError};

/// Size of the chunks emitted by [`ChunkedStream`].
pub const CHUNK_SIZE: usize = 1024;

/// Characters left untouched by form url-encoding.
const FORM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A source of bytes, read in peek-then-seek steps.
pub trait DataSource {
    /// Copy the next bytes into `buf` without consuming them. Returns `0` when nothing is
    /// available right now, which does not imply the stream is finished.
    fn read_block(&mut self, buf: &mut [u8]) -> usize;

    /// Consume `len` bytes. Returns `false` if fewer were available.
    fn seek(&mut self, len: usize) -> bool;

    /// `true` once every byte has been consumed.
    fn is_finished(&self) -> bool;

    /// Number of bytes left, when known up front.
    fn available(&self) -> Option<usize> {
        None
    }

    /// Stable identifier of the content, used as an entity tag.
    fn id(&self) -> Option<String> {
        None
    }

    /// Name of the content, such as a file name.
    fn name(&self) -> Option<&str> {
        None
    }

    /// An independent copy starting at the current position, when the source can provide one.
    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        None
    }
}

/// A [`DataSource`] that also accepts writes.
pub trait ReadWriteStream: DataSource {
    /// Append `data`, returning how many bytes were stored.
    fn write(&mut self, data: &[u8]) -> usize;
}

/// Drain a stream into a vector.
pub fn read_to_end(stream: &mut dyn DataSource) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read_block(&mut buf);
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
        stream.seek(n);
    }
    out
}

/// XOR `data` with the repeating 4 byte `mask`, starting `offset` bytes into the mask.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[(offset + i) % 4];
    }
}

/// An in-memory buffer, optionally capped in size.
#[derive(Clone, Debug, Default)]
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
    limit: Option<usize>,
}

impl MemoryStream {
    /// Empty stream without a size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty stream that stores at most `limit` bytes; writes beyond it are truncated.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Consume the stream returning the unread bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.drain(..self.pos);
        self.data
    }
}

impl From<Vec<u8>> for MemoryStream {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            limit: None,
        }
    }
}

impl From<&[u8]> for MemoryStream {
    fn from(data: &[u8]) -> Self {
        Self::from(data.to_vec())
    }
}

impl From<&str> for MemoryStream {
    fn from(data: &str) -> Self {
        Self::from(data.as_bytes().to_vec())
    }
}

impl From<String> for MemoryStream {
    fn from(data: String) -> Self {
        Self::from(data.into_bytes())
    }
}

impl DataSource for MemoryStream {
    fn read_block(&mut self, buf: &mut [u8]) -> usize {
        let rest = self.remaining();
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        n
    }

    fn seek(&mut self, len: usize) -> bool {
        if len > self.data.len() - self.pos {
            self.pos = self.data.len();
            return false;
        }
        self.pos += len;
        true
    }

    fn is_finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn available(&self) -> Option<usize> {
        Some(self.data.len() - self.pos)
    }

    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        Some(Box::new(MemoryStream {
            data: self.remaining().to_vec(),
            pos: 0,
            limit: self.limit,
        }))
    }
}

impl ReadWriteStream for MemoryStream {
    fn write(&mut self, data: &[u8]) -> usize {
        let n = match self.limit {
            Some(limit) => data.len().min(limit.saturating_sub(self.data.len())),
            None => data.len(),
        };
        self.data.extend_from_slice(&data[..n]);
        n
    }
}

/// A file read through a [`FileSystem`].
pub struct FileStream {
    fs: Rc<dyn FileSystem>,
    handle: FileHandle,
    path: String,
    pos: usize,
    stat: FileStat,
}

impl FileStream {
    /// Open an existing file for reading.
    pub fn open(fs: Rc<dyn FileSystem>, path: &str) -> Result<Self, FsError> {
        Self::new(fs, path, false)
    }

    /// Create (or truncate) a file for writing.
    pub fn create(fs: Rc<dyn FileSystem>, path: &str) -> Result<Self, FsError> {
        Self::new(fs, path, true)
    }

    fn new(fs: Rc<dyn FileSystem>, path: &str, create: bool) -> Result<Self, FsError> {
        let handle = fs.open(path, create)?;
        let stat = match fs.stat(handle) {
            Ok(stat) => stat,
            Err(e) => {
                fs.close(handle);
                return Err(e);
            }
        };
        Ok(Self {
            fs,
            handle,
            path: String::from(path),
            pos: 0,
            stat,
        })
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Total file size.
    pub fn size(&self) -> usize {
        self.stat.size
    }
}

impl DataSource for FileStream {
    fn read_block(&mut self, buf: &mut [u8]) -> usize {
        if self.is_finished() {
            return 0;
        }
        let want = buf.len().min(self.stat.size - self.pos);
        let res = self
            .fs
            .seek(self.handle, self.pos)
            .and_then(|_| self.fs.read(self.handle, &mut buf[..want]));
        match res {
            Ok(n) => n,
            Err(e) => {
                warn!("file read failed: {:?}", e);
                0
            }
        }
    }

    fn seek(&mut self, len: usize) -> bool {
        if len > self.stat.size - self.pos {
            self.pos = self.stat.size;
            return false;
        }
        self.pos += len;
        true
    }

    fn is_finished(&self) -> bool {
        self.pos >= self.stat.size
    }

    fn available(&self) -> Option<usize> {
        Some(self.stat.size - self.pos)
    }

    fn id(&self) -> Option<String> {
        Some(format!("{:x}-{:x}", self.stat.size, self.stat.modified))
    }

    fn name(&self) -> Option<&str> {
        self.path.rsplit('/').next()
    }

    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        let mut copy = FileStream::open(self.fs.clone(), &self.path).ok()?;
        copy.seek(self.pos);
        Some(Box::new(copy))
    }
}

impl ReadWriteStream for FileStream {
    fn write(&mut self, data: &[u8]) -> usize {
        let res = self
            .fs
            .seek(self.handle, self.stat.size)
            .and_then(|_| self.fs.write(self.handle, data));
        match res {
            Ok(n) => {
                self.stat.size += n;
                n
            }
            Err(e) => {
                warn!("file write failed: {:?}", e);
                0
            }
        }
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.fs.close(self.handle);
    }
}

/// Frames another stream with HTTP chunked transfer-encoding.
pub struct ChunkedStream {
    inner: Box<dyn DataSource>,
    block: Vec<u8>,
    frame: Vec<u8>,
    pos: usize,
    done: bool,
}

impl ChunkedStream {
    /// Wrap `inner`.
    pub fn new(inner: Box<dyn DataSource>) -> Self {
        Self {
            inner,
            block: Vec::new(),
            frame: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn fill(&mut self) {
        if self.pos < self.frame.len() || self.done {
            return;
        }
        self.frame.clear();
        self.pos = 0;

        self.block.resize(CHUNK_SIZE, 0);
        let n = self.inner.read_block(&mut self.block);
        if n > 0 {
            self.inner.seek(n);
            self.frame
                .extend_from_slice(AsciiInt::hex(n as u64).as_bytes());
            self.frame.extend_from_slice(CRLF);
            self.frame.extend_from_slice(&self.block[..n]);
            self.frame.extend_from_slice(CRLF);
        } else if self.inner.is_finished() {
            self.frame.extend_from_slice(b"0\r\n\r\n");
            self.done = true;
        }
    }
}

impl DataSource for ChunkedStream {
    fn read_block(&mut self, buf: &mut [u8]) -> usize {
        self.fill();
        let rest = &self.frame[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        n
    }

    fn seek(&mut self, len: usize) -> bool {
        let rest = self.frame.len() - self.pos;
        self.pos += len.min(rest);
        len <= rest
    }

    fn is_finished(&self) -> bool {
        self.done && self.pos >= self.frame.len()
    }

    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        if self.pos > 0 || self.done {
            return None;
        }
        Some(Box::new(ChunkedStream::new(self.inner.duplicate()?)))
    }
}

/// Encode `params` as `application/x-www-form-urlencoded`.
pub fn encode_form(params: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (name, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.extend(utf8_percent_encode(name, FORM));
        out.push('=');
        out.extend(utf8_percent_encode(value, FORM));
    }
    out
}

/// Decode one url-encoded component, treating `+` as a space.
pub fn decode_component(s: &str) -> String {
    let spaced = s.replace('+', " ");
    String::from(percent_decode_str(&spaced).decode_utf8_lossy())
}

/// Parse an `application/x-www-form-urlencoded` body or query string.
pub fn decode_form(s: &str) -> Vec<(String, String)> {
    s.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

/// Form parameters encoded as `application/x-www-form-urlencoded`.
pub struct UrlencodedStream(MemoryStream);

impl UrlencodedStream {
    /// Encode `params`.
    pub fn new(params: &[(String, String)]) -> Self {
        Self(MemoryStream::from(encode_form(params)))
    }
}

impl DataSource for UrlencodedStream {
    fn read_block(&mut self, buf: &mut [u8]) -> usize {
        self.0.read_block(buf)
    }

    fn seek(&mut self, len: usize) -> bool {
        self.0.seek(len)
    }

    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    fn available(&self) -> Option<usize> {
        self.0.available()
    }

    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        self.0.duplicate()
    }
}

/// A `multipart/form-data` body made of form fields and file attachments.
pub struct MultipartStream {
    boundary: String,
    chain: StreamChain,
}

/// Percent-encode the characters that would end a quoted `Content-Disposition` parameter or the
/// header line itself.
fn quoted_safe(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("%22"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            c => out.push(c),
        }
    }
    out
}

impl MultipartStream {
    /// Build the body. Each file is sent with its stream name as the file name.
    pub fn new(
        boundary: String,
        params: &[(String, String)],
        files: Vec<(String, Box<dyn DataSource>)>,
    ) -> Self {
        let mut chain = StreamChain::new();

        for (name, value) in params {
            let name = quoted_safe(name);
            let part = format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            );
            chain.push(Box::new(MemoryStream::from(part)));
        }

        for (field, file) in files {
            let filename = quoted_safe(file.name().unwrap_or(field.as_str()));
            let field = quoted_safe(&field);
            let part = format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            );
            chain.push(Box::new(MemoryStream::from(part)));
            chain.push(file);
            chain.push(Box::new(MemoryStream::from(CRLF)));
        }

        chain.push(Box::new(MemoryStream::from(format!("--{boundary}--\r\n"))));

        Self { boundary, chain }
    }

    /// A random boundary string.
    pub fn generate_boundary(rng: &mut dyn RngCore) -> String {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut raw = [0u8; 16];
        rng.fill_bytes(&mut raw);
        let mut boundary = String::from("----httpflow");
        boundary.extend(raw.iter().map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char));
        boundary
    }

    /// The part boundary.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

impl DataSource for MultipartStream {
    fn read_block(&mut self, buf: &mut [u8]) -> usize {
        self.chain.read_block(buf)
    }

    fn seek(&mut self, len: usize) -> bool {
        self.chain.seek(len)
    }

    fn is_finished(&self) -> bool {
        self.chain.is_finished()
    }

    fn available(&self) -> Option<usize> {
        self.chain.available()
    }

    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        self.chain.duplicate()
    }
}

/// XORs another stream with a repeating 4 byte key, as websocket masking requires.
pub struct XorStream {
    inner: Box<dyn DataSource>,
    mask: [u8; 4],
    offset: usize,
}

impl XorStream {
    /// Wrap `inner`.
    pub fn new(inner: Box<dyn DataSource>, mask: [u8; 4]) -> Self {
        Self {
            inner,
            mask,
            offset: 0,
        }
    }
}

impl DataSource for XorStream {
    fn read_block(&mut self, buf: &mut [u8]) -> usize {
        let n = self.inner.read_block(buf);
        apply_mask(&mut buf[..n], self.mask, self.offset);
        n
    }

    fn seek(&mut self, len: usize) -> bool {
        let ok = self.inner.seek(len);
        self.offset = (self.offset + len) % 4;
        ok
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    fn available(&self) -> Option<usize> {
        self.inner.available()
    }

    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        let mut copy = XorStream::new(self.inner.duplicate()?, self.mask);
        copy.offset = self.offset;
        Some(Box::new(copy))
    }
}

/// A FIFO of streams read one after the other.
#[derive(Default)]
pub struct StreamChain {
    items: VecDeque<Box<dyn DataSource>>,
}

impl StreamChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `stream` after the existing ones.
    pub fn push(&mut self, stream: Box<dyn DataSource>) {
        self.items.push_back(stream);
    }

    /// Number of streams not fully consumed yet.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn drop_finished(&mut self) {
        while self.items.front().is_some_and(|s| s.is_finished()) {
            self.items.pop_front();
        }
    }
}

impl DataSource for StreamChain {
    fn read_block(&mut self, buf: &mut [u8]) -> usize {
        self.drop_finished();
        match self.items.front_mut() {
            Some(front) => front.read_block(buf),
            None => 0,
        }
    }

    fn seek(&mut self, len: usize) -> bool {
        let ok = match self.items.front_mut() {
            Some(front) => front.seek(len),
            None => len == 0,
        };
        self.drop_finished();
        ok
    }

    fn is_finished(&self) -> bool {
        self.items.iter().all(|s| s.is_finished())
    }

    fn available(&self) -> Option<usize> {
        self.items.iter().map(|s| s.available()).sum()
    }

    fn duplicate(&self) -> Option<Box<dyn DataSource>> {
        let mut copy = StreamChain::new();
        for item in &self.items {
            copy.push(item.duplicate()?);
        }
        Some(Box::new(copy))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::string::ToString;
    use alloc::vec;

    use super::*;
    use crate::testing::{MemFs, TestRng};

    #[test]
    fn test_memory_peek_then_seek() {
        let mut s = MemoryStream::from("hello");
        let mut buf = [0u8; 3];

        assert_eq!(s.read_block(&mut buf), 3);
        assert_eq!(&buf, b"hel");
        // nothing consumed yet
        assert_eq!(s.read_block(&mut buf), 3);
        assert!(s.seek(2));
        assert_eq!(s.read_block(&mut buf), 3);
        assert_eq!(&buf, b"llo");
        assert_eq!(s.available(), Some(3));
        assert!(!s.seek(4));
        assert!(s.is_finished());
    }

    #[test]
    fn test_memory_limit() {
        let mut s = MemoryStream::with_limit(4);
        assert_eq!(s.write(b"abc"), 3);
        assert_eq!(s.write(b"def"), 1);
        assert_eq!(s.write(b"g"), 0);
        assert_eq!(s.into_vec(), b"abcd");
    }

    #[test]
    fn test_chunked_framing() {
        let mut s = ChunkedStream::new(Box::new(MemoryStream::from("hello")));
        assert!(!s.is_finished());
        assert_eq!(read_to_end(&mut s), b"5\r\nhello\r\n0\r\n\r\n");
        assert!(s.is_finished());

        let mut empty = ChunkedStream::new(Box::new(MemoryStream::new()));
        assert_eq!(read_to_end(&mut empty), b"0\r\n\r\n");
    }

    #[test]
    fn test_chunked_large() {
        let body = vec![7u8; CHUNK_SIZE + 10];
        let mut s = ChunkedStream::new(Box::new(MemoryStream::from(body)));
        let out = read_to_end(&mut s);
        assert!(out.starts_with(b"400\r\n"));
        assert!(out.ends_with(b"\r\nA\r\n\x07\x07\x07\x07\x07\x07\x07\x07\x07\x07\r\n0\r\n\r\n"));
        assert_eq!(out.len(), 5 + CHUNK_SIZE + 2 + 3 + 10 + 2 + 5);
    }

    #[test]
    fn test_form_encoding() {
        let params = vec![
            ("name".to_string(), "J. Doe".to_string()),
            ("q".to_string(), "a&b=c".to_string()),
        ];
        let encoded = encode_form(&params);
        assert_eq!(encoded, "name=J.%20Doe&q=a%26b%3Dc");
        assert_eq!(decode_form(&encoded), params);
        assert_eq!(decode_form("a=1+2&b&&c=%zz"), vec![
            ("a".to_string(), "1 2".to_string()),
            ("b".to_string(), String::new()),
            ("c".to_string(), "%zz".to_string()),
        ]);

        let mut s = UrlencodedStream::new(&params);
        assert_eq!(s.available(), Some(encoded.len()));
        assert_eq!(read_to_end(&mut s), encoded.as_bytes());
    }

    #[test]
    fn test_multipart_layout() {
        let params = vec![("field".to_string(), "value".to_string())];
        let files: Vec<(String, Box<dyn DataSource>)> =
            vec![("upload".to_string(), Box::new(MemoryStream::from("DATA")))];
        let mut s = MultipartStream::new("XYZ".to_string(), &params, files);
        assert_eq!(s.content_type(), "multipart/form-data; boundary=XYZ");

        let expected = "--XYZ\r\nContent-Disposition: form-data; name=\"field\"\r\n\r\nvalue\r\n\
            --XYZ\r\nContent-Disposition: form-data; name=\"upload\"; filename=\"upload\"\r\n\
            Content-Type: application/octet-stream\r\n\r\nDATA\r\n--XYZ--\r\n";
        assert_eq!(s.available(), Some(expected.len()));
        assert_eq!(read_to_end(&mut s), expected.as_bytes());
    }

    #[test]
    fn test_multipart_names_cannot_break_headers() {
        let params = vec![("a\"\r\nX-Evil: 1".to_string(), "v".to_string())];
        let files: Vec<(String, Box<dyn DataSource>)> =
            vec![("up\"load".to_string(), Box::new(MemoryStream::from("D")))];
        let mut s = MultipartStream::new("B".to_string(), &params, files);

        let expected = "--B\r\nContent-Disposition: form-data; name=\"a%22%0D%0AX-Evil: 1\"\r\n\r\nv\r\n\
            --B\r\nContent-Disposition: form-data; name=\"up%22load\"; filename=\"up%22load\"\r\n\
            Content-Type: application/octet-stream\r\n\r\nD\r\n--B--\r\n";
        assert_eq!(read_to_end(&mut s), expected.as_bytes());
    }

    #[test]
    fn test_boundary_is_random() {
        let mut rng = TestRng::new(1);
        let a = MultipartStream::generate_boundary(&mut rng);
        let b = MultipartStream::generate_boundary(&mut rng);
        assert!(a.starts_with("----httpflow"));
        assert_eq!(a.len(), 28);
        assert_ne!(a, b);
    }

    #[test]
    fn test_mask_round_trip() {
        let payload: Vec<u8> = (0..=255u8).collect();
        for key in [[0u8; 4], [1, 2, 3, 4], [0xff, 0x00, 0xa5, 0x5a]] {
            let mut masked = Box::new(XorStream::new(
                Box::new(MemoryStream::from(payload.clone())),
                key,
            ));
            let once = read_to_end(masked.as_mut());
            let mut unmasked = XorStream::new(Box::new(MemoryStream::from(once)), key);
            assert_eq!(read_to_end(&mut unmasked), payload);
        }
    }

    #[test]
    fn test_mask_offset_survives_partial_seek() {
        let key = [1, 2, 3, 4];
        let mut s = XorStream::new(Box::new(MemoryStream::from(&[0u8; 6][..])), key);
        let mut buf = [0u8; 6];
        assert_eq!(s.read_block(&mut buf), 6);
        s.seek(3);
        assert_eq!(s.read_block(&mut buf), 3);
        assert_eq!(&buf[..3], &[4, 1, 2]);
    }

    #[test]
    fn test_chain_order_and_length() {
        let mut chain = StreamChain::new();
        chain.push(Box::new(MemoryStream::from("head ")));
        chain.push(Box::new(MemoryStream::new()));
        chain.push(Box::new(MemoryStream::from("body")));
        assert_eq!(chain.available(), Some(9));

        chain.push(Box::new(ChunkedStream::new(Box::new(MemoryStream::new()))));
        assert_eq!(chain.available(), None);
        assert_eq!(read_to_end(&mut chain), b"head body0\r\n\r\n");
        assert!(chain.is_finished());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_file_stream() {
        let fs = Rc::new(MemFs::new());
        fs.insert("/www/index.html", b"<html></html>", 7);
        let fs_dyn: Rc<dyn FileSystem> = fs.clone();

        let mut file = FileStream::open(fs_dyn.clone(), "/www/index.html").unwrap();
        assert_eq!(file.available(), Some(13));
        assert_eq!(file.name(), Some("index.html"));
        assert_eq!(file.id(), Some("d-7".to_string()));

        let dup = file.duplicate();
        assert_eq!(read_to_end(&mut file), b"<html></html>");
        assert_eq!(read_to_end(dup.unwrap().as_mut()), b"<html></html>");
        drop(file);
        assert_eq!(fs.open_handles(), 0);

        assert_eq!(
            FileStream::open(fs_dyn, "/missing").err(),
            Some(FsError::NotFound)
        );
    }
}
