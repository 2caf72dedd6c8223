//! The collaborators a connection is built on: the platform socket, an optional TLS session, a
//! wall clock and a filesystem.
//!
//! Implementations are supplied by the platform glue. None of the trait methods may block, with
//! the exception of [`FileSystem`] whose operations are expected to be fast local flash accesses.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

/// Errors raised by the socket layer, DNS resolution or a TLS session. All of them are terminal
/// for the connection they occur on.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Host name could not be resolved
    DnsFailed,
    /// Peer refused the connection
    ConnectionRefused,
    /// Connection reset or aborted by the peer
    ConnectionReset,
    /// The stack could not allocate resources for the operation
    OutOfResources,
    /// Operation requires a connected socket
    NotConnected,
    /// TLS requested without a session to run it
    TlsUnavailable,
    /// TLS handshake did not complete
    TlsHandshakeFailed,
    /// Peer certificate rejected by a validator
    TlsValidationFailed,
    /// No activity within the configured idle timeout
    Timeout,
    /// Any other platform error, with its raw code
    Other(i32),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DnsFailed => f.write_str("dns resolution failed"),
            Self::ConnectionRefused => f.write_str("connection refused"),
            Self::ConnectionReset => f.write_str("connection reset"),
            Self::OutOfResources => f.write_str("out of resources"),
            Self::NotConnected => f.write_str("not connected"),
            Self::TlsUnavailable => f.write_str("tls session unavailable"),
            Self::TlsHandshakeFailed => f.write_str("tls handshake failed"),
            Self::TlsValidationFailed => f.write_str("tls certificate validation failed"),
            Self::Timeout => f.write_str("idle timeout"),
            Self::Other(code) => write!(f, "transport error {code}"),
        }
    }
}

impl core::error::Error for TransportError {}

/// A non-blocking TCP socket.
///
/// Results of asynchronous operations (connect, close, acknowledgements, arriving data) are fed
/// back into the owning [`Endpoint`](crate::endpoint::Endpoint) by the platform.
pub trait Socket {
    /// Begin resolving `host` and connecting to it. Returns an error only if the request could not
    /// even be queued; the outcome is reported later through `Endpoint::on_connected`.
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Number of bytes the socket will currently accept.
    fn send_window(&self) -> usize;

    /// Copy up to `data.len()` bytes into the send buffer returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Push buffered data onto the wire.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Request the socket to close. Completion is reported through `Endpoint::on_closed`.
    fn close(&mut self);
}

/// Progress of a TLS handshake.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Handshake {
    /// More bytes must be exchanged
    InProgress,
    /// Session established
    Complete,
}

/// An opaque TLS session.
///
/// The connection hands every received ciphertext byte to the session and sends whatever the
/// session writes into `output`.
pub trait TlsSession {
    /// Feed `input` (empty on the first call) into the handshake, appending bytes to send.
    fn handshake(
        &mut self,
        host: &str,
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<Handshake, TransportError>;

    /// Decrypt `input` appending any complete plaintext to `output`.
    fn decrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), TransportError>;

    /// Encrypt `input` appending the records to `output`.
    fn encrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), TransportError>;

    /// Size on the wire of `plain_len` bytes of plaintext.
    fn encrypted_len(&self, plain_len: usize) -> usize;

    /// SHA1 fingerprint of the peer certificate, once known.
    fn peer_fingerprint(&self) -> Option<[u8; 20]> {
        None
    }
}

/// Wall clock used for `Date` headers.
pub trait Clock {
    /// Current time formatted as an RFC 7231 IMF-fixdate, if the clock has been set.
    fn http_date(&self) -> Option<String>;
}

/// Filesystem errors.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FsError {
    /// No such file
    NotFound,
    /// Device or operation failure
    Io,
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => f.write_str("file not found"),
            Self::Io => f.write_str("filesystem i/o error"),
        }
    }
}

impl core::error::Error for FsError {}

/// Identifies an open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(pub u32);

/// File metadata.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileStat {
    /// Size in bytes
    pub size: usize,
    /// Modification counter or timestamp. Only used to derive entity tags.
    pub modified: u32,
}

/// Byte stream file access. Operations are synchronous.
pub trait FileSystem {
    /// Open `path` for reading, or for writing when `create` is set.
    fn open(&self, path: &str, create: bool) -> Result<FileHandle, FsError>;
    /// Read at the current position.
    fn read(&self, file: FileHandle, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Append at the current position.
    fn write(&self, file: FileHandle, data: &[u8]) -> Result<usize, FsError>;
    /// Move the position to `offset` from the start of the file.
    fn seek(&self, file: FileHandle, offset: usize) -> Result<(), FsError>;
    /// File metadata.
    fn stat(&self, file: FileHandle) -> Result<FileStat, FsError>;
    /// Release the handle.
    fn close(&self, file: FileHandle);
}
