//! The transport primitive: one non-blocking TCP socket with backpressure aware writes, idle
//! timeout accounting, an optional TLS session and a close lifecycle.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

use crate::config::ConnectionConfig;
use crate::stream::DataSource;
use crate::transport::{Handshake, Socket, TlsSession, TransportError};

/// Errors returned when writing to a connection.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteError {
    /// The send window is full, retry once the socket reports sent data
    NoSpace,
    /// The connection is closing or closed
    Closed,
    /// Socket or TLS failure
    Transport(TransportError),
}

impl From<TransportError> for WriteError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl Display for WriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoSpace => f.write_str("send window full"),
            Self::Closed => f.write_str("connection closed"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl core::error::Error for WriteError {}

/// Where a connection is in its teardown.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Lifecycle {
    /// Usable
    Open,
    /// Close requested, waiting for the socket to confirm. Events are ignored.
    Closing,
    /// Socket gone
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TlsState {
    Off,
    Handshaking,
    Established,
}

/// Result of handing received bytes to the connection.
pub(crate) enum Inbound {
    /// Bytes are application data as they are
    Plain,
    /// Decrypted application data
    Decrypted(Vec<u8>),
    /// Consumed by the TLS handshake
    Handshaking,
    /// The TLS handshake has just completed
    Established,
}

/// A raw connection over a platform [`Socket`].
pub struct TcpConnection<S: Socket> {
    socket: S,
    config: ConnectionConfig,
    timeout: u16,
    sleep: u16,
    can_send: bool,
    lifecycle: Lifecycle,
    tls: Option<Box<dyn TlsSession>>,
    tls_state: TlsState,
    host: String,
    raw_out: Vec<u8>,
    scratch: Vec<u8>,
    wire_bytes: usize,
}

impl<S: Socket> TcpConnection<S> {
    /// Wrap a socket.
    pub fn new(socket: S, config: ConnectionConfig) -> Self {
        Self {
            socket,
            timeout: config.timeout,
            config,
            sleep: 0,
            can_send: false,
            lifecycle: Lifecycle::Open,
            tls: None,
            tls_state: TlsState::Off,
            host: String::new(),
            raw_out: Vec::new(),
            scratch: Vec::new(),
            wire_bytes: 0,
        }
    }

    /// The underlying socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// The underlying socket, mutably.
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Transport configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Install the TLS session used by the next `connect(.., true)` or [`start_tls`](Self::start_tls).
    pub fn set_tls_session(&mut self, session: Box<dyn TlsSession>) {
        self.tls = Some(session);
    }

    /// `true` once TLS is established.
    pub fn is_secure(&self) -> bool {
        self.tls_state == TlsState::Established
    }

    /// Fingerprint of the peer certificate, when running TLS.
    pub fn peer_fingerprint(&self) -> Option<[u8; 20]> {
        self.tls.as_ref().and_then(|t| t.peer_fingerprint())
    }

    /// Current lifecycle stage.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// `true` until a close has been requested.
    pub fn is_open(&self) -> bool {
        self.lifecycle == Lifecycle::Open
    }

    /// Idle timeout in poll ticks.
    pub fn timeout(&self) -> u16 {
        self.timeout
    }

    /// Change the idle timeout. `0` disables it.
    pub fn set_timeout(&mut self, ticks: u16) {
        self.timeout = ticks;
    }

    /// Poll ticks since the last activity.
    pub fn idle_ticks(&self) -> u16 {
        self.sleep
    }

    /// Bytes handed to the socket since the last `connect`, TLS records included.
    pub fn bytes_written(&self) -> usize {
        self.wire_bytes
    }

    /// Resolve `host` and connect to it.
    pub fn connect(&mut self, host: &str, port: u16, use_tls: bool) -> Result<(), TransportError> {
        if use_tls && self.tls.is_none() {
            warn!("tls requested without a session");
            return Err(TransportError::TlsUnavailable);
        }

        debug!("connecting to {}:{}", host, port);
        self.open(host, use_tls);
        self.socket.connect(host, port)
    }

    /// Take over a socket that is already connected, such as one accepted by a listener.
    pub fn attach(&mut self) {
        debug!("attaching connected socket");
        self.open("", false);
    }

    fn open(&mut self, host: &str, use_tls: bool) {
        self.host.clear();
        self.host.push_str(host);
        self.tls_state = if use_tls {
            TlsState::Handshaking
        } else {
            TlsState::Off
        };
        self.lifecycle = Lifecycle::Open;
        self.can_send = false;
        self.sleep = 0;
        self.raw_out.clear();
        self.wire_bytes = 0;
    }

    /// Switch an accepted connection to TLS. The handshake starts on the first received bytes.
    pub fn start_tls(&mut self) -> Result<(), TransportError> {
        if self.tls.is_none() {
            return Err(TransportError::TlsUnavailable);
        }
        self.tls_state = TlsState::Handshaking;
        Ok(())
    }

    /// Socket connected. Returns `true` if the connection is ready for application data, `false`
    /// while a TLS handshake is still running.
    pub(crate) fn on_connected(&mut self) -> Result<bool, TransportError> {
        self.can_send = true;
        self.sleep = 0;

        if self.tls_state != TlsState::Handshaking {
            return Ok(true);
        }

        let Some(tls) = self.tls.as_mut() else {
            return Err(TransportError::TlsUnavailable);
        };
        let mut out = Vec::new();
        let status = tls.handshake(&self.host, &[], &mut out)?;
        self.raw_out.extend_from_slice(&out);
        self.flush_raw()?;

        if status == Handshake::Complete {
            self.tls_state = TlsState::Established;
            return Ok(true);
        }
        Ok(false)
    }

    /// Account for received bytes and run them through TLS if required.
    pub(crate) fn receive(&mut self, data: &[u8]) -> Result<Inbound, TransportError> {
        self.sleep = 0;

        match self.tls_state {
            TlsState::Off => Ok(Inbound::Plain),
            TlsState::Handshaking => {
                let Some(tls) = self.tls.as_mut() else {
                    return Err(TransportError::TlsUnavailable);
                };
                let mut out = Vec::new();
                let status = tls
                    .handshake(&self.host, data, &mut out)
                    .map_err(|_| TransportError::TlsHandshakeFailed)?;
                self.raw_out.extend_from_slice(&out);
                self.flush_raw()?;

                if status == Handshake::Complete {
                    debug!("tls established");
                    self.tls_state = TlsState::Established;
                    return Ok(Inbound::Established);
                }
                Ok(Inbound::Handshaking)
            }
            TlsState::Established => {
                let Some(tls) = self.tls.as_mut() else {
                    return Err(TransportError::TlsUnavailable);
                };
                let mut plain = Vec::new();
                tls.decrypt(data, &mut plain)?;
                Ok(Inbound::Decrypted(plain))
            }
        }
    }

    /// `true` when a write would currently be accepted.
    pub fn can_send(&self) -> bool {
        self.send_window() > 0
    }

    /// Number of plaintext bytes a write would currently accept.
    pub fn send_window(&self) -> usize {
        if !self.can_send || self.lifecycle != Lifecycle::Open || !self.raw_out.is_empty() {
            return 0;
        }

        let window = self.socket.send_window();
        match (self.tls_state, self.tls.as_ref()) {
            (TlsState::Off, _) => window,
            (TlsState::Established, Some(tls)) => {
                let mut n = window;
                while n > 0 && tls.encrypted_len(n) > window {
                    n -= (tls.encrypted_len(n) - window).min(n);
                }
                n
            }
            _ => 0,
        }
    }

    /// Write as much of `data` as the send window allows, returning the number of bytes
    /// accepted. Fails with [`WriteError::NoSpace`] if nothing could be accepted; the caller keeps
    /// the remainder and retries on a later event.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.lifecycle != Lifecycle::Open {
            return Err(WriteError::Closed);
        }
        self.flush_raw()?;

        let window = self.send_window();
        if window == 0 {
            return Err(WriteError::NoSpace);
        }

        let len = data.len().min(window);
        let written = match self.tls.as_mut() {
            Some(tls) if self.tls_state == TlsState::Established => {
                tls.encrypt(&data[..len], &mut self.raw_out)?;
                self.flush_raw()?;
                len
            }
            _ => {
                let n = self.socket.write(&data[..len])?;
                self.wire_bytes += n;
                n
            }
        };

        self.sleep = 0;
        Ok(written)
    }

    /// Pull bytes from `stream` into the socket until the window is exhausted, the stream has
    /// nothing more to offer, or the push count is reached. Returns the number of bytes written.
    pub fn write_stream(&mut self, stream: &mut dyn DataSource) -> Result<usize, WriteError> {
        if self.lifecycle != Lifecycle::Open {
            return Err(WriteError::Closed);
        }

        let mut scratch = core::mem::take(&mut self.scratch);
        scratch.resize(self.config.send_buffer_size, 0);

        let mut total = 0;
        let mut result = Ok(());
        for _ in 0..self.config.max_push_count {
            let window = self.send_window();
            if window == 0 {
                break;
            }

            let want = window.min(scratch.len());
            let n = stream.read_block(&mut scratch[..want]);
            if n == 0 {
                break;
            }

            let written = match self.write(&scratch[..n]) {
                Ok(w) => w,
                Err(WriteError::NoSpace) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            stream.seek(written);
            total += written;
            if written < n {
                break;
            }
        }

        self.scratch = scratch;
        result?;
        if total > 0 {
            self.flush()?;
        }
        trace!("pushed {} stream bytes", total);
        Ok(total)
    }

    /// Ask the socket to put buffered data on the wire.
    pub fn flush(&mut self) -> Result<(), WriteError> {
        if self.lifecycle != Lifecycle::Open {
            return Err(WriteError::Closed);
        }
        self.flush_raw()?;
        self.socket.flush()?;
        Ok(())
    }

    fn flush_raw(&mut self) -> Result<(), TransportError> {
        if self.raw_out.is_empty() {
            return Ok(());
        }
        let n = self.socket.write(&self.raw_out)?;
        self.raw_out.drain(..n);
        self.wire_bytes += n;
        Ok(())
    }

    /// Acknowledged bytes free space in the window.
    pub(crate) fn on_sent(&mut self) -> Result<(), TransportError> {
        self.sleep = 0;
        if self.lifecycle == Lifecycle::Open {
            self.flush_raw()?;
        }
        Ok(())
    }

    /// Count one poll tick. Returns `true` once the idle timeout has been exceeded.
    pub(crate) fn on_poll(&mut self) -> bool {
        self.sleep = self.sleep.saturating_add(1);
        self.timeout > 0 && self.sleep > self.timeout
    }

    /// Request the socket to close. Does nothing unless the connection is open.
    pub fn close(&mut self) {
        if self.lifecycle != Lifecycle::Open {
            return;
        }
        debug!("closing connection");
        self.lifecycle = Lifecycle::Closing;
        self.can_send = false;
        self.raw_out.clear();
        self.socket.close();
    }

    /// The socket confirmed it is gone, either after `close` or because of a fatal error.
    pub(crate) fn on_closed(&mut self) {
        self.lifecycle = Lifecycle::Closed;
        self.can_send = false;
        self.raw_out.clear();
    }
}
