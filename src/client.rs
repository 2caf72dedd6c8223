//! A connection with a single in-flight outbound stream and completion tracking.
//!
//! Whether a connection attempt was successful is decided when it closes: the attempt succeeded
//! if the socket acknowledged every byte that was handed to it. The completion callback fires
//! exactly once per attempt.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

use crate::config::ConnectionConfig;
use crate::connection::{Inbound, TcpConnection, WriteError};
use crate::stream::{DataSource, MemoryStream, StreamChain};
use crate::transport::{Socket, TransportError};

/// Client errors.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientError {
    /// No connection to send on
    NotConnected,
    /// A connection attempt is already running
    Busy,
    /// Request queue at capacity
    QueueFull,
    /// Request URL could not be used
    InvalidUri,
    /// Writing to the connection failed
    Write(WriteError),
    /// Connecting failed
    Transport(TransportError),
}

impl From<WriteError> for ClientError {
    fn from(value: WriteError) -> Self {
        Self::Write(value)
    }
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotConnected => f.write_str("not connected"),
            Self::Busy => f.write_str("connection attempt in progress"),
            Self::QueueFull => f.write_str("request queue full"),
            Self::InvalidUri => f.write_str("invalid uri"),
            Self::Write(e) => write!(f, "write failed: {e}"),
            Self::Transport(e) => write!(f, "connect failed: {e}"),
        }
    }
}

impl core::error::Error for ClientError {}

/// Progress of a connection attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientState {
    /// Never connected
    Ready,
    /// Waiting for DNS and the TCP handshake
    Connecting,
    /// Connected
    Connected,
    /// Closed after every queued byte was acknowledged
    Successful,
    /// Closed with unsent data, or failed
    Failed,
}

impl ClientState {
    /// `true` for the two final states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

/// Why [`Transmit`] users are being asked for more data.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionEvent {
    /// The connection has just become usable
    Connected,
    /// Data was received
    Received,
    /// The socket acknowledged data
    Sent,
    /// Periodic tick
    Poll,
    /// The application asked for queued work to be processed
    Resumed,
}

/// What a protocol can do with the connection it runs on.
pub trait Transmit {
    /// Queue `stream` behind anything already in flight. With `force_close` the connection
    /// closes once everything has been sent and acknowledged.
    fn send(&mut self, stream: Box<dyn DataSource>, force_close: bool) -> Result<(), ClientError>;

    /// Queue a copy of `data`.
    fn send_bytes(&mut self, data: &[u8], force_close: bool) -> Result<(), ClientError> {
        self.send(Box::new(MemoryStream::from(data)), force_close)
    }

    /// Move as much queued data into the socket as the window allows.
    fn push(&mut self) -> Result<(), ClientError>;

    /// `true` while queued data remains.
    fn is_processing(&self) -> bool;

    /// `true` if the socket would accept data right now.
    fn can_send(&self) -> bool;

    /// Close the connection.
    fn close(&mut self);

    /// Change the idle timeout.
    fn set_timeout(&mut self, ticks: u16);

    /// Attempt state.
    fn state(&self) -> ClientState;
}

/// Check run on the peer certificate fingerprint once TLS is up.
pub type CertificateValidator = Box<dyn Fn(&[u8; 20]) -> bool>;

/// Invoked with the final state of a connection attempt.
pub type CompletionCallback = Box<dyn FnMut(ClientState)>;

/// A [`TcpConnection`] with an outbound stream and completion state.
pub struct TcpClient<S: Socket> {
    conn: TcpConnection<S>,
    state: ClientState,
    stream: Option<StreamChain>,
    confirmed: usize,
    close_after_sent: bool,
    finished: Option<ClientState>,
    on_completed: Option<CompletionCallback>,
    validators: Vec<CertificateValidator>,
}

impl<S: Socket> TcpClient<S> {
    /// New client over `socket`.
    pub fn new(socket: S, config: ConnectionConfig) -> Self {
        Self {
            conn: TcpConnection::new(socket, config),
            state: ClientState::Ready,
            stream: None,
            confirmed: 0,
            close_after_sent: false,
            finished: None,
            on_completed: None,
            validators: Vec::new(),
        }
    }

    /// The raw connection.
    pub fn connection(&self) -> &TcpConnection<S> {
        &self.conn
    }

    /// The raw connection, mutably.
    pub fn connection_mut(&mut self) -> &mut TcpConnection<S> {
        &mut self.conn
    }

    /// Attempt state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Bytes the socket has acknowledged in this attempt.
    pub fn bytes_confirmed(&self) -> usize {
        self.confirmed
    }

    /// Set the callback invoked once the attempt completes.
    pub fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.on_completed = Some(callback);
    }

    /// Only accept a TLS peer presenting a certificate with this SHA1 fingerprint.
    pub fn pin_certificate(&mut self, fingerprint: [u8; 20]) {
        self.add_validator(Box::new(move |fp| *fp == fingerprint));
    }

    /// Add a certificate validator. The peer is accepted if any validator accepts it.
    pub fn add_validator(&mut self, validator: CertificateValidator) {
        self.validators.push(validator);
    }

    /// Start a connection attempt.
    pub fn connect(&mut self, host: &str, port: u16, use_tls: bool) -> Result<(), ClientError> {
        self.begin()?;
        if let Err(e) = self.conn.connect(host, port, use_tls) {
            error!("connect to {} failed: {:?}", host, e);
            self.conn.on_closed();
            self.finish(ClientState::Failed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Start an attempt on a socket that is already connected. The socket is not asked to
    /// connect again.
    pub fn attach(&mut self) -> Result<(), ClientError> {
        self.begin()?;
        self.conn.attach();
        Ok(())
    }

    fn begin(&mut self) -> Result<(), ClientError> {
        if matches!(self.state, ClientState::Connecting | ClientState::Connected)
            && self.conn.is_open()
        {
            return Err(ClientError::Busy);
        }

        self.state = ClientState::Connecting;
        self.stream = None;
        self.confirmed = 0;
        self.close_after_sent = false;
        self.finished = None;
        Ok(())
    }

    /// Returns `true` when application data may flow.
    pub(crate) fn handle_connected(&mut self) -> Result<bool, TransportError> {
        self.state = ClientState::Connected;
        let ready = self.conn.on_connected()?;
        if ready && self.conn.is_secure() {
            self.validate()?;
        }
        Ok(ready)
    }

    pub(crate) fn handle_received(&mut self, data: &[u8]) -> Result<Inbound, TransportError> {
        let inbound = self.conn.receive(data)?;
        if let Inbound::Established = inbound {
            self.validate()?;
        }
        Ok(inbound)
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.validators.is_empty() {
            return Ok(());
        }
        match self.conn.peer_fingerprint() {
            Some(fp) if self.validators.iter().any(|v| v(&fp)) => Ok(()),
            _ => {
                warn!("peer certificate rejected");
                Err(TransportError::TlsValidationFailed)
            }
        }
    }

    pub(crate) fn handle_sent(&mut self, len: usize) -> Result<(), TransportError> {
        self.confirmed += len;
        self.conn.on_sent()?;
        self.close_if_drained();
        Ok(())
    }

    /// Returns `true` if the idle timeout expired.
    pub(crate) fn handle_poll(&mut self) -> bool {
        self.conn.on_poll()
    }

    pub(crate) fn handle_error(&mut self) {
        self.conn.on_closed();
        self.stream = None;
        self.finish(ClientState::Failed);
    }

    pub(crate) fn handle_closed(&mut self) {
        self.conn.on_closed();
        self.stream = None;
        let state = self.outcome();
        self.finish(state);
    }

    /// Takes the final state once, after the attempt completed.
    pub(crate) fn take_finished(&mut self) -> Option<ClientState> {
        self.finished.take()
    }

    fn outcome(&self) -> ClientState {
        if self.state == ClientState::Connected && self.all_confirmed() {
            ClientState::Successful
        } else {
            ClientState::Failed
        }
    }

    fn all_confirmed(&self) -> bool {
        self.confirmed >= self.conn.bytes_written()
    }

    fn close_if_drained(&mut self) {
        if self.close_after_sent && self.stream.is_none() && self.all_confirmed() {
            debug!("all data sent, closing");
            TcpClient::close(self);
        }
    }

    fn finish(&mut self, state: ClientState) {
        if self.state.is_terminal() {
            return;
        }
        debug!("connection finished: {:?}", state);
        self.state = state;
        self.finished = Some(state);
        if let Some(cb) = self.on_completed.as_mut() {
            cb(state);
        }
    }

    /// Close the connection, deciding the attempt's final state.
    pub fn close(&mut self) {
        if !self.conn.is_open() {
            return;
        }
        let state = self.outcome();
        self.stream = None;
        self.conn.close();
        if matches!(self.state, ClientState::Connecting | ClientState::Connected) {
            self.finish(state);
        }
    }
}

impl<S: Socket> Transmit for TcpClient<S> {
    fn send(&mut self, stream: Box<dyn DataSource>, force_close: bool) -> Result<(), ClientError> {
        if !self.conn.is_open()
            || !matches!(self.state, ClientState::Connecting | ClientState::Connected)
        {
            return Err(ClientError::NotConnected);
        }

        self.stream.get_or_insert_with(StreamChain::new).push(stream);
        self.close_after_sent |= force_close;
        Ok(())
    }

    fn push(&mut self) -> Result<(), ClientError> {
        if self.state != ClientState::Connected || !self.conn.is_open() {
            return Ok(());
        }

        if let Some(stream) = self.stream.as_mut() {
            match self.conn.write_stream(stream) {
                Ok(_) | Err(WriteError::NoSpace) => {}
                Err(e) => return Err(e.into()),
            }
            if stream.is_finished() {
                trace!("stream sent");
                self.stream = None;
            }
        }

        self.close_if_drained();
        Ok(())
    }

    fn is_processing(&self) -> bool {
        self.stream.is_some()
    }

    fn can_send(&self) -> bool {
        self.conn.can_send()
    }

    fn close(&mut self) {
        TcpClient::close(self);
    }

    fn set_timeout(&mut self, ticks: u16) {
        self.conn.set_timeout(ticks);
    }

    fn state(&self) -> ClientState {
        self.state
    }
}
