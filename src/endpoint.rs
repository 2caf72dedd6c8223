//! Event dispatch from the platform socket layer into a [`Protocol`].
//!
//! The platform owns every [`Endpoint`] and feeds it socket events. Each event handler returns a
//! [`Liveness`]; once it reports [`Liveness::Release`] the socket is gone and no further events
//! can arrive, so the owner drops the endpoint. Events arriving while a close is in progress are
//! ignored.

use crate::client::{ClientError, ClientState, ConnectionEvent, TcpClient, Transmit};
use crate::config::ConnectionConfig;
use crate::connection::{Inbound, Lifecycle};
use crate::server::HandlerError;
use crate::transport::{Socket, TransportError};

/// An application protocol running over a connection.
pub trait Protocol {
    /// The connection is ready for application data.
    fn on_connected(&mut self, tx: &mut dyn Transmit) -> Result<(), HandlerError> {
        let _ = tx;
        Ok(())
    }

    /// Application data arrived. An error closes the connection.
    fn on_receive(&mut self, tx: &mut dyn Transmit, data: &[u8]) -> Result<(), HandlerError>;

    /// The connection can take more data.
    fn on_ready_to_send(&mut self, tx: &mut dyn Transmit, event: ConnectionEvent) {
        let _ = (tx, event);
    }

    /// A transport error ended the connection.
    fn on_error(&mut self, err: TransportError) {
        let _ = err;
    }

    /// The connection attempt completed.
    fn on_finished(&mut self, state: ClientState) {
        let _ = state;
    }
}

/// Whether the owner should keep an endpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Liveness {
    /// Keep it
    Alive,
    /// The socket has closed, drop it
    Release,
}

/// A [`TcpClient`] driving a [`Protocol`].
pub struct Endpoint<S: Socket, P: Protocol> {
    client: TcpClient<S>,
    protocol: P,
}

impl<S: Socket, P: Protocol> Endpoint<S, P> {
    /// New endpoint for `socket`.
    pub fn new(socket: S, config: ConnectionConfig, protocol: P) -> Self {
        Self {
            client: TcpClient::new(socket, config),
            protocol,
        }
    }

    /// The client.
    pub fn client(&self) -> &TcpClient<S> {
        &self.client
    }

    /// The client, mutably.
    pub fn client_mut(&mut self) -> &mut TcpClient<S> {
        &mut self.client
    }

    /// The socket.
    pub fn socket_mut(&mut self) -> &mut S {
        self.client.connection_mut().socket_mut()
    }

    /// The protocol.
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// The protocol, mutably.
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Start an outbound connection.
    pub fn connect(&mut self, host: &str, port: u16, use_tls: bool) -> Result<(), ClientError> {
        let res = self.client.connect(host, port, use_tls);
        self.settle();
        res
    }

    /// Run the protocol on a socket that is already connected, such as an accepted one.
    pub fn attach(&mut self) -> Result<(), ClientError> {
        self.client.attach()?;
        self.on_connected(Ok(()));
        Ok(())
    }

    /// The socket connected, or failed to.
    pub fn on_connected(&mut self, result: Result<(), TransportError>) -> Liveness {
        if !self.client.connection().is_open() {
            return self.liveness();
        }

        match result.and_then(|_| self.client.handle_connected()) {
            Ok(true) => self.activate(),
            Ok(false) => trace!("waiting for tls handshake"),
            Err(e) => self.fail(e),
        }
        self.settle()
    }

    /// Data arrived, or `None` if the peer closed its side.
    pub fn on_receive(&mut self, data: Option<&[u8]>) -> Liveness {
        if !self.client.connection().is_open() {
            return self.liveness();
        }

        let Some(data) = data else {
            debug!("peer closed connection");
            self.client.close();
            return self.settle();
        };

        match self.client.handle_received(data) {
            Ok(Inbound::Plain) => self.deliver(data),
            Ok(Inbound::Decrypted(plain)) => {
                if !plain.is_empty() {
                    self.deliver(&plain);
                }
            }
            Ok(Inbound::Handshaking) => {}
            Ok(Inbound::Established) => self.activate(),
            Err(e) => self.fail(e),
        }
        self.settle()
    }

    /// The socket acknowledged `len` bytes.
    pub fn on_sent(&mut self, len: usize) -> Liveness {
        if !self.client.connection().is_open() {
            return self.liveness();
        }

        match self.client.handle_sent(len) {
            Ok(()) => self.ready_to_send(ConnectionEvent::Sent),
            Err(e) => self.fail(e),
        }
        self.settle()
    }

    /// Periodic tick.
    pub fn on_poll(&mut self) -> Liveness {
        if !self.client.connection().is_open() {
            return self.liveness();
        }

        if self.client.handle_poll() {
            warn!("idle timeout");
            self.protocol.on_error(TransportError::Timeout);
            self.client.close();
        } else {
            self.ready_to_send(ConnectionEvent::Poll);
        }
        self.settle()
    }

    /// The socket failed. The socket is gone once this returns.
    pub fn on_error(&mut self, err: TransportError) -> Liveness {
        if self.client.connection().lifecycle() == Lifecycle::Closed {
            return self.liveness();
        }
        self.fail(err);
        self.settle()
    }

    /// The socket finished closing.
    pub fn on_closed(&mut self) -> Liveness {
        self.client.handle_closed();
        self.settle()
    }

    /// Let the protocol send anything queued since the last event.
    pub fn resume(&mut self) -> Liveness {
        if self.client.connection().is_open() {
            self.ready_to_send(ConnectionEvent::Resumed);
        }
        self.settle()
    }

    /// Close the connection.
    pub fn close(&mut self) -> Liveness {
        self.client.close();
        self.settle()
    }

    /// [`Liveness::Release`] once the socket is closed and the endpoint destroys itself.
    pub fn liveness(&self) -> Liveness {
        let conn = self.client.connection();
        if conn.lifecycle() == Lifecycle::Closed && conn.config().auto_self_destruct {
            Liveness::Release
        } else {
            Liveness::Alive
        }
    }

    fn activate(&mut self) {
        info!("connection established");
        match self.protocol.on_connected(&mut self.client) {
            Ok(()) => self.ready_to_send(ConnectionEvent::Connected),
            Err(e) => self.abort(e),
        }
    }

    fn deliver(&mut self, data: &[u8]) {
        match self.protocol.on_receive(&mut self.client, data) {
            Ok(()) => self.ready_to_send(ConnectionEvent::Received),
            Err(e) => self.abort(e),
        }
    }

    fn ready_to_send(&mut self, event: ConnectionEvent) {
        if self.client.state() != ClientState::Connected || !self.client.connection().is_open() {
            return;
        }

        self.protocol.on_ready_to_send(&mut self.client, event);
        if let Err(e) = self.client.push() {
            warn!("send failed: {:?}", e);
            self.client.close();
        }
    }

    fn abort(&mut self, e: HandlerError) {
        warn!("protocol error: {:?}", e);
        self.client.close();
    }

    fn fail(&mut self, e: TransportError) {
        warn!("transport error: {:?}", e);
        self.protocol.on_error(e);
        self.client.handle_error();
    }

    fn settle(&mut self) -> Liveness {
        if let Some(state) = self.client.take_finished() {
            self.protocol.on_finished(state);
        }
        self.liveness()
    }
}
