//! # httpflow
//!
//! `httpflow` is an event-driven HTTP/1.1 client, server and websocket core aimed at `no_std`
//! targets with an allocator, such as embedded devices with a callback based TCP stack.
//!
//! This crate provides:
//!
//! * a connection layer that streams outgoing data into a socket as fast as the socket's send
//!   window allows, with optional TLS.
//! * an HTTP client that pipelines requests over one connection and retries them when it drops.
//! * an HTTP server that routes requests to resources, with conditional requests and body parsers.
//! * websockets on both sides of an upgraded connection.
//!
//! This crate does **not** provide:
//!
//! * a TCP/IP stack or a TLS implementation. Both are supplied through the traits in
//!   [`transport`].
//! * HTTP/2 or extensions such as websocket compression.
//!
//! ## Basic Use
//!
//! Everything runs as a reaction to socket events. The platform owns an [`endpoint::Endpoint`]
//! per socket, built from something implementing [`transport::Socket`] and a protocol such as
//! [`server::HttpServerConnection`], [`http_client::HttpClientConnection`] or
//! [`websocket::WebsocketClient`], and calls `on_connected`, `on_receive`, `on_sent`, `on_poll`
//! and `on_closed` as the socket reports them. Each call does a bounded amount of work.
//!
//! With a socket that implements `embedded_io_async::{Read, Write}`, [`io::serve`] generates
//! those events instead.
//!
//! ## Example
//!
//! ```
//! use std::rc::Rc;
//!
//! use httpflow::config::{ConnectionConfig, HttpServerConfig};
//! use httpflow::endpoint::Endpoint;
//! use httpflow::server::{FnResource, HttpServer};
//! # use httpflow::transport::{Socket, TransportError};
//! #
//! # #[derive(Default)]
//! # struct TcpSocket {
//! #     sent: Vec<u8>,
//! # }
//! #
//! # impl Socket for TcpSocket {
//! #     fn connect(&mut self, _host: &str, _port: u16) -> Result<(), TransportError> {
//! #         Ok(())
//! #     }
//! #
//! #     fn send_window(&self) -> usize {
//! #         1024
//! #     }
//! #
//! #     fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
//! #         self.sent.extend_from_slice(data);
//! #         Ok(data.len())
//! #     }
//! #
//! #     fn close(&mut self) {}
//! # }
//!
//! let server = HttpServer::new(HttpServerConfig::default());
//! server.add_resource(
//!     "/",
//!     Rc::new(FnResource::new(|_req, resp| {
//!         resp.send_string("<html>...</html>");
//!         Ok(())
//!     })),
//! );
//!
//! // TcpSocket implements httpflow::transport::Socket (not shown)
//! let mut endpoint = Endpoint::new(
//!     TcpSocket::default(),
//!     ConnectionConfig::server(),
//!     server.connection(),
//! );
//! endpoint.attach().unwrap();
//! endpoint.on_receive(Some(&b"GET / HTTP/1.1\r\n\r\n"[..]));
//! ```

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
mod fmt;

mod ascii;
/// Tunables
pub mod config;
/// Socket, TLS, clock and filesystem seams
pub mod transport;
/// The socket wrapper
pub mod connection;
/// Outbound streams with completion tracking
pub mod client;
/// Socket events into protocols
pub mod endpoint;
/// Data sources and sinks
pub mod stream;
/// HTTP Headers
pub mod header;
/// HTTP Requests
pub mod request;
/// HTTP responses
pub mod response;
/// HTTP/1.1 message parsing
pub mod parser;
/// Parser events for a connection
pub mod http_connection;
/// Pipelining HTTP client
pub mod http_client;
/// HTTP server
pub mod server;
/// Websockets
pub mod websocket;
/// Driving endpoints with `embedded_io_async`
pub mod io;

#[cfg(test)]
mod testing;
