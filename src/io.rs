//! Run an [`Endpoint`] over an `embedded_io_async` stream.
//!
//! The protocols are driven by events. For a socket that implements
//! `embedded_io_async::{Read, Write}` (e.g. `embassy_net::tcp::TcpSocket`), [`serve`] turns reads
//! and writes into those events until the connection closes.
//!
//! ```
//! # use tokio;
//! use std::rc::Rc;
//!
//! use httpflow::config::{ConnectionConfig, HttpServerConfig};
//! use httpflow::io::{accept, serve};
//! use httpflow::server::{FnResource, HttpServer};
//!
//! # struct Client<'a> {
//! #     reader: &'a [u8],
//! #     writer: Vec<u8>,
//! # }
//! #
//! # impl<'a> embedded_io_async::ErrorType for Client<'a> {
//! #     type Error = embedded_io_async::ErrorKind;
//! # }
//! #
//! # impl<'a> embedded_io_async::Read for Client<'a> {
//! #     async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
//! #         match self.reader.read(buf).await {
//! #             Ok(n) => Ok(n),
//! #             Err(_) => Err(embedded_io_async::ErrorKind::Other),
//! #         }
//! #     }
//! # }
//! #
//! # impl<'a> embedded_io_async::Write for Client<'a> {
//! #     async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
//! #         self.writer.extend_from_slice(buf);
//! #         Ok(buf.len())
//! #     }
//! # }
//! #
//! async fn run_server() {
//!     let server = HttpServer::new(HttpServerConfig::default());
//!     server.add_resource(
//!         "/",
//!         Rc::new(FnResource::new(|_req, resp| {
//!             resp.send_string("<html>...</html>");
//!             Ok(())
//!         })),
//!     );
//!
//!     // Client implements embedded_io_async::{Read, Write} (not shown)
//!     let mut client = Client {
//!         reader: b"GET / HTTP/1.1\r\n\r\n",
//!         writer: Vec::new(),
//!     };
//!
//!     let mut endpoint = accept(ConnectionConfig::server(), server.connection());
//!     let mut buf = [0u8; 1024];
//!     if serve(&mut endpoint, &mut client, &mut buf).await.is_err() {
//!         // handle error
//!     }
//! }
//! #
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! #     run_server().await;
//! # })
//! ```

use alloc::vec::Vec;
use core::fmt::{Display, Formatter};

use embedded_io_async::{Read, Write};

use crate::config::ConnectionConfig;
use crate::endpoint::{Endpoint, Protocol};
use crate::transport::{Socket, TransportError};

/// Collects outgoing bytes until the driver writes them to the stream.
pub struct BufferedSocket {
    capacity: usize,
    pending: Vec<u8>,
    close_requested: bool,
}

impl BufferedSocket {
    /// Socket accepting up to `capacity` unwritten bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Vec::new(),
            close_requested: false,
        }
    }

    /// Take the bytes waiting to be written.
    pub fn take_pending(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.pending)
    }

    /// `true` once the connection asked to close.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }
}

impl Socket for BufferedSocket {
    fn connect(&mut self, _host: &str, _port: u16) -> Result<(), TransportError> {
        self.close_requested = false;
        Ok(())
    }

    fn send_window(&self) -> usize {
        self.capacity.saturating_sub(self.pending.len())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let n = data.len().min(self.send_window());
        self.pending.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        self.close_requested = true;
    }
}

/// Why [`serve`] stopped early.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriveError {
    /// Reading from the stream failed
    Read,
    /// Writing to the stream failed
    Write,
}

impl Display for DriveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Read => f.write_str("read failed"),
            Self::Write => f.write_str("write failed"),
        }
    }
}

impl core::error::Error for DriveError {}

/// Endpoint for a connection that is already established, such as an accepted server socket.
pub fn accept<P: Protocol>(config: ConnectionConfig, protocol: P) -> Endpoint<BufferedSocket, P> {
    let window = config.send_buffer_size;
    let mut endpoint = Endpoint::new(BufferedSocket::new(window), config, protocol);
    if let Err(e) = endpoint.attach() {
        warn!("cannot attach endpoint: {:?}", e);
    }
    endpoint
}

/// Feed `io` through `endpoint` until the connection closes. `buf` receives each read.
///
/// Returns `Ok(())` when either side closes. Any `Err(_)` should be handled by disconnecting the
/// client.
pub async fn serve<C, P>(
    endpoint: &mut Endpoint<BufferedSocket, P>,
    io: &mut C,
    buf: &mut [u8],
) -> Result<(), DriveError>
where
    C: Read + Write,
    P: Protocol,
{
    loop {
        let out = endpoint.socket_mut().take_pending();
        if !out.is_empty() {
            if io.write_all(&out).await.is_err() || io.flush().await.is_err() {
                warn!("write failed");
                endpoint.on_error(TransportError::ConnectionReset);
                return Err(DriveError::Write);
            }
            trace!("wrote {} bytes", out.len());
            endpoint.on_sent(out.len());
            continue;
        }

        if endpoint.socket_mut().close_requested() {
            endpoint.on_closed();
            return Ok(());
        }
        if !endpoint.client().connection().is_open() {
            return Ok(());
        }

        match io.read(buf).await {
            Ok(0) => {
                endpoint.on_receive(None);
            }
            Ok(n) => {
                endpoint.on_receive(Some(&buf[..n]));
            }
            Err(_) => {
                warn!("read failed");
                endpoint.on_error(TransportError::ConnectionReset);
                return Err(DriveError::Read);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::boxed::Box;
    use alloc::collections::VecDeque;
    use alloc::rc::Rc;
    use alloc::string::String;
    use core::cell::RefCell;
    use std::vec;

    use embedded_io_async::{ErrorKind, ErrorType};

    use super::*;
    use crate::config::{HttpClientConfig, HttpServerConfig};
    use crate::http_client::HttpClientConnection;
    use crate::request::Request;
    use crate::server::{FnResource, HttpServer};
    use crate::testing::TestRng;

    struct TestStream {
        reads: VecDeque<Result<Vec<u8>, ErrorKind>>,
        written: Vec<u8>,
    }

    impl TestStream {
        fn new(reads: &[&[u8]]) -> Self {
            Self {
                reads: reads.iter().map(|r| Ok(Vec::from(*r))).collect(),
                written: Vec::new(),
            }
        }
    }

    impl ErrorType for TestStream {
        type Error = ErrorKind;
    }

    impl Read for TestStream {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Ok(Vec::from(&data[n..])));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    impl Write for TestStream {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn hello_server() -> HttpServer {
        let server = HttpServer::new(HttpServerConfig::default());
        server.add_resource(
            "/hello",
            Rc::new(FnResource::new(|_req, resp| {
                resp.send_string("hi");
                Ok(())
            })),
        );
        server
    }

    #[tokio::test]
    async fn test_serve_pipelined_requests() {
        let server = hello_server();
        let mut endpoint = accept(ConnectionConfig::server(), server.connection());
        let mut io = TestStream::new(&[b"GET /hello HTTP/1.1\r\n\r\nGET /hel", b"lo HTTP/1.1\r\n\r\n"]);
        let mut buf = [0u8; 16];

        serve(&mut endpoint, &mut io, &mut buf).await.unwrap();

        let out = String::from_utf8(io.written).unwrap();
        let one = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nhi";
        assert_eq!(out.matches(one).count(), 2, "{out}");
    }

    #[tokio::test]
    async fn test_serve_closes_after_error_page() {
        let server = hello_server();
        let mut endpoint = accept(ConnectionConfig::server(), server.connection());
        let mut io = TestStream::new(&[b"GET /hello HTTP/1.1\r\nBad Header: x\r\n\r\n", b"never read"]);
        let mut buf = [0u8; 64];

        serve(&mut endpoint, &mut io, &mut buf).await.unwrap();

        assert!(io.written.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(io.reads.len(), 1);
    }

    #[tokio::test]
    async fn test_read_error() {
        let server = hello_server();
        let mut endpoint = accept(ConnectionConfig::server(), server.connection());
        let mut io = TestStream::new(&[]);
        io.reads.push_back(Err(ErrorKind::ConnectionReset));
        let mut buf = [0u8; 64];

        assert_eq!(
            serve(&mut endpoint, &mut io, &mut buf).await,
            Err(DriveError::Read)
        );
    }

    #[tokio::test]
    async fn test_client_over_stream() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let mut http = HttpClientConnection::new(HttpClientConfig::default(), Box::new(TestRng::new(1)));
        http.send(Request::get("http://example.com/status").unwrap().on_complete(Box::new(
            move |_req, resp, ok| {
                log.borrow_mut().push((ok, resp.body_to_string()));
                Ok(())
            },
        )))
        .unwrap();

        let mut endpoint = accept(ConnectionConfig::default(), http);
        let mut io = TestStream::new(&[b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nready"]);
        let mut buf = [0u8; 32];

        serve(&mut endpoint, &mut io, &mut buf).await.unwrap();

        assert!(io.written.starts_with(b"GET /status HTTP/1.1\r\n"));
        assert_eq!(*seen.borrow(), vec![(true, String::from("ready"))]);
    }
}
