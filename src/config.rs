//! Runtime configuration for connections, the HTTP client and server, and websockets.
//!
//! All configuration types are plain `Copy` values with defaults matching those used by typical
//! embedded deployments. Override individual values with the `with_*` builder methods:
//!
//! ```
//! use httpflow::config::{ConnectionConfig, HttpClientConfig};
//!
//! let conn = ConnectionConfig::default().with_timeout(30);
//! let client = HttpClientConfig::default().with_queue_capacity(4);
//! assert_eq!(conn.timeout, 30);
//! assert_eq!(client.queue_capacity, 4);
//! ```

/// Default idle timeout for outbound connections, in poll ticks.
pub const CLIENT_TIMEOUT: u16 = 70;
/// Default idle timeout for inbound server connections, in poll ticks.
pub const SERVER_TIMEOUT: u16 = 90;
/// Size of the scratch buffer used when pulling bytes from a stream into the socket.
pub const NETWORK_SEND_BUFFER_SIZE: usize = 1024;
/// Maximum number of socket writes performed by a single stream push.
pub const MAX_PUSH_COUNT: u8 = 25;
/// Default capacity of each of the client request queues.
pub const REQUEST_QUEUE_SIZE: usize = 10;

/// Transport level settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionConfig {
    /// Idle timeout in poll ticks, `0` disables the timeout.
    pub timeout: u16,
    /// Size of the buffer each stream push reads into.
    pub send_buffer_size: usize,
    /// Upper bound on socket writes per push, so one connection cannot starve the others.
    pub max_push_count: u8,
    /// Release the endpoint once its socket has closed.
    pub auto_self_destruct: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: CLIENT_TIMEOUT,
            send_buffer_size: NETWORK_SEND_BUFFER_SIZE,
            max_push_count: MAX_PUSH_COUNT,
            auto_self_destruct: true,
        }
    }
}

impl ConnectionConfig {
    /// Defaults for an accepted server connection.
    pub fn server() -> Self {
        Self {
            timeout: SERVER_TIMEOUT,
            ..Self::default()
        }
    }

    /// Set the idle timeout.
    pub fn with_timeout(mut self, ticks: u16) -> Self {
        self.timeout = ticks;
        self
    }

    /// Set the send buffer size. Values of zero are raised to one byte.
    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size.max(1);
        self
    }

    /// Set the maximum number of writes per push.
    pub fn with_max_push_count(mut self, count: u8) -> Self {
        self.max_push_count = count.max(1);
        self
    }

    /// Choose whether the endpoint is released once closed.
    pub fn with_auto_self_destruct(mut self, enabled: bool) -> Self {
        self.auto_self_destruct = enabled;
        self
    }
}

/// Which requests are retried automatically after a failed response.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RetryPolicy {
    /// Never retry, whatever the request's retry counter says.
    Never,
    /// Retry only methods without side effects (GET, HEAD, PUT, DELETE, OPTIONS, TRACE).
    Idempotent,
    /// Retry every request with a positive retry counter.
    Always,
}

/// HTTP client pipeline settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HttpClientConfig {
    /// Capacity of the waiting queue, and separately of the execution queue.
    pub queue_capacity: usize,
    /// Maximum response body kept when the request has no sink of its own.
    pub response_buffer_limit: usize,
    /// Maximum size of a response header section.
    pub max_header_size: usize,
    /// Retry policy for failed responses.
    pub retry_policy: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: REQUEST_QUEUE_SIZE,
            response_buffer_limit: 4096,
            max_header_size: 8192,
            retry_policy: RetryPolicy::Idempotent,
        }
    }
}

impl HttpClientConfig {
    /// Set the capacity of each request queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the in-memory response body limit.
    pub fn with_response_buffer_limit(mut self, limit: usize) -> Self {
        self.response_buffer_limit = limit;
        self
    }

    /// Set the maximum header section size.
    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// HTTP server connection settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HttpServerConfig {
    /// Idle timeout applied to each accepted connection, in poll ticks.
    pub idle_timeout: u16,
    /// Maximum size of a request header section.
    pub max_header_size: usize,
    /// Optional `Server` header value.
    pub server_name: Option<&'static str>,
    /// Maximum number of pipelined request bytes held while a response is being sent.
    pub max_backlog: usize,
    /// Emit an `ETag` derived from the response body stream id, and honour conditional requests.
    pub enable_etag: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: SERVER_TIMEOUT,
            max_header_size: 4096,
            server_name: None,
            max_backlog: 4096,
            enable_etag: true,
        }
    }
}

impl HttpServerConfig {
    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, ticks: u16) -> Self {
        self.idle_timeout = ticks;
        self
    }

    /// Set the maximum header section size.
    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Set the `Server` header value.
    pub fn with_server_name(mut self, name: &'static str) -> Self {
        self.server_name = Some(name);
        self
    }

    /// Set the pipelined request backlog limit.
    pub fn with_max_backlog(mut self, bytes: usize) -> Self {
        self.max_backlog = bytes;
        self
    }

    /// Enable or disable `ETag` handling.
    pub fn with_etag(mut self, enabled: bool) -> Self {
        self.enable_etag = enabled;
        self
    }
}

/// Websocket settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WebsocketConfig {
    /// Upper bound for a reassembled data message.
    pub max_message_size: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024,
        }
    }
}

impl WebsocketConfig {
    /// Set the maximum reassembled message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn test_defaults() {
        let client = ConnectionConfig::default();
        assert_eq!(client.timeout, 70);
        assert_eq!(client.send_buffer_size, 1024);
        assert_eq!(client.max_push_count, 25);
        assert_eq!(ConnectionConfig::server().timeout, 90);
        assert_eq!(HttpClientConfig::default().queue_capacity, 10);
        assert_eq!(
            HttpClientConfig::default().retry_policy,
            RetryPolicy::Idempotent
        );
    }

    #[test]
    fn test_builders_clamp() {
        let c = ConnectionConfig::default()
            .with_send_buffer_size(0)
            .with_max_push_count(0);
        assert_eq!(c.send_buffer_size, 1);
        assert_eq!(c.max_push_count, 1);
        assert_eq!(HttpClientConfig::default().with_queue_capacity(0).queue_capacity, 1);
    }
}
