//! # ws-engine: WebSocket protocol engine
//!
//! An RFC 6455 frame engine that turns a raw duplex byte stream into typed
//! frames (text/binary/ping/pong/close) and back, independent of how the
//! connection was established. The HTTP upgrade handshake is out of scope:
//! hand this crate an already-upgraded transport and it drives everything
//! from there.
//!
//! ## What it does
//!
//! - **Incremental framing**: resumable header parsing and payload
//!   collection over arbitrarily chunked reads, masking/unmasking included
//! - **Fragmentation**: reassembles fragmented messages, with control
//!   frames legally interleaving fragments
//! - **Size policy**: a reassembled-message byte ceiling that fragmentation
//!   cannot bypass
//! - **Keepalive**: nonce-tracked ping/pong with a timeout-driven teardown
//! - **Close handshake**: both peer- and locally-initiated, single-echo,
//!   idempotent termination
//! - **Write batching**: multiple queued frames are pipelined into one
//!   size-bounded buffer per transport write
//!
//! ## Example
//!
//! ```ignore
//! use ws_engine::{Config, Frame, WebSocketSession};
//!
//! async fn handle(transport: tokio::net::TcpStream) {
//!     let config = Config::builder()
//!         .ping_interval(std::time::Duration::from_secs(30))
//!         .max_frame_size(1024 * 1024)
//!         .build();
//!     let mut session = WebSocketSession::spawn(transport, config);
//!
//!     while let Some(frame) = session.recv().await {
//!         match frame {
//!             Ok(f) if f.opcode.is_data() => {
//!                 let _ = session.send(Frame::binary(f.payload)).await;
//!             }
//!             _ => break,
//!         }
//!     }
//! }
//! ```

use std::time::Duration;

pub mod control;
pub mod error;
pub mod frame;
pub mod mask;
pub mod parser;
pub mod reader;
pub mod serialize;
pub mod session;
pub mod writer;

pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use session::{Incoming, WebSocketSession};
pub use writer::Outbound;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encodable with the 7-bit length form
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload encodable with the 16-bit length form
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Default write batch buffer size (16KB)
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Default receive buffer size (64KB)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for a WebSocket session
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ws_engine::Config;
///
/// let config = Config::builder()
///     .ping_interval(Duration::from_secs(30))
///     .timeout(Duration::from_secs(10))
///     .max_frame_size(16 * 1024 * 1024)
///     .masking(false)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Keepalive ping interval; `None` disables the ping scheduler
    pub ping_interval: Option<Duration>,
    /// Deadline for an expected pong and for the peer's close echo
    pub timeout: Duration,
    /// Reassembled-message byte ceiling (default: 16MB)
    pub max_frame_size: usize,
    /// Whether outgoing frames are masked (client-side connections mask,
    /// server-side never do, per RFC 6455)
    pub masking: bool,
    /// Write batch buffer size for pipelining queued frames (default: 16KB)
    pub write_buffer_size: usize,
    /// Capacity of the inbound and outbound frame queues (default: 32)
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping_interval: None,
            timeout: Duration::from_secs(15),
            max_frame_size: 16 * 1024 * 1024,
            masking: false,
            write_buffer_size: WRITE_BUFFER_SIZE,
            channel_capacity: 32,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Configuration for a client-side connection (outgoing frames masked)
    pub fn client() -> Self {
        Self {
            masking: true,
            ..Self::default()
        }
    }

    /// Configuration for a server-side connection (outgoing frames unmasked)
    pub fn server() -> Self {
        Self::default()
    }
}

/// Builder for session configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the keepalive ping interval
    ///
    /// A zero interval disables the ping scheduler, same as never calling
    /// this method.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = if interval.is_zero() {
            None
        } else {
            Some(interval)
        };
        self
    }

    /// Set the pong/close-wait deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the reassembled-message byte ceiling
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Enable or disable outgoing frame masking
    pub fn masking(mut self, masking: bool) -> Self {
        self.config.masking = masking;
        self
    }

    /// Set the write batch buffer size
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the inbound/outbound queue capacity
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::session::WebSocketSession;
    pub use crate::Config;
}
