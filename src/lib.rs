//! # Sockudo-WS client: RFC 6455 WebSocket client for Tokio
//!
//! A WebSocket client over any `AsyncRead + AsyncWrite` transport.
//!
//! ## Layers
//!
//! - **Framing** ([`frame`], [`mask`]): frame header encode/decode, client masking
//! - **Parsing** ([`parser`]): incremental byte-stream to message-event parser with
//!   fragmentation, control-frame interleaving, size limits and UTF-8 checks
//! - **Handshake** ([`handshake`]): HTTP/1.1 upgrade request and response validation
//! - **Connection** ([`connection`]): a driver task per connection handling
//!   ping/pong, the close handshake, ordered sends and received messages
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_ws_client::{connect, CloseReason};
//!
//! let mut conn = connect("ws://127.0.0.1:9001/chat").await?;
//! conn.send_text("hello").await?;
//!
//! if let Some(message) = conn.receive().await? {
//!     println!("{}", message.into_text().await?);
//! }
//!
//! conn.close(CloseReason::NORMAL, "").await?;
//! ```

use std::time::Duration;

pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod message;
pub mod parser;
pub mod utf8;

#[cfg(test)]
mod test_util;

pub use client::WebSocketClient;
pub use connection::{Connection, ConnectionInfo, ConnectionState};
pub use error::{CloseReason, Error, HandshakeError, Result};
pub use frame::{Frame, FrameHeader, OpCode};
pub use handshake::{Handshake, HandshakeResponse, WebSocketUri};
pub use message::{Message, MessageKind};
pub use parser::{MessageParser, ParseError, ParseErrorKind, ParseEvent};

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload that fits the 16-bit extended length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Maximum payload of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Connection options
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_ws_client::Options;
///
/// let options = Options::builder()
///     .max_message_size(1024 * 1024)
///     .max_frame_size(64 * 1024)
///     .close_period(Duration::from_secs(1))
///     .build()
///     .unwrap();
/// assert_eq!(options.max_frame_size, 64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Largest frame payload accepted from the server (default: 2MB)
    pub max_frame_size: u64,
    /// Largest total message payload accepted from the server (default: 10MB)
    pub max_message_size: u64,
    /// Buffered payload after which a partial message is handed out as a
    /// chunk (default: 32KB)
    pub stream_threshold: u64,
    /// Outgoing messages larger than this are sent as several frames
    /// (default: 32KB)
    pub frame_split_threshold: u64,
    /// How long to wait for the close handshake to finish (default: 3s)
    pub close_period: Duration,
    /// Validate incoming text as UTF-8 (default: true)
    pub validate_utf8: bool,
    /// Reject binary messages with 1003 (default: false)
    pub text_only: bool,
    /// Ping the server this often while open (default: off)
    pub heartbeat_period: Option<Duration>,
    /// Close with 1008 instead of sending another heartbeat ping once this
    /// many pings are unanswered (default: 3)
    pub queued_ping_limit: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_frame_size: 2 * 1024 * 1024,
            max_message_size: 10 * 1024 * 1024,
            stream_threshold: 32 * 1024,
            frame_split_threshold: 32 * 1024,
            close_period: Duration::from_secs(3),
            validate_utf8: true,
            text_only: false,
            heartbeat_period: None,
            queued_ping_limit: 3,
        }
    }
}

impl Options {
    /// Create an options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }
}

/// Builder for [`Options`]
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum frame payload size
    pub fn max_frame_size(mut self, size: u64) -> Self {
        self.options.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: u64) -> Self {
        self.options.max_message_size = size;
        self
    }

    /// Set the partial-message chunk size
    pub fn stream_threshold(mut self, size: u64) -> Self {
        self.options.stream_threshold = size;
        self
    }

    /// Set the outgoing fragmentation size
    pub fn frame_split_threshold(mut self, size: u64) -> Self {
        self.options.frame_split_threshold = size;
        self
    }

    /// Set the close handshake period
    pub fn close_period(mut self, period: Duration) -> Self {
        self.options.close_period = period;
        self
    }

    /// Enable or disable UTF-8 validation of incoming text
    pub fn validate_utf8(mut self, enabled: bool) -> Self {
        self.options.validate_utf8 = enabled;
        self
    }

    /// Accept text messages only
    pub fn text_only(mut self, enabled: bool) -> Self {
        self.options.text_only = enabled;
        self
    }

    /// Send heartbeat pings every `period`; `None` turns them off
    pub fn heartbeat_period(mut self, period: Option<Duration>) -> Self {
        self.options.heartbeat_period = period;
        self
    }

    /// Set how many heartbeat pings may go unanswered
    pub fn queued_ping_limit(mut self, limit: u64) -> Self {
        self.options.queued_ping_limit = limit;
        self
    }

    /// Build the options
    ///
    /// Sizes, periods and the ping limit must be non-zero and the frame limit
    /// may not exceed the message limit.
    pub fn build(self) -> Result<Options> {
        let o = &self.options;
        if o.max_frame_size == 0
            || o.max_message_size == 0
            || o.stream_threshold == 0
            || o.frame_split_threshold == 0
        {
            return Err(Error::InvalidOptions("sizes must be greater than zero"));
        }
        if o.max_frame_size > o.max_message_size {
            return Err(Error::InvalidOptions(
                "max_frame_size must not exceed max_message_size",
            ));
        }
        if o.close_period.is_zero() {
            return Err(Error::InvalidOptions("close_period must be greater than zero"));
        }
        if o.heartbeat_period.is_some_and(|p| p.is_zero()) {
            return Err(Error::InvalidOptions("heartbeat_period must be greater than zero"));
        }
        if o.queued_ping_limit == 0 {
            return Err(Error::InvalidOptions("queued_ping_limit must be greater than zero"));
        }
        Ok(self.options)
    }
}

/// Connect to a `ws://` URL with default options
pub async fn connect(url: &str) -> Result<Connection> {
    WebSocketClient::default().connect_to_url(url).await
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::WebSocketClient;
    pub use crate::connection::{Connection, ConnectionInfo, ConnectionState};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::handshake::Handshake;
    pub use crate::message::{Message, MessageKind};
    pub use crate::{Options, connect};
}
