//! WebSocket client entry points
//!
//! [`WebSocketClient`] runs the opening handshake over a transport and turns
//! it into a [`Connection`]. Any `AsyncRead + AsyncWrite` stream works; TLS
//! is left to the caller, who can wrap a `TcpStream` and pass it to
//! [`WebSocketClient::connect`].
//!
//! # Example
//!
//! ```ignore
//! use sockudo_ws_client::{Handshake, Options, WebSocketClient};
//! use tokio::net::TcpStream;
//!
//! let handshake = Handshake::new("ws://example.com/ws")?
//!     .header("Origin", "http://example.com")?;
//! let stream = TcpStream::connect("example.com:80").await?;
//!
//! let client = WebSocketClient::new(Options::default());
//! let conn = client.connect(stream, &handshake).await?;
//! ```

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::Options;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handshake::{self, Handshake};

/// WebSocket client
#[derive(Debug, Clone, Default)]
pub struct WebSocketClient {
    options: Options,
}

impl WebSocketClient {
    /// Create a new client with the given options
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    /// Get the client options
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Run the upgrade handshake over an existing stream
    ///
    /// On failure the stream is shut down before the error is returned.
    pub async fn connect<S>(&self, mut stream: S, handshake: &Handshake) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match handshake::client_handshake(&mut stream, handshake).await {
            Ok(result) => {
                debug!(uri = %handshake.uri(), "connection established");
                Ok(Connection::new(stream, result, self.options.clone()))
            }
            Err(e) => {
                warn!(uri = %handshake.uri(), error = %e, "handshake failed");
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// Open a TCP connection to the handshake's host and connect over it
    ///
    /// Only `ws://` targets are supported here; `wss://` needs a TLS stream
    /// passed to [`connect`](Self::connect).
    pub async fn connect_tcp(&self, handshake: &Handshake) -> Result<Connection> {
        let uri = handshake.uri();
        if uri.is_secure() {
            return Err(Error::InvalidUri(
                "wss:// requires a TLS stream; use connect() with one",
            ));
        }

        // IPv6 literals are kept bracketed for the Host header
        let host = uri.host().trim_start_matches('[').trim_end_matches(']');
        let addr = (host, uri.port());
        let stream = tokio::time::timeout(handshake.deadline(), TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;

        self.connect(stream, handshake).await
    }

    /// Connect to a `ws://` URL with no extra headers
    pub async fn connect_to_url(&self, url: &str) -> Result<Connection> {
        let handshake = Handshake::new(url)?;
        self.connect_tcp(&handshake).await
    }
}
