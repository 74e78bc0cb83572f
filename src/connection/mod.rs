//! Established WebSocket connections
//!
//! A [`Connection`] is a handle to a driver task that owns the transport.
//! Sends are queued to the driver and resolve once their frames have been
//! written; the frames of one message never interleave with another
//! message's frames. Received messages are pulled with
//! [`Connection::receive`], which takes `&mut self` so there is never more
//! than one receive outstanding.
//!
//! Reading is paced by the receiver. Only one [`Message`] is open at a time,
//! and the transport is not read while a message or chunk waits to be taken.
//! Pings and close frames from the server that arrive behind unread data
//! are only seen once that data has been consumed or the `Message` dropped.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_ws_client::{connect, CloseReason};
//!
//! let mut conn = connect("ws://localhost:9001/").await?;
//! conn.send_text("hello").await?;
//!
//! while let Some(message) = conn.receive().await? {
//!     let text = message.into_text().await?;
//!     println!("{text}");
//! }
//!
//! conn.close(CloseReason::NORMAL, "bye").await?;
//! ```

mod driver;

use std::time::SystemTime;

use bytes::Bytes;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::Options;
use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::handshake::{HandshakeResponse, HandshakeResult};
use crate::message::{Message, MessageKind};
use crate::utf8::{Utf8Validator, validate_utf8};

use driver::{Command, Driver, Inbound};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Messages flow both ways
    Open,
    /// A close frame has been sent or received; waiting for the handshake to
    /// finish or the close period to run out
    Closing,
    /// Transport released
    Closed,
}

/// Snapshot of a connection's counters and close state
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Bytes read from the transport, handshake leftover included
    pub bytes_read: u64,
    /// Bytes written to the transport after the handshake
    pub bytes_sent: u64,
    /// Complete frames decoded
    pub frames_read: u64,
    /// Frames written
    pub frames_sent: u64,
    /// Complete data messages received
    pub messages_read: u64,
    /// Complete data messages written
    pub messages_sent: u64,
    /// Pings sent
    pub ping_count: u64,
    /// Pings acknowledged, as reported by the peer's pongs
    pub pong_count: u64,
    /// When the handshake completed
    pub connected_at: SystemTime,
    /// When closing began
    pub closed_at: Option<SystemTime>,
    /// Last transport read
    pub last_read_at: Option<SystemTime>,
    /// Last transport write
    pub last_sent_at: Option<SystemTime>,
    /// Last data frame received
    pub last_data_read_at: Option<SystemTime>,
    /// Last data frame written
    pub last_data_sent_at: Option<SystemTime>,
    /// Close code once closing has begun
    pub close_code: Option<u16>,
    /// Close reason once closing has begun
    pub close_reason: Option<String>,
    /// Whether the peer sent the first close frame
    pub peer_initiated: bool,
    /// Current state
    pub state: ConnectionState,
}

impl ConnectionInfo {
    fn new() -> Self {
        Self {
            bytes_read: 0,
            bytes_sent: 0,
            frames_read: 0,
            frames_sent: 0,
            messages_read: 0,
            messages_sent: 0,
            ping_count: 0,
            pong_count: 0,
            connected_at: SystemTime::now(),
            closed_at: None,
            last_read_at: None,
            last_sent_at: None,
            last_data_read_at: None,
            last_data_sent_at: None,
            close_code: None,
            close_reason: None,
            peer_initiated: false,
            state: ConnectionState::Open,
        }
    }

    /// Pings not yet acknowledged by a pong
    #[inline]
    pub fn unanswered_pings(&self) -> u64 {
        self.ping_count.saturating_sub(self.pong_count)
    }
}

/// Handle to an established WebSocket connection
#[derive(Debug)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    inbox: mpsc::Receiver<Inbound>,
    info: watch::Receiver<ConnectionInfo>,
    send_lock: Mutex<()>,
    response: HandshakeResponse,
    extensions: Option<String>,
    frame_split_threshold: usize,
    finished: Option<CloseReason>,
}

impl Connection {
    /// Take over `stream` after a successful handshake and start the driver
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<S>(stream: S, handshake: HandshakeResult, options: Options) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        // one open message plus the final outcome
        let (inbox_tx, inbox_rx) = mpsc::channel(2);
        let (info_tx, info_rx) = watch::channel(ConnectionInfo::new());

        let frame_split_threshold = options.frame_split_threshold as usize;
        let driver = Driver::new(stream, options, commands_rx, inbox_tx, info_tx);
        tokio::spawn(driver.run(handshake.leftover));

        Self {
            commands: commands_tx,
            inbox: inbox_rx,
            info: info_rx,
            send_lock: Mutex::new(()),
            response: handshake.response,
            extensions: handshake.extensions,
            frame_split_threshold,
            finished: None,
        }
    }

    /// Wait for the next message
    ///
    /// Returns `Ok(None)` once a close this side started has been
    /// acknowledged by the peer. Every other way of closing (peer close,
    /// protocol error, timeout, lost transport) is reported as
    /// [`Error::Closed`]. Messages that arrived before closing began are
    /// handed out first. Once the end has been reported, further calls fail
    /// immediately.
    ///
    /// Cancel safe: dropping the returned future loses nothing.
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        if let Some(reason) = &self.finished {
            return Err(Error::Closed(reason.clone()));
        }

        match self.inbox.recv().await {
            Some(Inbound::Message(message)) => Ok(Some(message)),
            Some(Inbound::End(None)) => {
                self.finished = Some(self.close_reason_or_abnormal());
                Ok(None)
            }
            Some(Inbound::End(Some(reason))) => {
                self.finished = Some(reason.clone());
                Err(Error::Closed(reason))
            }
            None => {
                let reason = self.close_reason_or_abnormal();
                self.finished = Some(reason.clone());
                Err(Error::Closed(reason))
            }
        }
    }

    /// Send a text message
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(MessageKind::Text, Bytes::from(text.into())).await
    }

    /// Send pre-encoded bytes as a text message
    ///
    /// Fails with [`Error::InvalidText`] without touching the connection if
    /// `text` is not valid UTF-8.
    pub async fn send_text_bytes(&self, text: Bytes) -> Result<()> {
        if !validate_utf8(&text) {
            return Err(Error::InvalidText);
        }
        self.send(MessageKind::Text, text).await
    }

    /// Send a binary message
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(MessageKind::Binary, data.into()).await
    }

    /// Send a message, fragmenting it at the configured split threshold
    pub async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.send_lock.lock().await;
            self.command(Command::Send {
                kind,
                payload,
                done: tx,
            })?;
        }
        self.reply(rx).await
    }

    /// Send everything `reader` yields as one fragmented message
    ///
    /// The reader is consumed in `frame_split_threshold` sized frames; no
    /// other message is written until the last one. Text is validated as it
    /// goes; invalid UTF-8 or a read error ends the message early with an
    /// empty final frame and is returned.
    pub async fn send_stream<R>(&self, kind: MessageKind, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let _order = self.send_lock.lock().await;

        let size = self.frame_split_threshold.max(1);
        let mut utf8 = (kind == MessageKind::Text).then(Utf8Validator::new);
        let mut opcode = kind.opcode();
        let mut sent_any = false;

        let mut current = read_chunk(&mut reader, size).await?;

        loop {
            let mut next = match read_chunk(&mut reader, size).await {
                Ok(next) => next,
                Err(e) => {
                    self.end_stream(sent_any).await?;
                    return Err(e.into());
                }
            };
            let fin = next.is_empty();

            if let Some(utf8) = utf8.as_mut() {
                let valid = utf8.feed(&current) && (!fin || utf8.pending() == 0);
                if !valid {
                    self.end_stream(sent_any).await?;
                    return Err(Error::InvalidText);
                }
                // keep frames on character boundaries
                let hold = utf8.pending();
                if hold > 0 {
                    let mut tail = current.split_off(current.len() - hold);
                    tail.extend_from_slice(&next);
                    next = tail;
                    utf8.reset();
                }
            }

            self.fragment(opcode, Bytes::from(current), fin).await?;
            sent_any = true;
            opcode = OpCode::Continuation;

            if fin {
                return Ok(());
            }
            current = next;
        }
    }

    async fn end_stream(&self, sent_any: bool) -> Result<()> {
        if sent_any {
            self.fragment(OpCode::Continuation, Bytes::new(), true).await?;
        }
        Ok(())
    }

    async fn fragment(&self, opcode: OpCode, payload: Bytes, fin: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Fragment {
            opcode,
            payload,
            fin,
            done: tx,
        })?;
        self.reply(rx).await
    }

    /// Send a ping carrying the next ping sequence number
    ///
    /// Peers echo the payload; [`ConnectionInfo::pong_count`] tracks the
    /// highest acknowledged number.
    pub async fn ping(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Ping { done: tx })?;
        self.reply(rx).await
    }

    /// Start the close handshake and wait until the connection is closed
    ///
    /// Closing an already closing or closed connection is a no-op. `code`
    /// must be one that may appear on the wire and `reason` at most 123
    /// bytes.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidState("close code may not be sent"));
        }
        if reason.len() > 123 {
            return Err(Error::InvalidState("close reason longer than 123 bytes"));
        }

        let (tx, rx) = oneshot::channel();
        let command = Command::Close {
            code,
            reason: reason.to_string(),
            done: tx,
        };
        if self.commands.send(command).is_ok() {
            // the driver drops the waiter if it exits first
            let _ = rx.await;
        }
        Ok(())
    }

    /// Wait until the connection reaches [`ConnectionState::Closed`]
    pub async fn closed(&self) {
        let mut info = self.info.clone();
        let _ = info
            .wait_for(|info| info.state == ConnectionState::Closed)
            .await;
    }

    /// Current counters and close state
    pub fn info(&self) -> ConnectionInfo {
        self.info.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.info.borrow().state
    }

    /// Whether the connection has fully closed
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Whether the peer started the close handshake
    pub fn is_closed_by_peer(&self) -> bool {
        self.info.borrow().peer_initiated
    }

    /// Close code, once closing has begun
    pub fn close_code(&self) -> Option<u16> {
        self.info.borrow().close_code
    }

    /// Close reason, once closing has begun
    pub fn close_reason(&self) -> Option<String> {
        self.info.borrow().close_reason.clone()
    }

    /// The validated upgrade response
    pub fn response(&self) -> &HandshakeResponse {
        &self.response
    }

    /// Upgrade response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.response.headers
    }

    /// A single upgrade response header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response.header(name)
    }

    /// Extensions the server accepted
    pub fn extensions(&self) -> Option<&str> {
        self.extensions.as_deref()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Closed(self.close_reason_or_abnormal()))
    }

    async fn reply(&self, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed(self.close_reason_or_abnormal())),
        }
    }

    fn close_reason_or_abnormal(&self) -> CloseReason {
        let info = self.info.borrow();
        match info.close_code {
            Some(code) => CloseReason::new(code, info.close_reason.clone().unwrap_or_default()),
            None => CloseReason::new(CloseReason::ABNORMAL, ""),
        }
    }
}

/// Read up to `size` bytes; an empty chunk means end of input
async fn read_chunk<R>(reader: &mut R, size: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut chunk).await?;
    Ok(chunk)
}
