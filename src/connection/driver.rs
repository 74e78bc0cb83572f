//! Connection driver task
//!
//! One driver runs per connection and owns everything mutable: both halves of
//! the transport, the parser, the outbound queue, counters and close state.
//! It waits on several things at once: the next transport read, the next
//! caller command, completion of the single in-flight write, the close timer
//! and the heartbeat.
//! Every state change happens on this one task, so nothing here is locked.
//!
//! Decoded events go through a backlog. When the receiver is not keeping up
//! (the previous message is still open, or its last chunk has not been
//! pulled) the backlog stops draining and the transport is not read until
//! there is room again. Control frames behind that point wait as well.

use std::collections::VecDeque;
use std::future::{Future, pending};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, trace, warn};

use super::{ConnectionInfo, ConnectionState};
use crate::{MAX_FRAME_HEADER_SIZE, Options};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{OpCode, close_payload, encode_frame, parse_close_payload};
use crate::mask::generate_mask;
use crate::message::{ChunkSender, Message, MessageKind};
use crate::parser::{MessageParser, ParseError, ParseEvent};

const READ_CHUNK: usize = 16 * 1024;

pub(crate) type Reply = oneshot::Sender<Result<()>>;

/// Requests from the [`Connection`](super::Connection) handle
pub(crate) enum Command {
    /// A whole message, fragmented by the driver if needed
    Send {
        kind: MessageKind,
        payload: Bytes,
        done: Reply,
    },
    /// One frame of a message the caller is streaming
    Fragment {
        opcode: OpCode,
        payload: Bytes,
        fin: bool,
        done: Reply,
    },
    Ping {
        done: Reply,
    },
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<()>,
    },
}

/// What the handle's `receive` pulls
pub(crate) enum Inbound {
    Message(Message),
    /// Terminal outcome: `None` for an acknowledged local close
    End(Option<CloseReason>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundKind {
    Data { completes_message: bool },
    Control,
    Close,
}

/// Encoded frames written to the transport in one write
struct Outbound {
    bytes: Bytes,
    frames: u64,
    kind: OutboundKind,
    done: Option<Reply>,
}

/// Why the backlog stopped draining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocked {
    /// A new message is waiting for the previous one to be consumed
    NextMessage,
    /// The open message's last chunk has not been pulled yet
    Chunk,
}

type WriteFuture<S> = Pin<Box<dyn Future<Output = (WriteHalf<S>, io::Result<()>)> + Send>>;

pub(crate) struct Driver<S> {
    reader: ReadHalf<S>,
    writer: Option<WriteHalf<S>>,
    write: Option<WriteFuture<S>>,
    in_flight: Option<Outbound>,
    queue: VecDeque<Outbound>,
    read_buf: BytesMut,
    parser: MessageParser,
    backlog: VecDeque<ParseEvent>,
    blocked: Option<Blocked>,
    options: Options,

    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    inbox: mpsc::Sender<Inbound>,
    current: Option<ChunkSender>,
    /// One permit, held by whichever `Message` is open
    slot: Arc<Semaphore>,

    info: ConnectionInfo,
    info_tx: watch::Sender<ConnectionInfo>,
    close_deadline: Option<Instant>,
    /// Tear down as soon as our close frame is on the wire
    teardown_after_close: bool,
    local_close: bool,
    acknowledged: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(
        stream: S,
        options: Options,
        commands: mpsc::UnboundedReceiver<Command>,
        inbox: mpsc::Sender<Inbound>,
        info_tx: watch::Sender<ConnectionInfo>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let info = info_tx.borrow().clone();
        Self {
            reader,
            writer: Some(writer),
            write: None,
            in_flight: None,
            queue: VecDeque::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            parser: MessageParser::new(&options),
            backlog: VecDeque::new(),
            blocked: None,
            options,
            commands,
            commands_open: true,
            inbox,
            current: None,
            slot: Arc::new(Semaphore::new(1)),
            info,
            info_tx,
            close_deadline: None,
            teardown_after_close: false,
            local_close: false,
            acknowledged: false,
            close_waiters: Vec::new(),
        }
    }

    /// Drive the connection until it is closed; `leftover` is what the
    /// handshake read past the response headers
    pub(crate) async fn run(mut self, leftover: Bytes) {
        if !leftover.is_empty() {
            let events = self.parser.push(&leftover);
            self.on_bytes(leftover.len(), events);
            self.drain();
            self.publish();
        }

        let mut heartbeat = self.options.heartbeat_period.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        while self.info.state != ConnectionState::Closed {
            self.start_write();
            self.read_buf.reserve(READ_CHUNK);
            let deadline = self.close_deadline;
            let blocked = self.blocked;
            let beat = heartbeat.is_some() && self.is_open();

            tokio::select! {
                res = self.reader.read_buf(&mut self.read_buf), if blocked.is_none() => {
                    self.on_read(res)
                }
                _ = room(blocked, &self.slot, self.current.as_ref()), if blocked.is_some() => {}
                cmd = self.commands.recv(), if self.commands_open => self.on_command(cmd),
                (writer, res) = next_write(&mut self.write), if self.write.is_some() => {
                    self.on_written(writer, res)
                }
                _ = close_timer(deadline), if deadline.is_some() => self.on_close_timeout(),
                _ = next_beat(&mut heartbeat), if beat => self.on_heartbeat(),
            }

            self.drain();
            self.publish();
        }

        self.teardown().await;
    }

    fn publish(&self) {
        self.info_tx.send_replace(self.info.clone());
    }

    fn closing_reason(&self) -> CloseReason {
        match self.info.close_code {
            Some(code) => CloseReason::new(code, self.info.close_reason.clone().unwrap_or_default()),
            None => CloseReason::new(CloseReason::ABNORMAL, ""),
        }
    }

    fn record_close(&mut self, reason: &CloseReason) {
        if self.info.close_code.is_none() {
            self.info.close_code = Some(reason.code);
            self.info.close_reason = Some(reason.reason.clone());
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn on_read(&mut self, res: io::Result<usize>) {
        match res {
            Ok(0) => self.on_eof(),
            Ok(n) => {
                let events = self.parser.push(&self.read_buf);
                self.read_buf.clear();
                self.on_bytes(n, events);
            }
            Err(e) => {
                warn!(error = %e, "transport read failed");
                self.abort(CloseReason::new(CloseReason::ABNORMAL, e.to_string()));
            }
        }
    }

    fn on_bytes(&mut self, n: usize, events: Vec<ParseEvent>) {
        self.info.bytes_read += n as u64;
        self.info.frames_read = self.parser.frames_decoded();
        self.info.last_read_at = Some(SystemTime::now());
        self.backlog.extend(events);
    }

    /// Handle backlogged events in order until one has to wait for the receiver
    fn drain(&mut self) {
        self.blocked = None;
        while let Some(event) = self.backlog.pop_front() {
            if let Err((event, blocked)) = self.on_event(event) {
                self.backlog.push_front(event);
                self.blocked = Some(blocked);
                return;
            }
        }
    }

    fn on_eof(&mut self) {
        match self.info.state {
            ConnectionState::Open => {
                debug!("transport closed without a close frame");
                self.abort(CloseReason::new(
                    CloseReason::ABNORMAL,
                    "Peer closed the underlying connection without a close frame",
                ));
            }
            _ => {
                debug!("transport closed during close handshake");
                self.info.state = ConnectionState::Closed;
            }
        }
    }

    /// Hand back the event if the receiver has no room for it yet
    fn on_event(&mut self, event: ParseEvent) -> std::result::Result<(), (ParseEvent, Blocked)> {
        match event {
            ParseEvent::Data {
                kind,
                payload,
                first,
                fin,
            } => {
                if !self.is_open() {
                    return Ok(());
                }

                if first {
                    let Ok(permit) = self.slot.clone().try_acquire_owned() else {
                        let event = ParseEvent::Data {
                            kind,
                            payload,
                            first,
                            fin,
                        };
                        return Err((event, Blocked::NextMessage));
                    };
                    let (tx, message) = Message::channel(kind, permit);
                    self.current = Some(tx);
                    // make counters that precede this message visible to the receiver
                    self.publish();
                    let _ = self.inbox.try_send(Inbound::Message(message));
                }

                if let Some(tx) = &self.current {
                    if !payload.is_empty() {
                        if !has_room(tx) {
                            let event = ParseEvent::Data {
                                kind,
                                payload,
                                first: false,
                                fin,
                            };
                            return Err((event, Blocked::Chunk));
                        }
                        // a dropped Message just discards the rest
                        let _ = tx.try_send(Ok(payload));
                    }
                }

                self.info.last_data_read_at = Some(SystemTime::now());
                if fin {
                    self.current = None;
                    self.info.messages_read += 1;
                }
            }
            ParseEvent::Control { opcode, payload } => self.on_control(opcode, payload),
            ParseEvent::Error(e) => self.on_parse_error(e),
        }
        Ok(())
    }

    fn on_control(&mut self, opcode: OpCode, payload: Bytes) {
        match opcode {
            OpCode::Ping => {
                // only the close frame goes out once closing has begun
                if self.is_open() {
                    trace!(len = payload.len(), "ping, queueing pong");
                    self.enqueue_control(OpCode::Pong, &payload, OutboundKind::Control, None);
                }
            }
            OpCode::Pong => {
                let acked = std::str::from_utf8(&payload)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok());
                if let Some(acked) = acked {
                    self.info.pong_count = self.info.ping_count.min(acked);
                }
            }
            OpCode::Close => {
                let Some(reason) = parse_close_payload(&payload) else {
                    trace!("ignoring close frame without status code");
                    return;
                };

                match self.info.state {
                    ConnectionState::Open => {
                        debug!(code = reason.code, reason = %reason.reason, "peer initiated close");
                        self.record_close(&reason);
                        self.info.peer_initiated = true;
                        self.teardown_after_close = true;
                        self.begin_close(reason.code, &reason.reason, Error::Closed(reason.clone()));
                    }
                    ConnectionState::Closing => {
                        debug!(code = reason.code, "close acknowledged");
                        self.acknowledged = self.local_close;
                        self.info.state = ConnectionState::Closed;
                    }
                    ConnectionState::Closed => {}
                }
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {}
        }
    }

    fn on_parse_error(&mut self, e: ParseError) {
        if self.info.state != ConnectionState::Open {
            return;
        }
        warn!(code = e.close_code(), reason = e.reason, "protocol violation");
        let reason = CloseReason::new(e.close_code(), e.reason);
        self.record_close(&reason);
        self.begin_close(reason.code, e.reason, Error::from(e));
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, cmd: Option<Command>) {
        let Some(cmd) = cmd else {
            // every handle is gone
            self.commands_open = false;
            if self.info.state == ConnectionState::Open {
                debug!("connection handle dropped, closing");
                self.start_local_close(CloseReason::NORMAL, String::new());
            }
            return;
        };

        match cmd {
            Command::Send {
                kind,
                payload,
                done,
            } => {
                if !self.is_open() {
                    let _ = done.send(Err(Error::Closed(self.closing_reason())));
                    return;
                }
                self.enqueue_message(kind.opcode(), &payload, done);
            }
            Command::Fragment {
                opcode,
                payload,
                fin,
                done,
            } => {
                if !self.is_open() {
                    let _ = done.send(Err(Error::Closed(self.closing_reason())));
                    return;
                }
                let mut buf = BytesMut::with_capacity(payload.len() + MAX_FRAME_HEADER_SIZE);
                encode_frame(&mut buf, opcode, &payload, fin, Some(generate_mask()));
                self.queue.push_back(Outbound {
                    bytes: buf.freeze(),
                    frames: 1,
                    kind: OutboundKind::Data {
                        completes_message: fin,
                    },
                    done: Some(done),
                });
            }
            Command::Ping { done } => {
                if !self.is_open() {
                    let _ = done.send(Err(Error::Closed(self.closing_reason())));
                    return;
                }
                self.info.ping_count += 1;
                let payload = self.info.ping_count.to_string();
                self.enqueue_control(
                    OpCode::Ping,
                    payload.as_bytes(),
                    OutboundKind::Control,
                    Some(done),
                );
            }
            Command::Close { code, reason, done } => match self.info.state {
                ConnectionState::Open => {
                    self.close_waiters.push(done);
                    self.start_local_close(code, reason);
                }
                ConnectionState::Closing => self.close_waiters.push(done),
                ConnectionState::Closed => {
                    let _ = done.send(());
                }
            },
        }
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.info.state == ConnectionState::Open
    }

    fn start_local_close(&mut self, code: u16, reason: String) {
        debug!(code, reason = %reason, "closing connection");
        let close = CloseReason::new(code, reason);
        self.record_close(&close);
        self.local_close = true;
        self.begin_close(code, &close.reason, Error::Closed(close.clone()));
    }

    /// Enter `Closing`: fail the open message, queue our close frame, arm the timer
    fn begin_close(&mut self, code: u16, reason: &str, message_error: Error) {
        self.info.state = ConnectionState::Closing;
        self.info.closed_at = Some(SystemTime::now());
        self.close_deadline = Some(Instant::now() + self.options.close_period);

        if let Some(tx) = self.current.take() {
            let _ = tx.try_send(Err(message_error));
        }

        let payload = close_payload(code, reason);
        self.enqueue_control(OpCode::Close, &payload, OutboundKind::Close, None);
    }

    /// Ping the peer, or give up on it once too many pings went unanswered
    fn on_heartbeat(&mut self) {
        let unanswered = self.info.unanswered_pings();
        if unanswered >= self.options.queued_ping_limit {
            warn!(unanswered, "peer stopped answering pings");
            let reason = CloseReason::new(CloseReason::POLICY, "Exceeded unanswered PING limit");
            self.record_close(&reason);
            self.begin_close(reason.code, &reason.reason, Error::Closed(reason.clone()));
            return;
        }

        self.info.ping_count += 1;
        trace!(count = self.info.ping_count, "heartbeat ping");
        let payload = self.info.ping_count.to_string();
        self.enqueue_control(OpCode::Ping, payload.as_bytes(), OutboundKind::Control, None);
    }

    fn on_close_timeout(&mut self) {
        debug!(
            period = ?self.options.close_period,
            "close handshake timed out"
        );
        self.close_deadline = None;
        self.info.state = ConnectionState::Closed;
    }

    /// Fail hard: no close frame, straight to `Closed`
    fn abort(&mut self, reason: CloseReason) {
        self.record_close(&reason);
        self.info.state = ConnectionState::Closed;
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn enqueue_message(&mut self, opcode: OpCode, payload: &[u8], done: Reply) {
        let split = self.options.frame_split_threshold.max(1) as usize;
        let mut buf = BytesMut::with_capacity(payload.len() + MAX_FRAME_HEADER_SIZE);
        let mut frames = 0;

        if payload.len() <= split {
            encode_frame(&mut buf, opcode, payload, true, Some(generate_mask()));
            frames = 1;
        } else {
            let count = payload.len().div_ceil(split);
            for (i, chunk) in payload.chunks(split).enumerate() {
                let op = if i == 0 { opcode } else { OpCode::Continuation };
                encode_frame(&mut buf, op, chunk, i + 1 == count, Some(generate_mask()));
                frames += 1;
            }
        }

        self.queue.push_back(Outbound {
            bytes: buf.freeze(),
            frames,
            kind: OutboundKind::Data {
                completes_message: true,
            },
            done: Some(done),
        });
    }

    fn enqueue_control(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        kind: OutboundKind,
        done: Option<Reply>,
    ) {
        let mut buf = BytesMut::with_capacity(payload.len() + 6);
        encode_frame(&mut buf, opcode, payload, true, Some(generate_mask()));
        self.queue.push_back(Outbound {
            bytes: buf.freeze(),
            frames: 1,
            kind,
            done,
        });
    }

    /// Start writing the next queued item if the writer is idle
    fn start_write(&mut self) {
        if self.write.is_some() || self.info.state == ConnectionState::Closed {
            return;
        }
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let Some(item) = self.queue.pop_front() else {
            self.writer = Some(writer);
            return;
        };

        let bytes = item.bytes.clone();
        self.in_flight = Some(item);
        self.write = Some(Box::pin(async move {
            let res = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            }
            .await;
            (writer, res)
        }));
    }

    fn on_written(&mut self, writer: WriteHalf<S>, res: io::Result<()>) {
        self.write = None;
        self.writer = Some(writer);
        let Some(item) = self.in_flight.take() else {
            return;
        };

        match res {
            Ok(()) => {
                let now = SystemTime::now();
                self.info.bytes_sent += item.bytes.len() as u64;
                self.info.frames_sent += item.frames;
                self.info.last_sent_at = Some(now);
                if let OutboundKind::Data { completes_message } = item.kind {
                    self.info.last_data_sent_at = Some(now);
                    if completes_message {
                        self.info.messages_sent += 1;
                    }
                }
                trace!(bytes = item.bytes.len(), frames = item.frames, "written");

                if let Some(done) = item.done {
                    let _ = done.send(Ok(()));
                }
                if item.kind == OutboundKind::Close && self.teardown_after_close {
                    self.info.state = ConnectionState::Closed;
                }
            }
            Err(e) => {
                warn!(error = %e, "transport write failed");
                let reason = CloseReason::new(CloseReason::ABNORMAL, e.to_string());
                if let Some(done) = item.done {
                    let _ = done.send(Err(Error::Io(e)));
                }
                self.abort(reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn teardown(mut self) {
        let now = SystemTime::now();
        self.info.state = ConnectionState::Closed;
        self.info.closed_at.get_or_insert(now);
        self.close_deadline = None;
        let reason = self.closing_reason();

        if let Some(tx) = self.current.take() {
            let _ = tx.try_send(Err(Error::Closed(reason.clone())));
        }

        for item in self.in_flight.take().into_iter().chain(self.queue.drain(..)) {
            if let Some(done) = item.done {
                let _ = done.send(Err(Error::Closed(reason.clone())));
            }
        }

        let outcome = if self.acknowledged {
            None
        } else {
            Some(reason.clone())
        };
        debug!(
            code = reason.code,
            reason = %reason.reason,
            clean = outcome.is_none(),
            "connection closed"
        );

        self.publish();
        let _ = self.inbox.try_send(Inbound::End(outcome));
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }

        // a write cut off mid-flight still owns the writer; dropping it is enough
        self.write = None;
        if let Some(mut writer) = self.writer.take() {
            let period = self.options.close_period;
            let _ = tokio::time::timeout(period, writer.shutdown()).await;
        }
    }
}

async fn next_write<S>(write: &mut Option<WriteFuture<S>>) -> (WriteHalf<S>, io::Result<()>) {
    match write {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn close_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Whether a chunk can go out now; a closed channel discards it
fn has_room(tx: &ChunkSender) -> bool {
    tx.is_closed() || tx.capacity() == tx.max_capacity()
}

/// Resolves once whatever `blocked` waits on may have cleared
async fn room(blocked: Option<Blocked>, slot: &Semaphore, current: Option<&ChunkSender>) {
    match (blocked, current) {
        (Some(Blocked::NextMessage), _) => {
            let _ = slot.acquire().await;
        }
        (Some(Blocked::Chunk), Some(tx)) => {
            // both slots free means the channel is empty
            let _first = tx.reserve().await;
            let _second = tx.reserve().await;
        }
        _ => pending().await,
    }
}

async fn next_beat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
