//! Incremental message parser
//!
//! [`MessageParser`] turns an arbitrary split of the inbound byte stream into
//! parse events. It never blocks and never looks ahead: each call to
//! [`MessageParser::push`] consumes every byte it is given, keeps whatever
//! partial header or payload it needs in its own state, and returns the events
//! those bytes completed.
//!
//! Data messages are delivered as one or more [`ParseEvent::Data`] chunks.
//! A message that fits below the stream threshold arrives as a single chunk
//! with `first` and `fin` set; a larger one is flushed every time another
//! `stream_threshold` bytes have accumulated. Size limits always apply to the
//! running total of the message, never to a flushed chunk alone.
//!
//! The first violation produces a single [`ParseEvent::Error`] and poisons the
//! parser; later input is ignored.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

use crate::Options;
use crate::error::CloseReason;
use crate::frame::{FrameHeader, OpCode};
use crate::mask::apply_mask_offset;
use crate::message::MessageKind;
use crate::utf8::Utf8Validator;
use crate::{MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE};

/// Category of a parse failure; each maps to its own close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Framing or sequencing violation (1002)
    Protocol,
    /// Frame or message over the configured limit (1009)
    MessageTooLarge,
    /// Text message is not valid UTF-8 (1007)
    InvalidUtf8,
    /// Binary message on a text-only connection (1003)
    UnacceptableType,
}

/// A fatal parse failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{reason}")]
pub struct ParseError {
    /// Failure category
    pub kind: ParseErrorKind,
    /// Human readable reason, sent as the close reason
    pub reason: &'static str,
}

impl ParseError {
    pub(crate) const fn new(kind: ParseErrorKind, reason: &'static str) -> Self {
        Self { kind, reason }
    }

    const fn protocol(reason: &'static str) -> Self {
        Self::new(ParseErrorKind::Protocol, reason)
    }

    /// Close code the connection sends for this failure
    pub fn close_code(&self) -> u16 {
        match self.kind {
            ParseErrorKind::Protocol => CloseReason::PROTOCOL_ERROR,
            ParseErrorKind::MessageTooLarge => CloseReason::TOO_BIG,
            ParseErrorKind::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            ParseErrorKind::UnacceptableType => CloseReason::UNSUPPORTED,
        }
    }
}

const TOO_LARGE: ParseError = ParseError::new(
    ParseErrorKind::MessageTooLarge,
    "Payload exceeds maximum allowable size",
);

const INVALID_TEXT: ParseError =
    ParseError::new(ParseErrorKind::InvalidUtf8, "Invalid TEXT data; UTF-8 required");

/// Output of [`MessageParser::push`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// A chunk of the currently open data message
    Data {
        /// Message type, fixed by its first frame
        kind: MessageKind,
        /// Unmasked payload bytes
        payload: Bytes,
        /// First chunk of a new message
        first: bool,
        /// Last chunk; the message is complete
        fin: bool,
    },
    /// A complete control frame
    Control {
        /// Close, Ping or Pong
        opcode: OpCode,
        /// Unmasked payload (at most 125 bytes)
        payload: Bytes,
    },
    /// The stream violated the protocol; nothing follows
    Error(ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Collecting the fixed 2 header bytes
    Header,
    /// Collecting extended length and masking key
    ExtendedHeader,
    /// Reading payload of the current frame
    Payload,
}

/// Data message currently being reassembled
#[derive(Debug)]
struct OpenMessage {
    kind: MessageKind,
    received: u64,
    next_emit: u64,
    emitted: bool,
    utf8: Option<Utf8Validator>,
}

/// Stateful RFC 6455 decoder for the client side of a connection
#[derive(Debug)]
pub struct MessageParser {
    state: ParseState,
    header_buf: [u8; MAX_FRAME_HEADER_SIZE],
    header_len: usize,
    frame: Option<FrameHeader>,
    remaining: u64,
    frame_offset: usize,
    control_buf: BytesMut,
    data_buf: BytesMut,
    message: Option<OpenMessage>,
    frames_decoded: u64,
    failed: bool,

    max_frame_size: u64,
    max_message_size: u64,
    stream_threshold: u64,
    validate_utf8: bool,
    text_only: bool,
    accept_masked: bool,
}

impl MessageParser {
    /// Parser for server-to-client traffic; masked frames are rejected
    pub fn new(options: &Options) -> Self {
        Self {
            state: ParseState::Header,
            header_buf: [0; MAX_FRAME_HEADER_SIZE],
            header_len: 0,
            frame: None,
            remaining: 0,
            frame_offset: 0,
            control_buf: BytesMut::with_capacity(MAX_CONTROL_PAYLOAD),
            data_buf: BytesMut::new(),
            message: None,
            frames_decoded: 0,
            failed: false,
            max_frame_size: options.max_frame_size,
            max_message_size: options.max_message_size,
            stream_threshold: options.stream_threshold,
            validate_utf8: options.validate_utf8,
            text_only: options.text_only,
            accept_masked: false,
        }
    }

    /// Parser that unmasks masked frames instead of rejecting them
    ///
    /// Useful for decoding what a client writes, e.g. in tests.
    pub fn accepting_masked(options: &Options) -> Self {
        Self {
            accept_masked: true,
            ..Self::new(options)
        }
    }

    /// Number of complete frames decoded so far
    #[inline]
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Whether a protocol violation has been reported
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether a fragmented data message is open
    #[inline]
    pub fn in_message(&self) -> bool {
        self.message.is_some()
    }

    /// Feed the next chunk of the inbound stream
    pub fn push(&mut self, mut data: &[u8]) -> Vec<ParseEvent> {
        let mut events = Vec::new();

        while !self.failed && !data.is_empty() {
            let step = match self.state {
                ParseState::Header | ParseState::ExtendedHeader => {
                    self.read_header(&mut data, &mut events)
                }
                ParseState::Payload => self.read_payload(&mut data, &mut events),
            };

            if let Err(e) = step {
                trace!(reason = e.reason, "parse error");
                self.failed = true;
                self.message = None;
                self.data_buf.clear();
                events.push(ParseEvent::Error(e));
            }
        }

        events
    }

    fn read_header(
        &mut self,
        data: &mut &[u8],
        events: &mut Vec<ParseEvent>,
    ) -> Result<(), ParseError> {
        loop {
            let needed = if self.header_len < 2 {
                2
            } else {
                FrameHeader::required_len(self.header_buf[1])
            };

            if self.header_len == needed {
                break;
            }

            let take = (needed - self.header_len).min(data.len());
            self.header_buf[self.header_len..self.header_len + take].copy_from_slice(&data[..take]);
            self.header_len += take;
            *data = &data[take..];

            if self.header_len < needed {
                self.state = if self.header_len >= 2 {
                    ParseState::ExtendedHeader
                } else {
                    ParseState::Header
                };
                return Ok(());
            }
        }

        let Some((header, _)) = FrameHeader::decode(&self.header_buf[..self.header_len])? else {
            return Err(ParseError::protocol("Incomplete frame header"));
        };
        self.header_len = 0;
        self.start_frame(header, events)
    }

    fn start_frame(
        &mut self,
        header: FrameHeader,
        events: &mut Vec<ParseEvent>,
    ) -> Result<(), ParseError> {
        if header.masked && !self.accept_masked {
            return Err(ParseError::protocol("Payload must not be masked to client"));
        }

        let opcode = header.opcode;
        if opcode.is_control() {
            if !header.fin {
                return Err(ParseError::protocol("Illegal control frame fragmentation"));
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ParseError::protocol(
                    "Control frame payload must be of maximum 125 bytes or less",
                ));
            }
        } else {
            match (opcode, self.message.is_some()) {
                (OpCode::Continuation, false) => {
                    return Err(ParseError::protocol(
                        "Illegal CONTINUATION opcode; initial data frame not yet received",
                    ));
                }
                (OpCode::Text | OpCode::Binary, true) => {
                    return Err(ParseError::protocol(
                        "Illegal data type opcode after unfinished previous data type frame; \
                         opcode MUST be CONTINUATION",
                    ));
                }
                _ => {}
            }

            if header.payload_len > self.max_frame_size {
                return Err(TOO_LARGE);
            }

            let received = self.message.as_ref().map_or(0, |m| m.received);
            if received + header.payload_len > self.max_message_size {
                return Err(TOO_LARGE);
            }

            if self.message.is_none() {
                let kind = if opcode == OpCode::Binary {
                    if self.text_only {
                        return Err(ParseError::new(
                            ParseErrorKind::UnacceptableType,
                            "BINARY opcodes (0x02) not accepted",
                        ));
                    }
                    MessageKind::Binary
                } else {
                    MessageKind::Text
                };

                let utf8 = (kind == MessageKind::Text && self.validate_utf8)
                    .then(Utf8Validator::new);
                self.message = Some(OpenMessage {
                    kind,
                    received: 0,
                    next_emit: self.stream_threshold,
                    emitted: false,
                    utf8,
                });
            }
        }

        trace!(?opcode, fin = header.fin, len = header.payload_len, "frame header");

        self.remaining = header.payload_len;
        self.frame_offset = 0;
        self.frame = Some(header);
        self.state = ParseState::Payload;

        if self.remaining == 0 {
            self.finish_frame(events)?;
        }
        Ok(())
    }

    fn read_payload(
        &mut self,
        data: &mut &[u8],
        events: &mut Vec<ParseEvent>,
    ) -> Result<(), ParseError> {
        let Some(header) = self.frame.as_ref() else {
            return Err(ParseError::protocol("Payload without frame header"));
        };
        let control = header.opcode.is_control();
        let mask = header.mask;

        let take = self.remaining.min(data.len() as u64) as usize;
        let buf = if control {
            &mut self.control_buf
        } else {
            &mut self.data_buf
        };
        let start = buf.len();
        buf.extend_from_slice(&data[..take]);
        *data = &data[take..];

        if let Some(mask) = mask {
            apply_mask_offset(&mut buf[start..], mask, self.frame_offset);
        }
        self.frame_offset += take;
        self.remaining -= take as u64;

        if !control {
            if let Some(message) = self.message.as_mut() {
                message.received += take as u64;
                if let Some(utf8) = message.utf8.as_mut() {
                    if !utf8.feed(&self.data_buf[start..]) {
                        return Err(INVALID_TEXT);
                    }
                }
            }
        }

        if self.remaining == 0 {
            self.finish_frame(events)
        } else {
            if !control {
                self.maybe_flush(events);
            }
            Ok(())
        }
    }

    fn finish_frame(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), ParseError> {
        self.state = ParseState::Header;
        self.frames_decoded += 1;

        let Some(header) = self.frame.take() else {
            return Ok(());
        };

        if header.opcode.is_control() {
            events.push(ParseEvent::Control {
                opcode: header.opcode,
                payload: self.control_buf.split().freeze(),
            });
            return Ok(());
        }

        if !header.fin {
            self.maybe_flush(events);
            return Ok(());
        }

        let Some(mut message) = self.message.take() else {
            return Err(ParseError::protocol("Data frame without open message"));
        };
        if let Some(utf8) = message.utf8.as_mut() {
            if !utf8.finish() {
                return Err(INVALID_TEXT);
            }
        }

        events.push(ParseEvent::Data {
            kind: message.kind,
            payload: self.data_buf.split().freeze(),
            first: !message.emitted,
            fin: true,
        });
        Ok(())
    }

    /// Emit a partial chunk once another `stream_threshold` bytes are buffered
    fn maybe_flush(&mut self, events: &mut Vec<ParseEvent>) {
        let Some(message) = self.message.as_mut() else {
            return;
        };
        if message.received < message.next_emit {
            return;
        }

        events.push(ParseEvent::Data {
            kind: message.kind,
            payload: self.data_buf.split().freeze(),
            first: !message.emitted,
            fin: false,
        });
        message.emitted = true;
        message.next_emit = message.received + self.stream_threshold;
    }
}
