//! Received messages
//!
//! A [`Message`] is handed out as soon as the first chunk of a data message
//! has been decoded. Its payload keeps arriving from the connection's driver
//! task through a channel, so the holder decides how to consume it: pull
//! chunks one by one (`next_chunk` or the `Stream` impl), or `buffer` the
//! whole thing. The two are mutually exclusive.
//!
//! Delivery is paced by the holder. At most one chunk waits in the channel,
//! and a connection has at most one `Message` open at a time: the next one
//! is not decoded until this one has been read to its end or dropped.
//! Dropping a `Message` early is fine: the driver keeps decoding and throws
//! away the rest of that message's chunks.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::sync::{OwnedSemaphorePermit, mpsc};

use crate::error::{Error, Result};
use crate::frame::OpCode;

/// Data message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text
    Text,
    /// Arbitrary bytes
    Binary,
}

impl MessageKind {
    /// Opcode of the first frame of a message of this kind
    #[inline]
    pub fn opcode(self) -> OpCode {
        match self {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        }
    }
}

/// One pending data chunk plus room for the error that may end the message
const CHUNK_SLOTS: usize = 2;

pub(crate) type ChunkSender = mpsc::Sender<Result<Bytes>>;

/// A single-consumer handle to one received message's payload
#[derive(Debug)]
pub struct Message {
    kind: MessageKind,
    chunks: mpsc::Receiver<Result<Bytes>>,
    streamed: bool,
    /// The connection's open-message slot, given back once the payload ends
    slot: Option<OwnedSemaphorePermit>,
}

impl Message {
    pub(crate) fn channel(kind: MessageKind, slot: OwnedSemaphorePermit) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(CHUNK_SLOTS);
        let message = Self {
            kind,
            chunks: rx,
            streamed: false,
            slot: Some(slot),
        };
        (tx, message)
    }

    /// Release the slot once nothing more can arrive
    fn settle(&mut self, item: &Option<Result<Bytes>>) {
        let done = match item {
            Some(Ok(_)) => self.chunks.is_closed() && self.chunks.is_empty(),
            Some(Err(_)) | None => true,
        };
        if done {
            self.slot = None;
        }
    }

    async fn recv(&mut self) -> Option<Result<Bytes>> {
        let item = self.chunks.recv().await;
        self.settle(&item);
        item
    }

    /// Message type
    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Whether this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    /// Whether this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        self.kind == MessageKind::Binary
    }

    /// Next payload chunk, or `None` once the message is complete
    ///
    /// If the connection failed or closed before the message was complete,
    /// the last item is the error that ended it.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.streamed = true;
        self.recv().await
    }

    /// Wait for the whole message and return it as one buffer
    ///
    /// Fails with [`Error::InvalidState`] if chunks were already pulled.
    pub async fn buffer(mut self) -> Result<Bytes> {
        if self.streamed {
            return Err(Error::InvalidState("message already consumed as a stream"));
        }

        let mut chunks = Vec::new();
        while let Some(chunk) = self.recv().await {
            chunks.push(chunk?);
        }

        if chunks.len() <= 1 {
            return Ok(chunks.pop().unwrap_or_default());
        }

        let total = chunks.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in &chunks {
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }

    /// Buffer a text message and return it as a `String`
    pub async fn into_text(self) -> Result<String> {
        if self.kind != MessageKind::Text {
            return Err(Error::InvalidState("not a text message"));
        }
        let bytes = self.buffer().await?;
        String::from_utf8(bytes.into()).map_err(|_| Error::InvalidUtf8)
    }
}

impl Stream for Message {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.streamed = true;
        let item = ready!(self.chunks.poll_recv(cx));
        self.settle(&item);
        Poll::Ready(item)
    }
}
