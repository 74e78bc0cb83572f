//! In-memory server side for tests

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::Options;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::handshake::{HandshakeResponse, HandshakeResult, generate_accept_key};

/// A valid 101 response for `key`, with `extra` header lines appended
pub(crate) fn accept_response(key: &str, extra: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         {}\r\n",
        generate_accept_key(key),
        extra
    )
}

/// Read one upgrade request, answer it with `respond(key)`, and hand back the
/// request text and the stream
pub(crate) async fn serve_handshake<S, F>(mut stream: S, respond: F) -> (String, S)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&str) -> Vec<u8>,
{
    let mut buf = BytesMut::with_capacity(1024);
    let (request, key) = loop {
        let n = stream.read_buf(&mut buf).await.expect("read request");
        assert!(n > 0, "client closed before sending a request");

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        if let httparse::Status::Complete(len) = req.parse(&buf).expect("parse request") {
            let key = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-key"))
                .map(|h| String::from_utf8_lossy(h.value).into_owned())
                .expect("Sec-WebSocket-Key");
            break (String::from_utf8_lossy(&buf[..len]).into_owned(), key);
        }
    };

    stream
        .write_all(&respond(&key))
        .await
        .expect("write response");
    (request, stream)
}

/// Server end of an established connection, speaking raw frames
pub(crate) struct Peer {
    pub(crate) stream: DuplexStream,
    buf: BytesMut,
}

impl Peer {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Next frame from the client, unmasked; `None` on EOF
    pub(crate) async fn frame(&mut self) -> Option<Frame> {
        loop {
            if let Some((frame, used)) = Frame::decode(&self.buf).expect("client frame") {
                let _ = self.buf.split_to(used);
                return Some(frame);
            }
            let n = self.stream.read_buf(&mut self.buf).await.expect("peer read");
            if n == 0 {
                return None;
            }
        }
    }

    /// Next frame, which must be masked
    pub(crate) async fn expect_frame(&mut self) -> Frame {
        let frame = self.frame().await.expect("frame before EOF");
        assert!(frame.header.masked, "client frames must be masked");
        frame
    }

    pub(crate) async fn send(&mut self, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.send_raw(&buf).await;
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("peer write");
    }
}

/// A connection over an in-memory duplex, with its server end
pub(crate) fn connected(options: Options) -> (Connection, Peer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let handshake = HandshakeResult {
        response: HandshakeResponse {
            status: 101,
            reason: "Switching Protocols".to_string(),
            version: 1,
            headers: HeaderMap::new(),
        },
        extensions: None,
        leftover: Bytes::new(),
    };
    (Connection::new(client, handshake, options), Peer::new(server))
}
