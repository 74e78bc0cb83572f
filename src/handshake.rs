//! WebSocket opening handshake (client side)
//!
//! Builds the HTTP/1.1 upgrade request for a `ws://` or `wss://` URI, reads
//! the response header block, and validates it:
//! - status line must be `HTTP/1.1 101`
//! - `Upgrade` must equal `websocket` (case-insensitive)
//! - `Connection` must list the `upgrade` token
//! - `Sec-WebSocket-Accept` must equal `base64(SHA-1(key + GUID))` byte for byte
//! - `Sec-WebSocket-Extensions` may only appear if an offer was sent
//!
//! Bytes read past the end of the header block belong to the WebSocket
//! stream and are returned in [`HandshakeResult::leftover`].

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Uri};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::WS_GUID;
use crate::error::{Error, Result};

/// Default limit for the response header block
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192;

/// Default deadline for the whole upgrade exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_RESPONSE_HEADERS: usize = 64;

/// Headers the handshake always writes itself
const RESERVED_HEADERS: [HeaderName; 6] = [
    header::HOST,
    header::CONNECTION,
    header::UPGRADE,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// A validated `ws://` / `wss://` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketUri {
    secure: bool,
    host: String,
    port: u16,
    target: String,
}

impl WebSocketUri {
    /// Parse and validate a WebSocket URI
    pub fn parse(uri: &str) -> Result<Self> {
        let uri: Uri = uri
            .parse()
            .map_err(|_| Error::InvalidUri("malformed URI"))?;

        let secure = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("ws") => false,
            Some(s) if s.eq_ignore_ascii_case("wss") => true,
            _ => return Err(Error::InvalidUri("scheme must be ws or wss")),
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or(Error::InvalidUri("missing host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let path = match uri.path() {
            "" => "/",
            p => p,
        };
        let target = match uri.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        };

        Ok(Self {
            secure,
            host,
            port,
            target,
        })
    }

    /// `true` for `wss://`
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Host name or bracketed IPv6 literal
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, explicit or the scheme default
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Request target: path plus `?query`
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// `host:port`, suitable for dialing
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the `Host` header; the port is included only when it is not
    /// the default for the scheme
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

impl FromStr for WebSocketUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for WebSocketUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{}://{}{}", scheme, self.host_header(), self.target)
    }
}

/// Description of one upgrade request
///
/// ```
/// use sockudo_ws_client::handshake::Handshake;
///
/// let handshake = Handshake::new("ws://example.com:8080/chat?room=1")?
///     .header("Origin", "https://example.com")?
///     .extensions("permessage-deflate");
/// assert_eq!(handshake.uri().host_header(), "example.com:8080");
/// # Ok::<(), sockudo_ws_client::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Handshake {
    uri: WebSocketUri,
    headers: HeaderMap,
    extensions: Option<String>,
    max_header_size: usize,
    timeout: Duration,
}

impl Handshake {
    /// Handshake for `uri` with no extra headers
    pub fn new(uri: &str) -> Result<Self> {
        Ok(Self::from_uri(WebSocketUri::parse(uri)?))
    }

    /// Handshake for an already parsed URI
    pub fn from_uri(uri: WebSocketUri) -> Self {
        Self {
            uri,
            headers: HeaderMap::new(),
            extensions: None,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Append a request header
    ///
    /// Headers the handshake writes itself (`Host`, `Connection`, `Upgrade`,
    /// `Sec-WebSocket-*` key, version and extensions) are rejected; use
    /// [`Handshake::extensions`] for the extension offer.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::InvalidOptions("invalid header name"))?;
        if RESERVED_HEADERS.contains(&name) {
            return Err(Error::InvalidOptions("header is set by the handshake"));
        }
        let value =
            HeaderValue::from_str(value).map_err(|_| Error::InvalidOptions("invalid header value"))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Offer extensions in `Sec-WebSocket-Extensions`
    pub fn extensions(mut self, offer: impl Into<String>) -> Self {
        self.extensions = Some(offer.into());
        self
    }

    /// Limit for the response header block (default 8 KiB)
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Deadline for writing the request and reading the response
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Target URI
    #[inline]
    pub fn uri(&self) -> &WebSocketUri {
        &self.uri
    }

    /// Extra request headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Extension offer, if any
    #[inline]
    pub fn extension_offer(&self) -> Option<&str> {
        self.extensions.as_deref()
    }

    /// Response header size limit
    #[inline]
    pub fn header_limit(&self) -> usize {
        self.max_header_size
    }

    /// Handshake deadline
    #[inline]
    pub fn deadline(&self) -> Duration {
        self.timeout
    }
}

/// Parsed upgrade response
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// HTTP minor version (1 for HTTP/1.1)
    pub version: u8,
    /// Response headers
    pub headers: HeaderMap,
}

impl HandshakeResponse {
    /// Header value as a string, if present and visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Result of a successful handshake
#[derive(Debug)]
pub struct HandshakeResult {
    /// The validated response
    pub response: HandshakeResponse,
    /// Extensions accepted by the server
    pub extensions: Option<String>,
    /// Bytes received after the header block
    pub leftover: Bytes,
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Generate a random `Sec-WebSocket-Key`: 16 random bytes, base64 encoded
///
/// Fails if the OS random source is unavailable.
pub fn generate_key() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| Error::Io(io::Error::other(format!("random source failed: {e}"))))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Build the upgrade request for `handshake` with the given key
pub fn build_request(handshake: &Handshake, key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(handshake.uri.target().as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(handshake.uri.host_header().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(ext) = &handshake.extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for (name, value) in &handshake.headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Parse an HTTP/1.x response header block
///
/// Returns `Ok(None)` while the block is incomplete and still within
/// `max_header_size`, otherwise the response and the bytes it occupied.
pub fn parse_response(
    buf: &[u8],
    max_header_size: usize,
) -> Result<Option<(HandshakeResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if len > max_header_size {
                return Err(Error::handshake("response header too large", None));
            }

            let mut map = HeaderMap::with_capacity(res.headers.len());
            for h in res.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| Error::handshake("invalid header name", None))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| Error::handshake("invalid header value", None))?;
                map.append(name, value);
            }

            Ok(Some((
                HandshakeResponse {
                    status: res.code.unwrap_or(0),
                    reason: res.reason.unwrap_or("").to_string(),
                    version: res.version.unwrap_or(0),
                    headers: map,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_header_size {
                return Err(Error::handshake("response header too large", None));
            }
            Ok(None)
        }
        Err(_) => Err(Error::handshake("failed to parse HTTP response", None)),
    }
}

/// Validate an upgrade response against the key that was sent
///
/// On failure the response is carried inside the returned error.
pub fn validate_response(
    response: HandshakeResponse,
    key: &str,
    offered_extensions: bool,
) -> Result<HandshakeResponse> {
    if response.version != 1 {
        return Err(Error::handshake("expected HTTP/1.1", Some(response)));
    }

    if response.status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        return Err(Error::handshake(
            "expected 101 Switching Protocols",
            Some(response),
        ));
    }

    let upgrade_ok = response
        .headers
        .get(header::UPGRADE)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"));
    if !upgrade_ok {
        return Err(Error::handshake(
            "missing or invalid Upgrade header",
            Some(response),
        ));
    }

    let connection_ok = response
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .flat_map(|v| v.as_bytes().split(|b| *b == b','))
        .any(|token| token.trim_ascii().eq_ignore_ascii_case(b"upgrade"));
    if !connection_ok {
        return Err(Error::handshake(
            "missing upgrade token in Connection header",
            Some(response),
        ));
    }

    let expected = generate_accept_key(key);
    match response.headers.get(header::SEC_WEBSOCKET_ACCEPT) {
        Some(accept) if accept.as_bytes() == expected.as_bytes() => {}
        Some(_) => {
            return Err(Error::handshake(
                "Sec-WebSocket-Accept mismatch",
                Some(response),
            ));
        }
        None => {
            return Err(Error::handshake(
                "missing Sec-WebSocket-Accept",
                Some(response),
            ));
        }
    }

    if !offered_extensions && response.headers.contains_key(header::SEC_WEBSOCKET_EXTENSIONS) {
        return Err(Error::handshake(
            "unsolicited Sec-WebSocket-Extensions",
            Some(response),
        ));
    }

    Ok(response)
}

/// Perform the client-side handshake over `stream`
///
/// Writes the request once, reads until the header block is complete, and
/// validates the response. Bounded by [`Handshake::timeout`].
pub async fn client_handshake<S>(stream: &mut S, handshake: &Handshake) -> Result<HandshakeResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(handshake.timeout, exchange(stream, handshake))
        .await
        .map_err(|_| Error::Timeout)?
}

async fn exchange<S>(stream: &mut S, handshake: &Handshake) -> Result<HandshakeResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key()?;
    let request = build_request(handshake, &key);

    debug!(uri = %handshake.uri, "sending upgrade request");
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }

        if let Some((response, consumed)) = parse_response(&buf, handshake.max_header_size)? {
            let response = validate_response(response, &key, handshake.extensions.is_some())?;
            let extensions = response
                .header(header::SEC_WEBSOCKET_EXTENSIONS.as_str())
                .map(String::from);
            let leftover = buf.split_off(consumed).freeze();

            debug!(
                status = response.status,
                leftover = leftover.len(),
                "upgrade accepted"
            );

            return Ok(HandshakeResult {
                response,
                extensions,
                leftover,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{accept_response, serve_handshake};

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn response(extra: &str) -> HandshakeResponse {
        let raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             {}\r\n",
            extra
        );
        parse_response(raw.as_bytes(), DEFAULT_MAX_HEADER_SIZE)
            .unwrap()
            .unwrap()
            .0
    }

    fn rejection(result: Result<HandshakeResponse>) -> &'static str {
        match result {
            Err(Error::Handshake(e)) => {
                assert!(e.response.is_some());
                e.reason
            }
            other => panic!("expected handshake error, got {:?}", other),
        }
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        assert_eq!(generate_accept_key(KEY), ACCEPT);
    }

    #[test]
    fn test_generate_key_is_16_random_bytes() {
        let key = generate_key().unwrap();
        let raw = base64::engine::general_purpose::STANDARD.decode(&key).unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(generate_key().unwrap(), key);
    }

    #[test]
    fn test_uri_defaults() {
        let uri = WebSocketUri::parse("ws://example.com").unwrap();
        assert!(!uri.is_secure());
        assert_eq!(uri.port(), 80);
        assert_eq!(uri.target(), "/");
        assert_eq!(uri.host_header(), "example.com");
        assert_eq!(uri.authority(), "example.com:80");

        let uri = WebSocketUri::parse("wss://example.com/feed?x=1&y=2").unwrap();
        assert!(uri.is_secure());
        assert_eq!(uri.port(), 443);
        assert_eq!(uri.target(), "/feed?x=1&y=2");
    }

    #[test]
    fn test_uri_host_header_includes_non_default_port() {
        let uri: WebSocketUri = "ws://localhost:9001/runCase?case=1".parse().unwrap();
        assert_eq!(uri.host_header(), "localhost:9001");
        assert_eq!(uri.to_string(), "ws://localhost:9001/runCase?case=1");

        // explicit default port is not repeated
        let uri = WebSocketUri::parse("wss://example.com:443/").unwrap();
        assert_eq!(uri.host_header(), "example.com");
    }

    #[test]
    fn test_uri_rejects_other_schemes() {
        assert!(matches!(
            WebSocketUri::parse("http://example.com"),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(WebSocketUri::parse("not a uri"), Err(Error::InvalidUri(_))));
        assert!(matches!(WebSocketUri::parse("/relative"), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn test_build_request() {
        let handshake = Handshake::new("ws://example.com:8080/chat?room=1")
            .unwrap()
            .header("Origin", "http://example.com")
            .unwrap()
            .extensions("permessage-deflate; client_max_window_bits");
        let request = build_request(&handshake, KEY);
        let text = std::str::from_utf8(&request).unwrap();

        assert!(text.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Key: {}\r\n", KEY)));
        assert!(
            text.contains("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n")
        );
        assert!(text.contains("origin: http://example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_reserved_headers_rejected() {
        let handshake = Handshake::new("ws://example.com").unwrap();
        assert!(matches!(
            handshake.clone().header("Sec-WebSocket-Key", "abc"),
            Err(Error::InvalidOptions(_))
        ));
        assert!(matches!(
            handshake.header("bad header", "x"),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_parse_response_partial_and_limit() {
        let partial = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n";
        assert!(parse_response(partial, DEFAULT_MAX_HEADER_SIZE).unwrap().is_none());
        assert!(matches!(
            parse_response(partial, 16),
            Err(Error::Handshake(_))
        ));
    }

    #[test]
    fn test_validate_response_ok() {
        let res = response(&format!("Sec-WebSocket-Accept: {}\r\n", ACCEPT));
        assert!(validate_response(res, KEY, false).is_ok());
    }

    #[test]
    fn test_connection_token_list() {
        let raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: WebSocket\r\n\
             Connection: keep-alive, UPGRADE\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            ACCEPT
        );
        let (res, _) = parse_response(raw.as_bytes(), DEFAULT_MAX_HEADER_SIZE)
            .unwrap()
            .unwrap();
        assert!(validate_response(res, KEY, false).is_ok());
    }

    #[test]
    fn test_validate_response_failures() {
        assert_eq!(
            rejection(validate_response(response(""), KEY, false)),
            "missing Sec-WebSocket-Accept"
        );
        assert_eq!(
            rejection(validate_response(
                response("Sec-WebSocket-Accept: \r\n"),
                KEY,
                false
            )),
            "Sec-WebSocket-Accept mismatch"
        );
        // byte-exact comparison
        assert_eq!(
            rejection(validate_response(
                response(&format!("Sec-WebSocket-Accept: {}\r\n", ACCEPT.to_lowercase())),
                KEY,
                false
            )),
            "Sec-WebSocket-Accept mismatch"
        );
        assert_eq!(
            rejection(validate_response(
                response(&format!(
                    "Sec-WebSocket-Accept: {}\r\nSec-WebSocket-Extensions: permessage-deflate\r\n",
                    ACCEPT
                )),
                KEY,
                false
            )),
            "unsolicited Sec-WebSocket-Extensions"
        );

        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let (res, _) = parse_response(raw, DEFAULT_MAX_HEADER_SIZE).unwrap().unwrap();
        assert_eq!(
            rejection(validate_response(res, KEY, false)),
            "expected 101 Switching Protocols"
        );

        let raw = b"HTTP/1.0 101 Switching Protocols\r\n\r\n";
        let (res, _) = parse_response(raw, DEFAULT_MAX_HEADER_SIZE).unwrap().unwrap();
        assert_eq!(rejection(validate_response(res, KEY, false)), "expected HTTP/1.1");
    }

    #[tokio::test]
    async fn test_client_handshake_returns_leftover() {
        let (mut client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve_handshake(server, |key| {
            let mut res = accept_response(key, "").into_bytes();
            res.extend_from_slice(&[0x81, 0x02, b'h', b'i']);
            res
        }));

        let handshake = Handshake::new("ws://localhost/").unwrap();
        let result = client_handshake(&mut client, &handshake).await.unwrap();
        assert_eq!(result.response.status, 101);
        assert_eq!(&result.leftover[..], &[0x81, 0x02, b'h', b'i']);
        assert!(result.extensions.is_none());

        let (request, _server) = server.await.unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Host: localhost\r\n"));
    }

    #[tokio::test]
    async fn test_client_handshake_extension_negotiated() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_handshake(server, |key| {
            accept_response(key, "Sec-WebSocket-Extensions: x-test\r\n").into_bytes()
        }));

        let handshake = Handshake::new("ws://localhost/").unwrap().extensions("x-test");
        let result = client_handshake(&mut client, &handshake).await.unwrap();
        assert_eq!(result.extensions.as_deref(), Some("x-test"));
    }

    #[tokio::test]
    async fn test_client_handshake_eof() {
        let (mut client, server) = tokio::io::duplex(4096);
        drop(server);
        let handshake = Handshake::new("ws://localhost/").unwrap();
        assert!(matches!(
            client_handshake(&mut client, &handshake).await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_handshake_timeout() {
        let (mut client, _server) = tokio::io::duplex(4096);
        let handshake = Handshake::new("ws://localhost/")
            .unwrap()
            .timeout(Duration::from_secs(2));
        assert!(matches!(
            client_handshake(&mut client, &handshake).await,
            Err(Error::Timeout)
        ));
    }
}
