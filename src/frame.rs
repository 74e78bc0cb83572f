//! WebSocket frame encoding and decoding
//!
//! Pure RFC 6455 framing: a header codec, a whole-frame codec used for
//! scripted input and tests, and [`encode_frame`] which the connection uses
//! to write masked client frames straight into its output buffer. Nothing
//! here carries state between calls; the incremental, stateful side lives in
//! [`crate::parser`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CloseReason;
use crate::mask::apply_mask;
use crate::parser::{ParseError, ParseErrorKind};
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
///
/// Reserved bits are carried through untouched; no extension is negotiated
/// that would give them meaning, and they are not validated here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1
    pub rsv1: bool,
    /// RSV2
    pub rsv2: bool,
    /// RSV3
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Header for an unmasked frame
    pub fn new(opcode: OpCode, fin: bool, payload_len: u64) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            payload_len,
            mask: None,
        }
    }

    /// Header for a frame masked with `mask`
    pub fn masked(opcode: OpCode, fin: bool, payload_len: u64, mask: [u8; 4]) -> Self {
        Self {
            masked: true,
            mask: Some(mask),
            ..Self::new(opcode, fin, payload_len)
        }
    }

    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let mut size = 2;

        if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            size += 8;
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            size += 2;
        }

        if self.masked {
            size += 4;
        }

        size
    }

    /// Number of header bytes implied by the first two header bytes
    ///
    /// Used by the incremental parser to know how much to buffer before
    /// calling [`FrameHeader::decode`].
    #[inline]
    pub fn required_len(b1: u8) -> usize {
        let ext = match b1 & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if b1 & 0x80 != 0 { 4 } else { 0 };
        2 + ext + mask
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        buf.put_u8(b0);

        let mask_bit = if self.masked { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }

    /// Decode a header from the front of `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the header and
    /// the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>, ParseError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let needed = Self::required_len(b1);
        if buf.len() < needed {
            return Ok(None);
        }

        let opcode = OpCode::from_u8(b0 & 0x0F)
            .ok_or(ParseError::new(ParseErrorKind::Protocol, "Invalid opcode"))?;

        let masked = b1 & 0x80 != 0;
        let (payload_len, mut offset) = match b1 & 0x7F {
            126 => (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4),
            127 => {
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(len);
                if len >> 63 != 0 {
                    return Err(ParseError::new(
                        ParseErrorKind::Protocol,
                        "Most significant bit of 64-bit length field set",
                    ));
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };

        let mask = if masked {
            let key = [
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ];
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some((
            FrameHeader {
                fin: b0 & 0x80 != 0,
                rsv1: b0 & 0x40 != 0,
                rsv2: b0 & 0x20 != 0,
                rsv3: b0 & 0x10 != 0,
                opcode,
                masked,
                payload_len,
                mask,
            },
            offset,
        )))
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader::new(opcode, fin, payload.len() as u64),
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame: big-endian status code followed by the reason
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(OpCode::Close, close_payload(code, reason), true)
    }

    /// Mask this frame with `mask` when encoded
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.header.masked = true;
        self.header.mask = Some(mask);
        self
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Encode header and payload, masking the payload if the header has a key
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.header.header_size() + self.payload.len());
        self.header.encode(buf);
        let start = buf.len();
        buf.put_slice(&self.payload);
        if let Some(mask) = self.header.mask {
            apply_mask(&mut buf[start..], mask);
        }
    }

    /// Decode one complete frame from the front of `buf`, unmasking it
    ///
    /// Returns `Ok(None)` until the whole frame is available.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ParseError> {
        let Some((header, header_len)) = FrameHeader::decode(buf)? else {
            return Ok(None);
        };
        let available = (buf.len() - header_len) as u64;
        if available < header.payload_len {
            return Ok(None);
        }
        let end = header_len + header.payload_len as usize;
        let mut payload = BytesMut::from(&buf[header_len..end]);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }
        Ok(Some((
            Frame {
                header,
                payload: payload.freeze(),
            },
            end,
        )))
    }

    /// Parse close frame payload
    ///
    /// Payloads shorter than two bytes carry no status and yield `None`.
    pub fn parse_close(&self) -> Option<CloseReason> {
        parse_close_payload(&self.payload)
    }
}

/// Build a close payload: 2-byte big-endian code + UTF-8 reason
pub fn close_payload(code: u16, reason: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    payload.freeze()
}

/// Parse a close payload into code and reason
pub fn parse_close_payload(payload: &[u8]) -> Option<CloseReason> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some(CloseReason::new(code, reason))
}

/// Encode a frame into a buffer
///
/// For masked frames (client mode) the payload is copied and masked in place
/// in `buf`; `payload` itself is left untouched.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let header = match mask {
        Some(m) => FrameHeader::masked(opcode, fin, payload.len() as u64, m),
        None => FrameHeader::new(opcode, fin, payload.len() as u64),
    };

    buf.reserve(header.header_size() + payload.len());
    header.encode(buf);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask(&mut buf[start..], m);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: FrameHeader) {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.header_size());
        let (decoded, used) = FrameHeader::decode(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
        assert_eq!(OpCode::from_u8(0xB), None);
    }

    #[test]
    fn test_header_roundtrip_all_length_encodings() {
        // 7-bit, both 16-bit edges, 64-bit
        for len in [0u64, 125, 126, 65535, 65536, 1 << 40] {
            roundtrip(FrameHeader::new(OpCode::Binary, true, len));
            roundtrip(FrameHeader::masked(
                OpCode::Text,
                false,
                len,
                [0x37, 0xfa, 0x21, 0x3d],
            ));
        }
    }

    #[test]
    fn test_header_roundtrip_reserved_bits() {
        let mut header = FrameHeader::new(OpCode::Continuation, false, 3);
        header.rsv1 = true;
        header.rsv3 = true;
        roundtrip(header);
    }

    #[test]
    fn test_length_field_widths() {
        let mut buf = BytesMut::new();
        FrameHeader::new(OpCode::Binary, true, 125).encode(&mut buf);
        assert_eq!(&buf[..], &[0x82, 125]);

        buf.clear();
        FrameHeader::new(OpCode::Binary, true, 126).encode(&mut buf);
        assert_eq!(&buf[..], &[0x82, 126, 0x00, 0x7E]);

        buf.clear();
        FrameHeader::new(OpCode::Binary, true, 65536).encode(&mut buf);
        assert_eq!(&buf[..], &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_decode_partial_header() {
        assert_eq!(FrameHeader::decode(&[0x81]).unwrap(), None);
        // 16-bit length announced but only one length byte present
        assert_eq!(FrameHeader::decode(&[0x81, 126, 0x01]).unwrap(), None);
        // masked, key incomplete
        assert_eq!(FrameHeader::decode(&[0x81, 0x85, 1, 2, 3]).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_64bit_msb() {
        let buf = [0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 0];
        let err = FrameHeader::decode(&buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Protocol);
        assert_eq!(err.reason, "Most significant bit of 64-bit length field set");
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let err = FrameHeader::decode(&[0x83, 0x00]).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Protocol);
    }

    #[test]
    fn test_masked_frame_roundtrip() {
        let frame = Frame::text("Hello").with_mask([0x37, 0xfa, 0x21, 0x3d]);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        // RFC 6455 section 5.7 example
        assert_eq!(
            &buf[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );

        let (decoded, used) = Frame::decode(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_decode_waits_for_payload() {
        let mut buf = BytesMut::new();
        Frame::binary(vec![7u8; 300]).encode(&mut buf);
        assert_eq!(Frame::decode(&buf[..buf.len() - 1]).unwrap(), None);
        assert!(Frame::decode(&buf).unwrap().is_some());
    }

    #[test]
    fn test_encode_frame_matches_frame_encode() {
        let mask = [1, 2, 3, 4];
        let payload = vec![0xAB; 70_000];

        let mut a = BytesMut::new();
        encode_frame(&mut a, OpCode::Binary, &payload, true, Some(mask));

        let mut b = BytesMut::new();
        Frame::binary(payload).with_mask(mask).encode(&mut b);

        assert_eq!(a, b);
    }

    #[test]
    fn test_close_payload() {
        let frame = Frame::close(1000, "bye");
        assert_eq!(&frame.payload[..], &[0x03, 0xE8, b'b', b'y', b'e']);
        assert_eq!(frame.parse_close(), Some(CloseReason::new(1000, "bye")));

        assert_eq!(parse_close_payload(&[0x03]), None);
        assert_eq!(parse_close_payload(&[0x03, 0xE8]), Some(CloseReason::new(1000, "")));
    }
}
