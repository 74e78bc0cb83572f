//! UTF-8 validation for text messages
//!
//! Whole-buffer checks go through `simdutf8::basic`. Fragmented text is
//! checked with [`Utf8Validator`], which validates the concatenation of all
//! chunks without buffering them: a multi-byte sequence cut at a chunk
//! boundary (at most 3 bytes) is held back and completed by the next chunk.

use simdutf8::compat;

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Incremental UTF-8 validator for a message split across chunks
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    /// Create a validator with nothing held back
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes of an incomplete trailing sequence held back
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending_len
    }

    /// Validate the next chunk of the message
    ///
    /// Returns `false` as soon as the stream can no longer be valid UTF-8.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        let mut data = chunk;

        if self.pending_len > 0 {
            let width = sequence_width(self.pending[0]);
            let take = (width - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            if self.pending_len < width {
                // Still short; the prefix must at least be a valid start
                return match compat::from_utf8(&self.pending[..self.pending_len]) {
                    Ok(_) => true,
                    Err(e) => e.error_len().is_none(),
                };
            }

            if simdutf8::basic::from_utf8(&self.pending[..width]).is_err() {
                return false;
            }
            self.pending_len = 0;
        }

        match compat::from_utf8(data) {
            Ok(_) => true,
            Err(e) => {
                if e.error_len().is_some() {
                    return false;
                }
                let tail = &data[e.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                true
            }
        }
    }

    /// Finish the message; valid only if no sequence is left incomplete
    pub fn finish(&mut self) -> bool {
        let complete = self.pending_len == 0;
        self.pending_len = 0;
        complete
    }

    /// Forget any held-back bytes
    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}

/// Byte length of the sequence introduced by `lead`
#[inline]
fn sequence_width(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate_split(data: &[u8], at: usize) -> bool {
        let mut v = Utf8Validator::new();
        v.feed(&data[..at]) && v.feed(&data[at..]) && v.finish()
    }

    #[test]
    fn test_validate_utf8() {
        assert!(validate_utf8(b"Hello"));
        assert!(validate_utf8("Hello, 世界! 🎉".as_bytes()));
        assert!(!validate_utf8(&[0xff, 0xfe]));
        assert!(!validate_utf8(&[0xed, 0xa0, 0x80])); // surrogate
    }

    #[test]
    fn test_split_at_every_boundary_matches_whole() {
        let inputs: [&[u8]; 4] = [
            "κόσμε 世界 🎉 ok".as_bytes(),
            &[0xce, 0xba, 0xe1, 0xbd, 0xb9, 0xcf, 0x83, 0xce, 0xbc, 0xce, 0xb5],
            // valid up to the last sequence, which is a surrogate
            &[0x61, 0xed, 0xa0, 0x80],
            // truncated 4-byte sequence
            &[0x61, 0xf0, 0x9f, 0x8e],
        ];

        for input in inputs {
            let whole = validate_utf8(input);
            for at in 0..=input.len() {
                assert_eq!(validate_split(input, at), whole, "{:?} split at {}", input, at);
            }
        }
    }

    #[test]
    fn test_three_way_split_of_four_byte_sequence() {
        let bytes = "🎉".as_bytes();
        let mut v = Utf8Validator::new();
        assert!(v.feed(&bytes[..1]));
        assert!(v.feed(&bytes[1..2]));
        assert_eq!(v.pending(), 2);
        assert!(v.feed(&bytes[2..]));
        assert_eq!(v.pending(), 0);
        assert!(v.finish());
    }

    #[test]
    fn test_invalid_continuation_detected_early() {
        let mut v = Utf8Validator::new();
        assert!(v.feed(&[0xe2]));
        assert!(!v.feed(&[0x41]));
    }

    #[test]
    fn test_finish_rejects_dangling_sequence() {
        let mut v = Utf8Validator::new();
        assert!(v.feed(&[b'a', 0xe2, 0x82]));
        assert_eq!(v.pending(), 2);
        assert!(!v.finish());
    }

    #[test]
    fn test_empty_chunks() {
        let mut v = Utf8Validator::new();
        assert!(v.feed(&[]));
        assert!(v.feed(&[0xc3]));
        assert!(v.feed(&[]));
        assert!(v.feed(&[0xa9]));
        assert!(v.finish());
    }
}
