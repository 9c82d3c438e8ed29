//! Incremental UTF-8 validation for streaming text payloads.
//!
//! Text message payloads may be split across continuation frames at
//! arbitrary byte offsets, so validation cannot use `str::from_utf8` on
//! each frame in isolation. This module provides a table-driven DFA that
//! consumes bytes as they are decoded, carries its state across frame
//! boundaries, and rejects malformed input at the earliest offending byte:
//! over-long encodings, surrogate codepoints (U+D800..U+DFFF), and
//! codepoints above U+10FFFF all fail without waiting for the end of the
//! sequence.

/// DFA state meaning "a complete, valid sequence has been consumed".
const ACCEPT: u8 = 0;
/// DFA state meaning "the input can never become valid".
const REJECT: u8 = 12;

/// Character-class index for each possible byte value.
#[rustfmt::skip]
const CHAR_CLASS: [u8; 256] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    8, 8, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    10, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 4, 3, 3,
    11, 6, 6, 6, 5, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
];

/// State transition table, indexed by `state + class`. States are
/// multiples of 12.
#[rustfmt::skip]
const TRANSITION: [u8; 108] = [
     0, 12, 24, 36, 60, 96, 84, 12, 12, 12, 48, 72,
    12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
    12,  0, 12, 12, 12, 12, 12,  0, 12,  0, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 24, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 24, 12, 12, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 12, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
];

/// The input contained a byte sequence that can never form valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidUtf8;

impl std::fmt::Display for InvalidUtf8 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid UTF-8 byte sequence")
    }
}

impl std::error::Error for InvalidUtf8 {}

/// Streaming UTF-8 validator.
///
/// Feed payload bytes with [`feed`](Self::feed) as they arrive; the state
/// survives arbitrary split points. A message is valid only if the
/// validator is in the accept state when the final frame completes
/// ([`is_complete`](Self::is_complete)). Once a bad byte is seen the
/// validator stays rejected until [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Utf8Validator {
    state: u8,
    codepoint: u32,
}

impl Utf8Validator {
    /// Creates a validator in the accept state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ACCEPT,
            codepoint: 0,
        }
    }

    /// Consumes a chunk of payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidUtf8`] at the first byte that makes the stream
    /// unsalvageable. Later calls keep failing until [`reset`](Self::reset).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), InvalidUtf8> {
        for &byte in bytes {
            let class = CHAR_CLASS[byte as usize];
            self.codepoint = if self.state == ACCEPT {
                (0xFFu32 >> u32::from(class)) & u32::from(byte)
            } else {
                u32::from(byte & 0x3F) | (self.codepoint << 6)
            };
            self.state = TRANSITION[self.state as usize + class as usize];
            if self.state == REJECT {
                return Err(InvalidUtf8);
            }
        }
        Ok(())
    }

    /// True when no codepoint is pending: every fed byte sequence ended on
    /// a codepoint boundary. This is the end-of-message check.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == ACCEPT
    }

    /// The partially accumulated codepoint, when mid-sequence.
    #[must_use]
    pub fn partial_codepoint(&self) -> Option<u32> {
        if self.state == ACCEPT || self.state == REJECT {
            None
        } else {
            Some(self.codepoint)
        }
    }

    /// Returns the validator to the accept state for the next message.
    pub fn reset(&mut self) {
        self.state = ACCEPT;
        self.codepoint = 0;
    }
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self::new()
    }
}
