//! Message assembly: turning a stream of data frames into whole messages.
//!
//! Data frames arrive either alone (FIN set, no fragmentation) or as an
//! opening TEXT/BINARY frame with FIN clear followed by CONTINUATION
//! frames. Control frames may interleave with a fragmented message but
//! never disturb it. The assembler enforces the interleaving rules, feeds
//! TEXT payload bytes through the streaming UTF-8 validator as they
//! arrive, and caps the total message size.

use crate::frame::{Frame, Opcode};
use crate::utf8::Utf8Validator;
use bytes::{Bytes, BytesMut};

/// A complete, application-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
}

impl Message {
    /// Text message from anything string-like.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Binary message from anything byte-like.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// True for an empty payload (valid per the protocol).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a data frame could not be absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// A TEXT/BINARY frame arrived while a fragmented message was open,
    /// or a CONTINUATION arrived with none open.
    Interleaving(&'static str),
    /// TEXT payload failed UTF-8 validation.
    InvalidUtf8,
    /// Accumulated message would exceed the configured maximum.
    MessageTooBig {
        /// Size the message would have reached.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl std::fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interleaving(msg) => write!(f, "{msg}"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in text message"),
            Self::MessageTooBig { size, max } => {
                write!(f, "message of {size} bytes exceeds limit of {max}")
            }
        }
    }
}

impl std::error::Error for AssemblyError {}

/// Reassembles fragmented messages and validates text payloads.
///
/// State (the open fragment's opcode, the accumulated payload, the UTF-8
/// validator) survives interleaved control frames and is reset whenever a
/// message completes or fails.
#[derive(Debug)]
pub struct MessageAssembler {
    fragmented: bool,
    current_opcode: Opcode,
    buffer: BytesMut,
    utf8: Utf8Validator,
    max_message_len: usize,
}

impl MessageAssembler {
    /// Creates an assembler with the given whole-message cap.
    #[must_use]
    pub fn new(max_message_len: usize) -> Self {
        Self {
            fragmented: false,
            current_opcode: Opcode::Binary,
            buffer: BytesMut::new(),
            utf8: Utf8Validator::new(),
            max_message_len,
        }
    }

    /// True while a fragmented message awaits its final frame.
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        self.fragmented
    }

    /// Absorbs one data frame.
    ///
    /// Returns `Ok(Some(message))` when the frame completed a message,
    /// `Ok(None)` when more continuations are expected.
    ///
    /// # Errors
    ///
    /// [`AssemblyError`] on an interleaving violation, malformed UTF-8 or
    /// an oversized message; the assembler resets itself on error.
    pub fn push_frame(&mut self, frame: Frame) -> Result<Option<Message>, AssemblyError> {
        debug_assert!(frame.opcode.is_data());
        match self.push_inner(frame) {
            Ok(result) => Ok(result),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn push_inner(&mut self, frame: Frame) -> Result<Option<Message>, AssemblyError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.fragmented {
                    return Err(AssemblyError::Interleaving(
                        "new data frame before the previous message finished",
                    ));
                }
                self.current_opcode = frame.opcode;

                if self.current_opcode == Opcode::Text {
                    self.utf8
                        .feed(&frame.payload)
                        .map_err(|_| AssemblyError::InvalidUtf8)?;
                }

                if frame.fin {
                    // Unfragmented fast path: deliver the frame payload
                    // without copying into the buffer.
                    let message = self.finish(frame.payload)?;
                    self.reset();
                    return Ok(Some(message));
                }

                self.check_size(frame.payload.len())?;
                self.fragmented = true;
                self.buffer.extend_from_slice(&frame.payload);
                Ok(None)
            }
            Opcode::Continuation => {
                if !self.fragmented {
                    return Err(AssemblyError::Interleaving(
                        "continuation frame without an outstanding message",
                    ));
                }

                if self.current_opcode == Opcode::Text {
                    self.utf8
                        .feed(&frame.payload)
                        .map_err(|_| AssemblyError::InvalidUtf8)?;
                }

                self.check_size(self.buffer.len() + frame.payload.len())?;
                self.buffer.extend_from_slice(&frame.payload);

                if frame.fin {
                    let payload = self.buffer.split().freeze();
                    let message = self.finish(payload)?;
                    self.reset();
                    return Ok(Some(message));
                }
                Ok(None)
            }
            _ => Err(AssemblyError::Interleaving(
                "control frame routed to the message assembler",
            )),
        }
    }

    fn check_size(&self, size: usize) -> Result<(), AssemblyError> {
        if size > self.max_message_len {
            return Err(AssemblyError::MessageTooBig {
                size,
                max: self.max_message_len,
            });
        }
        Ok(())
    }

    /// Final per-message checks and conversion.
    fn finish(&mut self, payload: Bytes) -> Result<Message, AssemblyError> {
        self.check_size(payload.len())?;
        if self.current_opcode == Opcode::Text {
            // The streaming validator has seen every byte; the message must
            // also end on a codepoint boundary.
            if !self.utf8.is_complete() {
                return Err(AssemblyError::InvalidUtf8);
            }
            let text = String::from_utf8(payload.to_vec()).map_err(|_| AssemblyError::InvalidUtf8)?;
            Ok(Message::Text(text))
        } else {
            Ok(Message::Binary(payload))
        }
    }

    /// Clears all in-progress message state.
    pub fn reset(&mut self) {
        self.fragmented = false;
        self.current_opcode = Opcode::Binary;
        self.buffer.clear();
        self.utf8.reset();
    }
}
