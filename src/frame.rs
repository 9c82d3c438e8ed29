//! WebSocket frame codec (RFC 6455 Section 5).
//!
//! Wire layout:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! The decoder is a resumable state machine: partial input leaves parsed
//! header fields in place and [`FrameCodec::bytes_needed`] reports how many
//! bytes the next transition requires. Length limits are enforced on the
//! header, before any payload is buffered.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame of a fragmented message.
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    // 0x3-0x7 reserved for future data frames
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
    // 0xB-0xF reserved for future control frames
}

impl Opcode {
    /// True for Close, Ping and Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// True for Continuation, Text and Binary.
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    /// Parses the low nibble of the first header byte.
    ///
    /// # Errors
    ///
    /// Reserved opcode values fail the connection
    /// ([`FrameError::UnknownOpcode`]).
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(FrameError::UnknownOpcode(value)),
        }
    }
}

/// A single decoded (or to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bits (header bits 1-3, stored in the low three bits:
    /// RSV1 = 0b100). Zero unless an extension negotiated a meaning.
    pub rsv: u8,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Masking key. `Some` on frames received from a client, and on frames
    /// a client-role encoder is about to mask. Servers never set it.
    pub mask_key: Option<[u8; 4]>,
    /// Payload bytes (unmasked).
    pub payload: Bytes,
}

impl Frame {
    fn data(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Single-frame text message.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Text, payload)
    }

    /// Single-frame binary message.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Binary, payload)
    }

    /// Ping control frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Ping, payload)
    }

    /// Pong control frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Pong, payload)
    }

    /// Close control frame carrying an already-encoded status payload.
    #[must_use]
    pub fn close(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Close, payload)
    }

    /// True when the frame was received with the mask bit set.
    #[must_use]
    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }
}

/// Wire-level codec errors.
#[derive(Debug)]
pub enum FrameError {
    /// I/O error surfaced through the codec.
    Io(io::Error),
    /// Reserved opcode value on the wire.
    UnknownOpcode(u8),
    /// Reserved header bits set without a negotiated extension.
    ReservedBitsSet(u8),
    /// Control frame with the FIN bit clear.
    FragmentedControlFrame,
    /// Control frame payload over the 125-byte cap.
    ControlFrameTooLarge(usize),
    /// Frame payload over the configured per-frame maximum.
    PayloadTooLarge {
        /// Length announced by the header.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Server received an unmasked frame.
    UnmaskedClientFrame,
    /// Client received a masked frame.
    MaskedServerFrame,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode: 0x{op:X}"),
            Self::ReservedBitsSet(rsv) => {
                write!(f, "reserved bits 0b{rsv:03b} set without extension")
            }
            Self::FragmentedControlFrame => write!(f, "control frame must not be fragmented"),
            Self::ControlFrameTooLarge(size) => {
                write!(f, "control frame payload of {size} bytes exceeds 125")
            }
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload of {size} bytes exceeds limit of {max}")
            }
            Self::UnmaskedClientFrame => write!(f, "client frame must be masked"),
            Self::MaskedServerFrame => write!(f, "server frame must not be masked"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Connection role. Decides masking duty: clients mask every outgoing
/// frame, servers none, and each side rejects frames that violate the
/// peer's duty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client endpoint.
    Client,
    /// Server endpoint.
    Server,
}

/// Header fields collected before the payload is available.
#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    fin: bool,
    rsv: u8,
    opcode: Opcode,
    masked: bool,
}

#[derive(Debug)]
enum DecodeState {
    /// Waiting for the two fixed header bytes.
    Header,
    /// Waiting for a 2- or 8-byte extended length field.
    ExtendedLength { header: PendingHeader, width: usize },
    /// Waiting for the 4-byte masking key.
    MaskKey { header: PendingHeader, payload_len: usize },
    /// Waiting for the payload.
    Payload {
        header: PendingHeader,
        mask_key: Option<[u8; 4]>,
        payload_len: usize,
    },
}

/// Resumable frame codec.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    state: DecodeState,
    /// Per-frame payload cap.
    max_payload_len: usize,
    /// RSV bits a negotiated extension is allowed to set (RSV1 = 0b100).
    allowed_rsv_bits: u8,
}

impl FrameCodec {
    /// Default per-frame payload cap (16 MB).
    pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

    /// Creates a codec for the given role.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: DecodeState::Header,
            max_payload_len: Self::DEFAULT_MAX_PAYLOAD_LEN,
            allowed_rsv_bits: 0,
        }
    }

    /// Creates a client-role codec.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Creates a server-role codec.
    #[must_use]
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Sets the per-frame payload cap.
    #[must_use]
    pub fn max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }

    /// Permits reserved header bits claimed by a negotiated extension.
    #[must_use]
    pub fn allow_rsv_bits(mut self, bits: u8) -> Self {
        self.allowed_rsv_bits = bits & 0b111;
        self
    }

    /// Bytes the decoder needs before its next state transition can run.
    #[must_use]
    pub fn bytes_needed(&self) -> usize {
        match &self.state {
            DecodeState::Header => 2,
            DecodeState::ExtendedLength { width, .. } => *width,
            DecodeState::MaskKey { .. } => 4,
            DecodeState::Payload { payload_len, .. } => *payload_len,
        }
    }

    fn check_payload_len(&self, len: u64) -> Result<usize, FrameError> {
        if len > self.max_payload_len as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.max_payload_len,
            });
        }
        Ok(len as usize)
    }

    /// Moves to the mask or payload state once the length is known.
    fn enter_body(&mut self, header: PendingHeader, payload_len: usize) {
        self.state = if header.masked {
            DecodeState::MaskKey {
                header,
                payload_len,
            }
        } else {
            DecodeState::Payload {
                header,
                mask_key: None,
                payload_len,
            }
        };
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0x80 != 0;
                    let rsv = (src[0] >> 4) & 0b111;
                    let opcode = Opcode::from_u8(src[0] & 0x0F)?;
                    let masked = src[1] & 0x80 != 0;
                    let len7 = src[1] & 0x7F;

                    if rsv & !self.allowed_rsv_bits != 0 {
                        return Err(FrameError::ReservedBitsSet(rsv));
                    }

                    match self.role {
                        Role::Server if !masked => return Err(FrameError::UnmaskedClientFrame),
                        Role::Client if masked => return Err(FrameError::MaskedServerFrame),
                        _ => {}
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(FrameError::FragmentedControlFrame);
                        }
                        if len7 > 125 {
                            return Err(FrameError::ControlFrameTooLarge(len7 as usize));
                        }
                    }

                    let _ = src.split_to(2);
                    let header = PendingHeader {
                        fin,
                        rsv,
                        opcode,
                        masked,
                    };

                    match len7 {
                        126 => self.state = DecodeState::ExtendedLength { header, width: 2 },
                        127 => self.state = DecodeState::ExtendedLength { header, width: 8 },
                        n => {
                            let payload_len = self.check_payload_len(u64::from(n))?;
                            self.enter_body(header, payload_len);
                        }
                    }
                }

                DecodeState::ExtendedLength { header, width } => {
                    if src.len() < *width {
                        return Ok(None);
                    }
                    let header = *header;
                    let len = if *width == 2 {
                        let raw = src.split_to(2);
                        u64::from(u16::from_be_bytes([raw[0], raw[1]]))
                    } else {
                        let raw = src.split_to(8);
                        u64::from_be_bytes([
                            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                        ])
                    };

                    let payload_len = match self.check_payload_len(len) {
                        Ok(n) => n,
                        Err(e) => {
                            // The length bytes are already consumed.
                            self.state = DecodeState::Header;
                            return Err(e);
                        }
                    };
                    self.enter_body(header, payload_len);
                }

                DecodeState::MaskKey {
                    header,
                    payload_len,
                } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let header = *header;
                    let payload_len = *payload_len;

                    let raw = src.split_to(4);
                    let mask_key = [raw[0], raw[1], raw[2], raw[3]];
                    self.state = DecodeState::Payload {
                        header,
                        mask_key: Some(mask_key),
                        payload_len,
                    };
                }

                DecodeState::Payload {
                    header,
                    mask_key,
                    payload_len,
                } => {
                    if src.len() < *payload_len {
                        return Ok(None);
                    }

                    let mut payload = src.split_to(*payload_len);
                    if let Some(key) = mask_key {
                        apply_mask(&mut payload, *key);
                    }

                    let frame = Frame {
                        fin: header.fin,
                        rsv: header.rsv,
                        opcode: header.opcode,
                        mask_key: *mask_key,
                        payload: payload.freeze(),
                    };
                    self.state = DecodeState::Header;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if payload_len > 125 {
                return Err(FrameError::ControlFrameTooLarge(payload_len));
            }
        }

        let mask_key = match self.role {
            // A pre-set key (injected by the session or a test) wins over a
            // fresh one.
            Role::Client => Some(frame.mask_key.unwrap_or_else(generate_mask_key)),
            Role::Server => None,
        };

        let mut first = frame.opcode as u8 | (frame.rsv << 4);
        if frame.fin {
            first |= 0x80;
        }
        let mask_bit = if mask_key.is_some() { 0x80 } else { 0 };

        let header_len = 2
            + if payload_len > 65535 {
                8
            } else if payload_len > 125 {
                2
            } else {
                0
            }
            + if mask_key.is_some() { 4 } else { 0 };
        dst.reserve(header_len + payload_len);

        dst.put_u8(first);
        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        if let Some(key) = mask_key {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }
}

/// XORs the payload with the masking key, in place. Masking and unmasking
/// are the same operation.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Draws a fresh masking key from OS entropy (RFC 6455 Section 5.3 requires
/// keys unpredictable to intermediaries).
#[must_use]
pub fn generate_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    getrandom::fill(&mut key).expect("OS RNG unavailable");
    key
}
