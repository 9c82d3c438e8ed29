//! Close handshake semantics (RFC 6455 Section 7): status-code catalog,
//! close-frame payload parsing, and the sanitation rules applied to every
//! outgoing close.

use crate::frame::Frame;
use bytes::{BufMut, Bytes, BytesMut};

/// Close status codes from the RFC 6455 catalog.
///
/// `NoStatus` and `AbnormalClose` are sentinels for reporting; they are
/// never written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Endpoint going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    ProtocolError = 1002,
    /// Data type the endpoint cannot accept (1003).
    UnsupportedData = 1003,
    /// No status present in the close frame (1005, sentinel).
    NoStatus = 1005,
    /// Connection dropped without a close frame (1006, sentinel).
    AbnormalClose = 1006,
    /// Message data inconsistent with its type, e.g. bad UTF-8 (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big to process (1009).
    MessageTooBig = 1009,
    /// Client required an extension the server did not negotiate (1010).
    ExtensionRequired = 1010,
    /// Unexpected condition inside the endpoint (1011).
    InternalEndpointError = 1011,
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// True for the codes that must never appear on the wire (1005, 1006).
/// Codes that cannot be represented in the two-byte field do not reach
/// this check.
#[must_use]
pub fn is_invalid_on_wire(code: u16) -> bool {
    matches!(code, 1005 | 1006)
}

/// True for codes reserved by the protocol: 0-999, 1004, 1012-1014 and
/// everything from 1015 up, excluding the 4000-4999 application range.
#[must_use]
pub fn is_reserved(code: u16) -> bool {
    !is_invalid_on_wire(code) && !matches!(code, 1000..=1003 | 1007..=1011 | 4000..=4999)
}

/// True for codes a peer may legitimately send in a close frame. The
/// 3000-3999 registered range is accepted on receipt even though this
/// endpoint never originates it.
#[must_use]
pub fn is_acceptable_on_wire(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Outgoing-close sanitation.
///
/// Maps the application- or protocol-supplied status onto what actually
/// goes on the wire:
///
/// - `NoStatus` becomes `Normal` with an empty reason,
/// - `AbnormalClose` becomes `PolicyViolation`, keeping the reason,
/// - codes invalid on the wire become `ProtocolError` / "Status code is
///   invalid",
/// - reserved codes become `ProtocolError` / "Status code is reserved",
/// - anything else passes through unchanged.
#[must_use]
pub fn sanitize_close(code: u16, reason: &str) -> (u16, String) {
    if code == CloseCode::NoStatus as u16 {
        (CloseCode::Normal as u16, String::new())
    } else if code == CloseCode::AbnormalClose as u16 {
        (CloseCode::PolicyViolation as u16, reason.to_string())
    } else if is_invalid_on_wire(code) {
        (
            CloseCode::ProtocolError as u16,
            "Status code is invalid".to_string(),
        )
    } else if is_reserved(code) {
        (
            CloseCode::ProtocolError as u16,
            "Status code is reserved".to_string(),
        )
    } else {
        (code, reason.to_string())
    }
}

/// Why a close-frame payload failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePayloadError {
    /// One-byte payload: a status code needs two bytes.
    TruncatedCode,
    /// The status code may not appear on the wire.
    DisallowedCode(u16),
    /// The reason text was not valid UTF-8.
    InvalidReasonUtf8,
}

impl std::fmt::Display for ClosePayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TruncatedCode => write!(f, "close payload of one byte"),
            Self::DisallowedCode(code) => write!(f, "close status code {code} not allowed"),
            Self::InvalidReasonUtf8 => write!(f, "close reason is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ClosePayloadError {}

/// Parsed close-frame payload: empty, a bare status code, or a status
/// code followed by a UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseReason {
    /// Status code, when the payload carried one.
    pub code: Option<u16>,
    /// Reason text, when the payload carried one.
    pub reason: Option<String>,
}

impl CloseReason {
    /// Close reason with a code and optional text.
    #[must_use]
    pub fn new(code: u16, reason: Option<&str>) -> Self {
        Self {
            code: Some(code),
            reason: reason.map(String::from),
        }
    }

    /// Normal closure, no reason text.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal as u16, None)
    }

    /// Parses a received close payload.
    ///
    /// # Errors
    ///
    /// - [`ClosePayloadError::TruncatedCode`] for a one-byte payload,
    /// - [`ClosePayloadError::DisallowedCode`] when the code is one the
    ///   peer may not send,
    /// - [`ClosePayloadError::InvalidReasonUtf8`] for a malformed reason.
    pub fn parse(payload: &[u8]) -> Result<Self, ClosePayloadError> {
        match payload.len() {
            0 => Ok(Self::default()),
            1 => Err(ClosePayloadError::TruncatedCode),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !is_acceptable_on_wire(code) {
                    return Err(ClosePayloadError::DisallowedCode(code));
                }
                let reason = if payload.len() > 2 {
                    let text = std::str::from_utf8(&payload[2..])
                        .map_err(|_| ClosePayloadError::InvalidReasonUtf8)?;
                    Some(text.to_string())
                } else {
                    None
                };
                Ok(Self {
                    code: Some(code),
                    reason,
                })
            }
        }
    }

    /// Encodes this reason as a close-frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match (&self.code, &self.reason) {
            (None, _) => Bytes::new(),
            (Some(code), None) => Bytes::copy_from_slice(&code.to_be_bytes()),
            (Some(code), Some(reason)) => {
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(*code);
                buf.put_slice(reason.as_bytes());
                buf.freeze()
            }
        }
    }

    /// Builds the close frame carrying this reason.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::close(self.encode())
    }
}

/// Terminal record of how a session ended.
///
/// `was_clean` is true only after a close frame was both sent and
/// received. `closed_by_me` records who sent the first close frame,
/// `dropped_by_me` who initiated the TCP shutdown.
#[derive(Debug, Clone, Default)]
pub struct CloseRecord {
    /// Status code this endpoint sent (post-sanitation).
    pub local_code: Option<u16>,
    /// Reason this endpoint sent.
    pub local_reason: Option<String>,
    /// Status code received from the peer.
    pub remote_code: Option<u16>,
    /// Reason received from the peer.
    pub remote_reason: Option<String>,
    /// Both sides exchanged close frames before TCP shutdown.
    pub was_clean: bool,
    /// This endpoint sent the first close frame.
    pub closed_by_me: bool,
    /// This endpoint initiated the TCP shutdown.
    pub dropped_by_me: bool,
}
