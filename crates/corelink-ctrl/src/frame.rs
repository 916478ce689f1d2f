//! Control-link wire framing.
//!
//! Each frame is a fixed 5-byte header followed by the payload:
//!
//! ```text
//! [payload length: u32 BE][kind: u8][payload bytes]
//! ```
//!
//! The header carries the total payload length, so a receiver can tell how
//! many bytes a frame needs before the payload has arrived. Payload content
//! is opaque at this layer; typed messages are bincode-encoded by the
//! helpers below.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Frame header size: 4-byte big-endian payload length plus 1 kind byte.
pub const HEADER_LEN: usize = 5;

/// Hard ceiling on one frame's payload. A length field above this means the
/// stream is corrupt or hostile, not that a large message is in flight.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Message Kind
// ----------------------------------------------------------------------------

/// Frame discriminator carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    /// A direct command to the peer.
    Command = 0x01,
    /// The peer's reply to a command.
    Reply = 0x02,
    /// An update for a standing subscription, dispatched separately from
    /// direct replies.
    SubscriptionReply = 0x03,
    /// Liveness probe.
    Ping = 0x04,
    /// Liveness answer. Intercepted by the link layer, never forwarded to
    /// the application.
    Pong = 0x05,
}

impl MsgKind {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MsgKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::Reply),
            0x03 => Ok(Self::SubscriptionReply),
            0x04 => Ok(Self::Ping),
            0x05 => Ok(Self::Pong),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload length {len} exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },

    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One complete wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MsgKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MsgKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Empty-payload liveness probe.
    pub fn ping() -> Self {
        Self::new(MsgKind::Ping, Vec::new())
    }

    /// Empty-payload liveness answer.
    pub fn pong() -> Self {
        Self::new(MsgKind::Pong, Vec::new())
    }

    /// Build a frame with a bincode-encoded payload.
    pub fn encode_msg<T: Serialize>(kind: MsgKind, msg: &T) -> bincode::Result<Self> {
        Ok(Self::new(kind, bincode::serialize(msg)?))
    }

    /// Decode the payload as a bincode-encoded message.
    pub fn decode_msg<T: DeserializeOwned>(&self) -> bincode::Result<T> {
        bincode::deserialize(&self.payload)
    }

    /// Total on-wire size of this frame.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.wire_len());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.push(self.kind.as_u8());
        buf.extend_from_slice(&self.payload);
    }

    /// Try to extract one complete frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed, `None` when more
    /// bytes are needed, or an error when the stream cannot possibly parse.
    pub fn extract(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Oversize {
                len,
                max: MAX_PAYLOAD,
            });
        }
        // Reject an unknown kind before waiting for its payload.
        let kind = MsgKind::try_from(buf[4])?;
        let total = HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }
        let frame = Frame::new(kind, buf[HEADER_LEN..total].to_vec());
        Ok(Some((frame, total)))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(kind: MsgKind, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        Frame::new(kind, payload.to_vec()).encode_into(&mut buf);
        buf
    }

    #[test]
    fn test_extract_needs_full_header() {
        let wire = encoded(MsgKind::Command, b"hello");
        for cut in 0..HEADER_LEN {
            assert_eq!(Frame::extract(&wire[..cut]), Ok(None));
        }
    }

    #[test]
    fn test_extract_needs_full_payload() {
        let wire = encoded(MsgKind::Reply, b"payload");
        for cut in HEADER_LEN..wire.len() {
            assert_eq!(Frame::extract(&wire[..cut]), Ok(None));
        }
    }

    #[test]
    fn test_extract_leaves_trailing_bytes() {
        let mut wire = encoded(MsgKind::Command, b"first");
        let second = encoded(MsgKind::Ping, b"");
        wire.extend_from_slice(&second);

        let (frame, consumed) = Frame::extract(&wire).unwrap().unwrap();
        assert_eq!(frame.kind, MsgKind::Command);
        assert_eq!(frame.payload, b"first");
        assert_eq!(consumed, HEADER_LEN + 5);

        let (frame, consumed) = Frame::extract(&wire[consumed..]).unwrap().unwrap();
        assert_eq!(frame.kind, MsgKind::Ping);
        assert!(frame.payload.is_empty());
        assert_eq!(consumed, HEADER_LEN);
    }

    #[test]
    fn test_extract_rejects_unknown_kind() {
        let mut wire = encoded(MsgKind::Command, b"x");
        wire[4] = 0x7f;
        assert_eq!(Frame::extract(&wire), Err(FrameError::UnknownKind(0x7f)));
    }

    #[test]
    fn test_extract_rejects_oversize_length() {
        let mut wire = vec![0u8; HEADER_LEN];
        wire[..4].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        wire[4] = MsgKind::Command.as_u8();
        assert!(matches!(
            Frame::extract(&wire),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn test_typed_payload_codec() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct SetOption {
            name: String,
            value: u32,
        }

        let msg = SetOption {
            name: "loglevel".into(),
            value: 3,
        };
        let frame = Frame::encode_msg(MsgKind::Command, &msg).unwrap();
        let mut wire = Vec::new();
        frame.encode_into(&mut wire);

        let (decoded, _) = Frame::extract(&wire).unwrap().unwrap();
        assert_eq!(decoded.decode_msg::<SetOption>().unwrap(), msg);
    }

    proptest! {
        // Any prefix of a valid frame yields "need more", and the full
        // buffer always yields the frame back regardless of payload content.
        #[test]
        fn prop_extract_is_prefix_stable(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let wire = encoded(MsgKind::SubscriptionReply, &payload);
            for cut in 0..wire.len() {
                prop_assert_eq!(Frame::extract(&wire[..cut]), Ok(None));
            }
            let (frame, consumed) = Frame::extract(&wire).unwrap().unwrap();
            prop_assert_eq!(consumed, wire.len());
            prop_assert_eq!(frame.payload, payload);
        }
    }
}
