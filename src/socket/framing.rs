//! Wire codec for [`super::StreamSocket`].
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: Application message (opaque bytes, may be empty)
//! - `0x02`: Close notice - `[i32 LE reason]`

use anyhow::{bail, Result};

/// Frame type constants.
pub mod frame_type {
    /// Application message.
    pub const MESSAGE: u8 = 0x01;
    /// Close notice carrying the sender's disconnect reason.
    pub const CLOSE: u8 = 0x02;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One application message.
    Message(Vec<u8>),
    /// The peer is disconnecting.
    Close {
        /// Peer-supplied disconnect reason.
        reason: i32,
    },
}

impl Frame {
    /// Encode this frame into a wire-format byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Message(data) => encode_raw(frame_type::MESSAGE, data),
            Frame::Close { reason } => encode_raw(frame_type::CLOSE, &reason.to_le_bytes()),
        }
    }
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Frame> {
    match frame_type {
        frame_type::MESSAGE => Ok(Frame::Message(payload.to_vec())),
        frame_type::CLOSE => {
            let Ok(bytes) = <[u8; 4]>::try_from(payload) else {
                bail!("Close frame has wrong size: {} bytes", payload.len());
            };
            Ok(Frame::Close {
                reason: i32::from_le_bytes(bytes),
            })
        }
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder rejecting frames longer than `max_frame_size` bytes.
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    /// The decoder is unusable afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length == 0 {
                bail!("Invalid frame: zero length");
            }
            // length counts the type byte on top of the payload
            if length - 1 > self.max_frame_size {
                bail!("Frame too large: {length} bytes (max {})", self.max_frame_size);
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            let frame = decode_frame(self.buf[4], &self.buf[5..total])?;
            frames.push(frame);

            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(crate::constants::MAX_MESSAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_layout() {
        let encoded = Frame::Message(b"hi".to_vec()).encode();
        assert_eq!(encoded, vec![3, 0, 0, 0, frame_type::MESSAGE, b'h', b'i']);
    }

    #[test]
    fn test_close_carries_reason() {
        let frame = Frame::Close { reason: -7 };
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_empty_message_is_valid() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(&Frame::Message(Vec::new()).encode()).unwrap();
        assert_eq!(frames, vec![Frame::Message(Vec::new())]);
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let f1 = Frame::Message(b"one".to_vec());
        let f2 = Frame::Message(b"two".to_vec());
        let f3 = Frame::Close { reason: 0 };

        let mut buf = Vec::new();
        buf.extend_from_slice(&f1.encode());
        buf.extend_from_slice(&f2.encode());
        buf.extend_from_slice(&f3.encode());

        let mut decoder = FrameDecoder::default();
        let frames = decoder.feed(&buf).unwrap();
        assert_eq!(frames, vec![f1, f2, f3]);
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let frame = Frame::Message(b"split across reads".to_vec());
        let encoded = frame.encode();
        let mut decoder = FrameDecoder::default();

        let mid = encoded.len() / 2;
        assert!(decoder.feed(&encoded[..mid]).unwrap().is_empty());
        assert!(decoder.has_partial());

        let frames = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(frames, vec![frame]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = Frame::Message(b"x".to_vec());
        let encoded = frame.encode();
        let mut decoder = FrameDecoder::default();

        for (i, byte) in encoded.iter().enumerate() {
            let frames = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert!(frames.is_empty());
            } else {
                assert_eq!(frames, vec![frame.clone()]);
            }
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.feed(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected_before_payload_arrives() {
        let mut decoder = FrameDecoder::new(8);
        let length: u32 = 10; // 9 payload bytes + type byte
        assert!(decoder.feed(&length.to_le_bytes()).is_err());
    }

    #[test]
    fn test_frame_at_size_limit_accepted() {
        let mut decoder = FrameDecoder::new(8);
        let frames = decoder.feed(&Frame::Message(vec![7; 8]).encode()).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let mut decoder = FrameDecoder::default();
        let buf = [5, 0, 0, 0, 0xFF, b't', b'e', b's', b't'];
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_short_close_frame_rejected() {
        let mut decoder = FrameDecoder::default();
        let buf = [3, 0, 0, 0, frame_type::CLOSE, 1, 2];
        assert!(decoder.feed(&buf).is_err());
    }
}
