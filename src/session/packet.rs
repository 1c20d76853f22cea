//! Wire framing for the game protocol.
//!
//! The proxy treats the game protocol as a stream of typed frames:
//! `u32 length || u16 frame id || payload`. Only a handful of frame ids
//! are interpreted (see [`super::models`]); everything else passes
//! through as opaque payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length + id prefix before the payload
const HEADER_LENGTH: usize = 6;

/// Upper bound on a single frame payload. Anything larger is treated
/// as a protocol violation and kills the stream.
const MAX_FRAME_LENGTH: usize = 1024 * 1024 * 8;

/// A single game protocol frame.
///
/// Frames can be cloned with little memory usage increase because
/// the contents are stored as Bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame type id
    pub id: u16,
    /// The frame payload
    pub contents: Bytes,
}

impl Frame {
    /// Creates a new frame from the provided id and contents
    pub const fn new(id: u16, contents: Bytes) -> Self {
        Self { id, contents }
    }

    /// Creates a new frame with empty contents
    #[inline]
    pub const fn new_empty(id: u16) -> Self {
        Self::new(id, Bytes::new())
    }

    /// Attempts to read a whole frame from `src`, returning None when
    /// more bytes are needed
    pub fn read(src: &mut BytesMut) -> io::Result<Option<Self>> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let mut peek = &src[..];
        let length = peek.get_u32() as usize;
        let id = peek.get_u16();

        if length > MAX_FRAME_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds the frame limit", length),
            ));
        }

        if src.len() < HEADER_LENGTH + length {
            return Ok(None);
        }

        src.advance(HEADER_LENGTH);
        let contents = src.split_to(length).freeze();
        Ok(Some(Self { id, contents }))
    }

    /// Writes this frame to the provided buffer
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u32(self.contents.len() as u32);
        dst.put_u16(self.id);
        dst.extend_from_slice(&self.contents);
    }
}

/// Tokio codec for encoding and decoding frames
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Error = io::Error;
    type Item = Frame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Frame::read(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(dst);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Frames survive an encode and decode cycle
    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::new(0x42, Bytes::from_static(b"payload bytes"));

        let mut buf = BytesMut::new();
        frame.write(&mut buf);
        let decoded = Frame::read(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.id, frame.id);
        assert_eq!(decoded.contents, frame.contents);
        assert!(buf.is_empty());
    }

    /// Partial frames wait for more bytes
    #[test]
    fn test_partial_frame() {
        let frame = Frame::new(0x42, Bytes::from_static(b"payload bytes"));
        let mut buf = BytesMut::new();
        frame.write(&mut buf);

        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(Frame::read(&mut partial).unwrap().is_none());
        // The partial buffer must be left untouched for the next read
        assert_eq!(partial.len(), buf.len() - 1);
    }

    /// Oversized length prefixes are a protocol violation
    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u16(0x1);

        assert!(Frame::read(&mut buf).is_err());
    }

    /// Multiple frames in one buffer decode in order
    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        Frame::new(1, Bytes::from_static(b"one")).write(&mut buf);
        Frame::new(2, Bytes::from_static(b"two")).write(&mut buf);

        let first = Frame::read(&mut buf).unwrap().unwrap();
        let second = Frame::read(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
    }
}
