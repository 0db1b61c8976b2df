//! Tokio codec for link frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, FrameKind, MAX_PAYLOAD_SIZE};

/// A complete link frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    /// Identity hash declared by the initiator
    Identify(Bytes),
    /// One encoded protocol packet
    Packet(Bytes),
    /// RTT probe carrying the sender's timestamp in microseconds
    Ping(u64),
    /// Echo of a `Ping` timestamp
    Pong(u64),
    /// Orderly close
    Close,
}

impl LinkFrame {
    fn kind(&self) -> FrameKind {
        match self {
            LinkFrame::Identify(_) => FrameKind::Identify,
            LinkFrame::Packet(_) => FrameKind::Packet,
            LinkFrame::Ping(_) => FrameKind::Ping,
            LinkFrame::Pong(_) => FrameKind::Pong,
            LinkFrame::Close => FrameKind::Close,
        }
    }
}

/// Codec for encoding/decoding link frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

fn timestamp(kind: FrameKind, mut payload: Bytes) -> Result<u64, ProtocolError> {
    if payload.len() != 8 {
        tracing::debug!("{:?} frame with {} byte payload", kind, payload.len());
        return Err(ProtocolError::Truncated {
            expected: 8,
            actual: payload.len(),
        });
    }
    Ok(payload.get_u64())
}

impl Decoder for FrameCodec {
    type Item = LinkFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            // Save header and wait for more data
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        let frame = match header.kind {
            FrameKind::Identify => LinkFrame::Identify(payload),
            FrameKind::Packet => LinkFrame::Packet(payload),
            FrameKind::Ping => LinkFrame::Ping(timestamp(header.kind, payload)?),
            FrameKind::Pong => LinkFrame::Pong(timestamp(header.kind, payload)?),
            FrameKind::Close => LinkFrame::Close,
        };

        Ok(Some(frame))
    }
}

impl Encoder<LinkFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: LinkFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = frame.kind();
        let mut payload = BytesMut::new();
        match frame {
            LinkFrame::Identify(bytes) | LinkFrame::Packet(bytes) => {
                payload.extend_from_slice(&bytes)
            }
            LinkFrame::Ping(ts) | LinkFrame::Pong(ts) => payload.put_u64(ts),
            LinkFrame::Close => {}
        }

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(kind, payload.len() as u32).encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;

    #[test]
    fn test_codec_packet_frame() {
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::new();
        codec
            .encode(LinkFrame::Packet(Bytes::from_static(b"Hello, world!")), &mut buf)
            .unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, LinkFrame::Packet(Bytes::from_static(b"Hello, world!")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let mut full_buf = BytesMut::new();
        codec.encode(LinkFrame::Ping(12345), &mut full_buf).unwrap();

        // Split the buffer to simulate partial read
        let mut partial = full_buf.split_to(HEADER_SIZE + 3);

        // Should return None (need more data)
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Add the rest
        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, LinkFrame::Ping(12345));
    }

    #[test]
    fn test_codec_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(LinkFrame::Identify(Bytes::from_static(&[0xAB; 16])), &mut buf)
            .unwrap();
        codec.encode(LinkFrame::Close, &mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(LinkFrame::Identify(id)) if id.len() == 16
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(LinkFrame::Close));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_short_ping_is_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        FrameHeader::new(FrameKind::Ping, 2).encode(&mut buf);
        buf.extend_from_slice(&[0, 1]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Truncated { expected: 8, actual: 2 })
        ));
    }
}
