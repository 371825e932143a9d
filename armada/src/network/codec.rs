//! Frame codec for the node transport.

use super::error::NetworkError;
use super::packet::Packet;
use super::wire;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default frame limit. Chunked transfer keeps individual frames below the
/// 50 MiB payload budget; the limit leaves headroom for frame headers.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Encodes and decodes [`Packet`] frames:
/// `[varInt length][varInt channelId][varInt packetUniqueId][payload]`.
pub struct PacketCodec {
    max_frame_size: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = NetworkError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = wire::var_u64_len(packet.channel as u64)
            + wire::var_u64_len(packet.packet_id)
            + packet.payload.len();
        if body_len > self.max_frame_size {
            return Err(NetworkError::FrameTooLarge {
                size: body_len,
                limit: self.max_frame_size,
            });
        }

        dst.reserve(wire::var_u64_len(body_len as u64) + body_len);
        wire::put_var_u64(dst, body_len as u64);
        wire::put_var_u64(dst, packet.channel as u64);
        wire::put_var_u64(dst, packet.packet_id);
        dst.extend_from_slice(&packet.payload);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Peek the length prefix without consuming so partial frames keep
        // accumulating.
        let mut peek = &src[..];
        let body_len = match wire::get_var_u64(&mut peek) {
            Ok(len) => len as usize,
            Err(_) => return Ok(None),
        };
        if body_len > self.max_frame_size {
            return Err(NetworkError::FrameTooLarge {
                size: body_len,
                limit: self.max_frame_size,
            });
        }

        let prefix_len = src.len() - peek.len();
        if src.len() < prefix_len + body_len {
            src.reserve(prefix_len + body_len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let mut body = src.split_to(body_len);
        let channel = wire::get_var_u64(&mut body)? as u32;
        let packet_id = wire::get_var_u64(&mut body)?;
        Ok(Some(Packet::with_id(channel, packet_id, body.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::channels;
    use bytes::Bytes;

    #[test]
    fn test_roundtrip() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();

        let packet = Packet::with_id(channels::CHANNEL_MESSAGE, 42, Bytes::from_static(b"hello"));
        codec.encode(packet, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.channel, channels::CHANNEL_MESSAGE);
        assert_eq!(decoded.packet_id, 42);
        assert_eq!(&decoded.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Packet::new(channels::AUTH, Bytes::from_static(b"payload-bytes")),
                &mut buf,
            )
            .unwrap();

        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..full.len() - 4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 4..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        for i in 0..3u32 {
            codec
                .encode(Packet::new(i, Bytes::from(vec![i as u8; 8])), &mut buf)
                .unwrap();
        }

        for i in 0..3u32 {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.channel, i);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PacketCodec::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        let result = codec.encode(
            Packet::new(channels::CHUNK, Bytes::from(vec![0u8; 64])),
            &mut buf,
        );
        assert!(matches!(result, Err(NetworkError::FrameTooLarge { .. })));
    }
}
