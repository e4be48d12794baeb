//! Codec for encoding/decoding tunnel messages

use crate::messages::TunnelMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Tunnel message codec
///
/// Frame format: `[length: u32 big endian][payload: bincode serialized message]`
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Encode a tunnel message to bytes
    pub fn encode_message(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::write_message(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    fn write_message(msg: &TunnelMessage, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode a tunnel message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed.
    pub fn decode_message(buf: &mut BytesMut) -> Result<Option<TunnelMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let msg_bytes = buf.split_to(length);
        let msg: TunnelMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

impl Decoder for TunnelCodec {
    type Item = TunnelMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_message(src)
    }
}

impl Encoder<TunnelMessage> for TunnelCodec {
    type Error = CodecError;

    fn encode(&mut self, item: TunnelMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::write_message(&item, dst)
    }
}
