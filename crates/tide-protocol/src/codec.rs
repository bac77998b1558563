use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Frame, MAX_MESSAGE_SIZE};

/// Codec for encoding/decoding Tide protocol frames.
pub struct TideCodec;

impl TideCodec {
    /// Encode a frame: [4 bytes len][1 byte tag][payload]
    pub fn encode(frame: &Frame) -> ProtocolResult<Bytes> {
        let payload =
            bincode::serialize(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = BytesMut::with_capacity(4 + 1 + payload.len());
        buf.put_u32(len);
        buf.put_u8(frame.message.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a framed message. Returns (frame, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(Frame, usize)> {
        if data.len() < 5 {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        Self::check_len(len, MAX_MESSAGE_SIZE)?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let frame = Self::decode_body(data[4], &data[5..total])?;
        Ok((frame, total))
    }

    fn check_len(len: usize, max: usize) -> ProtocolResult<()> {
        if len < 1 {
            return Err(ProtocolError::FramingError("zero-length frame".into()));
        }
        if len - 1 > max {
            return Err(ProtocolError::MessageTooLarge { size: len - 1, max });
        }
        Ok(())
    }

    fn decode_body(tag: u8, payload: &[u8]) -> ProtocolResult<Frame> {
        let frame: Frame = bincode::deserialize(payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if frame.message.type_tag() != tag {
            return Err(ProtocolError::FramingError(format!(
                "tag {tag} does not match {} ({})",
                frame.message.type_name(),
                frame.message.type_tag()
            )));
        }
        Ok(frame)
    }

    /// Read one frame from a stream.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary; an
    /// end of stream inside a frame is an error.
    pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        Self::read_frame_limited(reader, MAX_MESSAGE_SIZE).await
    }

    /// Like [`read_frame`](Self::read_frame), but refuses any frame whose
    /// payload exceeds `max` bytes before allocating for it.
    pub async fn read_frame_limited<R>(
        reader: &mut R,
        max: usize,
    ) -> ProtocolResult<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        Self::check_len(len, max.min(MAX_MESSAGE_SIZE))?;

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::ConnectionClosed
            } else {
                ProtocolError::Io(e)
            }
        })?;
        Self::decode_body(body[0], &body[1..]).map(Some)
    }

    /// Write one frame and flush it.
    pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = Self::encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}
