//! Wire format for group transfers.
//!
//! Frames are bincode-encoded and sent with a 4-byte big-endian length prefix.
//! Chunk payloads are packed little-endian `f64` records.

use crate::error::{NetworkError, ProtocolError, Result};
use crate::types::{Rank, WireTag};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes per packed `f64`.
pub const VALUE_LEN: usize = std::mem::size_of::<f64>();

/// Bytes a [`Frame::Data`] adds to its payload: variant, source, tag and
/// payload length.
pub const DATA_FRAME_OVERHEAD: usize = 4 + 4 + 4 + 8;

/// Largest number of `width`-value records one data frame can carry.
pub fn max_records(width: usize) -> usize {
    (MAX_FRAME_LEN - DATA_FRAME_OVERHEAD) / (width.max(1) * VALUE_LEN)
}

/// Message exchanged between group endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on a new connection, identifying the connecting rank.
    Hello { rank: Rank, size: u32 },

    /// A point-to-point transfer.
    Data {
        source: Rank,
        tag: WireTag,
        payload: Vec<u8>,
    },
}

pub fn encode_frame(frame: &Frame) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(frame)
}

pub fn decode_frame(data: &[u8]) -> std::result::Result<Frame, bincode::Error> {
    bincode::deserialize(data)
}

/// Encode `frame` with its length prefix.
pub fn frame_message(frame: &Frame) -> Result<Vec<u8>> {
    let data = encode_frame(frame)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(NetworkError::SendFailed(format!(
            "frame of {} bytes exceeds {MAX_FRAME_LEN}",
            data.len()
        ))
        .into());
    }
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::ReceiveFailed(format!("frame of {len} bytes too large")).into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    Ok(Some(decode_frame(&data)?))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(frame)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Pack `values` into a chunk payload.
pub fn encode_values(values: &[f64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * VALUE_LEN);
    for v in values {
        buf.put_f64_le(*v);
    }
    buf.freeze()
}

/// Unpack a chunk payload of `width`-value records.
///
/// The record count is taken from the payload length and must not exceed
/// `capacity`.
pub fn decode_values(
    mut payload: Bytes,
    width: usize,
    capacity: usize,
) -> std::result::Result<Vec<f64>, ProtocolError> {
    let record = width * VALUE_LEN;
    if record == 0 || payload.len() % record != 0 {
        return Err(ProtocolError::MalformedChunk {
            len: payload.len(),
            record,
        });
    }
    let count = payload.len() / record;
    if count > capacity {
        return Err(ProtocolError::ChunkOverflow { count, capacity });
    }
    let mut values = Vec::with_capacity(count * width);
    while payload.has_remaining() {
        values.push(payload.get_f64_le());
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_stream() {
        let frame = Frame::Data {
            source: 2,
            tag: 3,
            payload: encode_values(&[1.0, -0.0]).to_vec(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        write_frame(&mut buf, &Frame::Hello { rank: 1, size: 4 })
            .await
            .unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(frame));
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Frame::Hello { rank: 1, size: 4 })
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&[0; 8]);
        let mut reader = data.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[test]
    fn test_largest_data_frame_fits() {
        let frame = |len: usize| Frame::Data {
            source: 1,
            tag: 1,
            payload: vec![0; len],
        };
        let fitting = MAX_FRAME_LEN - DATA_FRAME_OVERHEAD;
        assert_eq!(frame_message(&frame(fitting)).unwrap().len(), 4 + MAX_FRAME_LEN);
        assert!(frame_message(&frame(fitting + 1)).is_err());
        assert_eq!(max_records(13), fitting / 104);
    }

    #[test]
    fn test_values_preserve_sign_of_zero() {
        let decoded = decode_values(encode_values(&[-0.0, 2.5, 3.0]), 3, 1).unwrap();
        assert!(decoded[0].is_sign_negative());
        assert_eq!(&decoded[1..], &[2.5, 3.0]);
    }

    #[test]
    fn test_decode_rejects_partial_record() {
        let payload = encode_values(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            decode_values(payload, 3, 10),
            Err(ProtocolError::MalformedChunk { len: 32, record: 24 })
        );
    }

    #[test]
    fn test_decode_rejects_overflow() {
        let payload = encode_values(&[0.0; 6]);
        assert_eq!(
            decode_values(payload, 2, 2),
            Err(ProtocolError::ChunkOverflow {
                count: 3,
                capacity: 2
            })
        );
    }
}
