//! RPC wire frames.
//!
//! A frame is an 8-byte big-endian length followed by a JSON body. JSON keeps
//! the protocol self-describing and language independent; the length prefix
//! lets a reader take exactly one message off the stream. Frames above
//! [`MAX_FRAME_LEN`] are refused on both sides.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CResult, Error};

/// Upper bound on a single RPC frame. Custody payloads are tiny (the largest
/// is a full record listing); anything bigger is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encodes a value into a length-prefixed frame.
pub fn encode<T>(value: &T) -> CResult<Vec<u8>>
where
    T: ?Sized + Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", body.len())));
    }
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u64(body.len() as u64);
    buf.put(body.as_slice());
    Ok(buf.to_vec())
}

/// Decodes the body of a frame (the bytes after the length prefix).
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> CResult<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Writes one frame to the stream and flushes it.
pub async fn write_frame<S, T>(stream: &mut S, value: &T) -> CResult<()>
where
    S: AsyncWrite + Unpin,
    T: ?Sized + Serialize,
{
    let frame = encode(value)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|err| Error::Protocol(err.to_string()))?;
    stream.flush().await.map_err(|err| Error::Protocol(err.to_string()))?;
    Ok(())
}

/// Reads exactly one frame off the stream.
pub async fn read_frame<S, T>(stream: &mut S) -> CResult<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 8];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|err| Error::Protocol(err.to_string()))?;
    let len = u64::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|err| Error::Protocol(err.to_string()))?;
    decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        count: i64,
    }

    #[test]
    fn round_trip() -> CResult<()> {
        let probe = Probe { name: "disk".to_string(), count: 3 };
        let frame = encode(&probe)?;

        // 8-byte big-endian prefix holds the body length.
        let len = u64::from_be_bytes(frame[..8].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 8);

        let back: Probe = decode(&frame[8..])?;
        assert_eq!(probe, back);
        Ok(())
    }

    #[tokio::test]
    async fn stream_round_trip() -> CResult<()> {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let probe = Probe { name: "disk".to_string(), count: 3 };
        write_frame(&mut a, &probe).await?;
        let back: Probe = read_frame(&mut b).await?;
        assert_eq!(probe, back);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Hand-craft a header that claims a body bigger than the limit.
        let len = (MAX_FRAME_LEN as u64 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        let got: CResult<Probe> = read_frame(&mut b).await;
        assert!(matches!(got, Err(Error::Protocol(_))));
    }
}
