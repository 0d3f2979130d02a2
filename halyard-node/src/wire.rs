//! Framing for the TCP peer transport.
//!
//! Each frame is `[u32 len][u32 crc32][bincode body]`, little-endian, where
//! `len` counts the body only.

use halyard_core::{NodeId, PeerRequest, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HEADER_LEN: usize = 8;
/// Snapshots travel in one frame, so the ceiling is generous.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// A request as it travels between processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub request: PeerRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("frame checksum mismatch")]
    Checksum,
}

impl From<WireError> for StoreError {
    fn from(err: WireError) -> Self {
        StoreError::Transport(err.to_string())
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream before a header.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    if crc32fast::hash(&body) != crc {
        return Err(WireError::Checksum);
    }
    Ok(Some(bincode::deserialize(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_core::PeerResponse;

    #[tokio::test]
    async fn frames_roundtrip_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let env = Envelope {
            from: "node_0".into(),
            request: PeerRequest::Relinquish {
                epoch: 7,
                holder: "node_0".into(),
            },
        };
        write_frame(&mut a, &env).await.unwrap();
        write_frame(&mut a, &PeerResponse::Relinquished).await.unwrap();
        drop(a);

        let got: Envelope = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, env);
        let resp: PeerResponse = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(resp, PeerResponse::Relinquished);
        assert!(read_frame::<_, PeerResponse>(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_body_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = bincode::serialize(&PeerResponse::Relinquished).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).wrapping_add(1).to_le_bytes());
        frame.extend_from_slice(&body);
        a.write_all(&frame).await.unwrap();

        let err = read_frame::<_, PeerResponse>(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::Checksum));
    }
}
