//! The post-handshake wire framing: `u64 token || u32 length || length
//! bytes of UTF-8 JSON`, identical in both directions. All integers are
//! little-endian.
//!
//! Grounded on the teacher's `cmap/conn/wire/header.rs`, which reads and
//! writes its own (differently shaped) fixed header the same way: plain
//! `AsyncRead`/`AsyncWrite` extension methods, no intermediate buffering.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Default cap on an incoming frame's payload length. Exceeding it is a
/// protocol violation rather than an allocation the driver will attempt.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A single length-prefixed wire frame: a 64-bit token identifying the
/// query this frame belongs to, and its raw JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(token: u64, payload: Vec<u8>) -> Self {
        Self { token, payload }
    }

    /// Writes this frame to `writer` as `token || len || payload`.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let len: u32 = self
            .payload
            .len()
            .try_into()
            .map_err(|_| Error::protocol("frame payload exceeds u32::MAX"))?;
        writer.write_u64_le(self.token).await?;
        writer.write_u32_le(len).await?;
        writer.write_all(&self.payload).await?;
        Ok(())
    }

    /// Reads a single frame from `reader`, rejecting any payload longer
    /// than `max_len`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, max_len: u32) -> Result<Self> {
        let token = reader.read_u64_le().await?;
        let len = reader.read_u32_le().await?;
        if len > max_len {
            return Err(Error::protocol(format!(
                "frame length {} exceeds maximum of {}",
                len, max_len
            )));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        Ok(Frame { token, payload })
    }
}
