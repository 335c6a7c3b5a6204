//! Length-prefixed framing for byte streams
//!
//! Frame = Length (u32, big-endian) + Payload

use bytes::{Buf, BufMut, Bytes, BytesMut};

use tether_core::{TetherError, TetherResult};

/// Length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum payload size accepted from a peer (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode one payload as a frame
pub fn encode_frame(payload: &[u8]) -> TetherResult<Bytes> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TetherError::Wire(format!(
            "frame of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse the length prefix of a frame
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> TetherResult<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TetherError::Wire(format!(
            "declared frame length {} exceeds maximum {}",
            len, MAX_FRAME_SIZE
        )));
    }
    Ok(len)
}

/// Incremental frame decoder for stream transports
///
/// Bytes are pushed as they arrive; complete frames are popped in order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buf: BytesMut::new(),
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if buffered
    pub fn next_frame(&mut self) -> TetherResult<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let len = decode_length(prefix)?;

        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            self.buf.reserve(LENGTH_PREFIX_SIZE + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes held for an incomplete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
