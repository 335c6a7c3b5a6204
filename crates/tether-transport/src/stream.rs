//! Framed byte streams (pipes, sockets)

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tether_core::{TetherError, TetherResult};
use tether_wire::{encode_frame, FrameDecoder};

use crate::FrameHandler;

const READ_CHUNK: usize = 8 * 1024;

/// Reads length-prefixed frames from a byte stream
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Next complete frame; `None` on a clean end of stream
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.decoder.next_frame().map_err(invalid_data)? {
                return Ok(Some(frame.to_vec()));
            }

            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a frame",
                    ));
                }
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(payload).map_err(invalid_data)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid_data(e: TetherError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Serve frames from `reader`, writing replies to `writer`
///
/// Each frame is handled on its own task so a slow operation does not hold
/// up the ones behind it. Returns when the input ends.
pub async fn serve_stream<R, W, H>(reader: R, writer: W, handler: Arc<H>) -> TetherResult<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
    H: FrameHandler + ?Sized,
{
    let writer = Arc::new(Mutex::new(writer));
    let mut frames = FrameReader::new(reader);

    loop {
        let frame = match frames.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("input closed");
                return Ok(());
            }
            Err(e) => return Err(TetherError::Wire(e.to_string())),
        };

        let handler = Arc::clone(&handler);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let Some(reply) = handler.handle_frame(frame).await else {
                return;
            };
            let mut writer = writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &reply).await {
                warn!(error = %e, "failed to write reply");
            }
        });
    }
}
