//! Line-framed session transport.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::message::Frame;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tracing::trace;

/// A persistent bidirectional stream carrying one [`Frame`] per line.
///
/// Reads are bounded by a maximum frame length and an idle timeout; either
/// limit being hit is a transport error and ends the session.
pub struct FramedStream<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    max_frame_len: usize,
    idle_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite> FramedStream<S> {
    /// Wrap a connected stream.
    #[must_use]
    pub fn new(stream: S, config: &SessionConfig) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer,
            max_frame_len: config.max_frame_len,
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the write fails or stalls past the idle timeout.
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut line = frame.encode()?;
        line.push('\n');
        trace!("-> {}", frame.kind());

        let write = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        };
        match tokio::time::timeout(self.idle_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Transport(format!("write failed: {e}"))),
            Err(_) => Err(Error::Transport("write timed out".to_string())),
        }
    }

    /// Receive the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on a closed connection, an oversized
    /// frame or the idle timeout, and a decode error for an invalid frame.
    pub async fn recv(&mut self) -> Result<Frame> {
        let limit = self.max_frame_len as u64 + 1;
        let mut line = String::new();
        let mut limited = (&mut self.reader).take(limit);
        let read = limited.read_line(&mut line);

        let n = match tokio::time::timeout(self.idle_timeout, read).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::Transport(format!("read failed: {e}"))),
            Err(_) => {
                return Err(Error::Transport(format!(
                    "no frame received within {}s",
                    self.idle_timeout.as_secs()
                )))
            }
        };
        if n == 0 {
            return Err(Error::Transport("connection closed by peer".to_string()));
        }
        if !line.ends_with('\n') {
            if line.len() > self.max_frame_len {
                return Err(Error::Transport(format!(
                    "frame exceeds {} bytes",
                    self.max_frame_len
                )));
            }
            return Err(Error::Transport("connection closed mid-frame".to_string()));
        }

        let frame = Frame::decode(&line)?;
        trace!("<- {}", frame.kind());
        Ok(frame)
    }

    /// Flush and close the write side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the shutdown fails.
    pub async fn close(&mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| Error::Transport(format!("shutdown failed: {e}")))
    }
}
