//! Newline-delimited JSON over any async byte stream pair.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use super::{closed, Transport};
use crate::error::{Result, TetherError};

/// Frames at most this many bytes per line; larger frames are a transport error.
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// One JSON document per line in each direction.
pub struct LineTransport<R, W> {
    reader: FramedRead<R, LinesCodec>,
    writer: Option<FramedWrite<W, LinesCodec>>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: Some(FramedWrite::new(
                writer,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
        }
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: serde_json::Value) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| closed("transport closed"))?;
        // serde_json never emits raw newlines, so one value is one line.
        let line = serde_json::to_string(&message)?;
        writer
            .send(line)
            .await
            .map_err(|e| TetherError::transport(format!("write failed: {e}")))
    }

    async fn receive(&mut self) -> Result<serde_json::Value> {
        loop {
            let line = match self.reader.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(TetherError::transport(format!("read failed: {e}"))),
                None => return Err(closed("peer closed the stream")),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // A line that is not JSON is still a frame; hand it up as a string
            // so the correlator can report it without tearing down the channel.
            return Ok(serde_json::from_str(line)
                .unwrap_or_else(|_| serde_json::Value::String(line.to_string())));
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            let _ = SinkExt::<String>::close(&mut writer).await;
        }
        Ok(())
    }
}
