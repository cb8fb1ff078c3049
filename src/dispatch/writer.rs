//! Dispatcher that writes newline-delimited JSON
//!
//! Each dispatch becomes one line:
//!
//! ```text
//! {"locator":"sensorA","destinations":["alice"],"data":{"value":42}}
//! ```

use bytes::{BufMut, BytesMut};
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::registry::{DestinationId, SourceLocator, UpdateData};

use super::Dispatcher;

/// Writes every dispatch as a JSON line to an async writer (file, socket, pipe)
pub struct WriterDispatcher<W> {
    writer: Mutex<W>,
}

impl<W> WriterDispatcher<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn encode(
        locator: &SourceLocator,
        data: &UpdateData,
        destinations: &[DestinationId],
    ) -> Result<BytesMut> {
        let destinations: Vec<&str> = destinations.iter().map(DestinationId::as_str).collect();
        let line = json!({
            "locator": locator.as_str(),
            "destinations": destinations,
            "data": data.fields(),
        });

        let mut buf = BytesMut::with_capacity(128).writer();
        serde_json::to_writer(&mut buf, &line)?;
        let mut buf = buf.into_inner();
        buf.put_u8(b'\n');
        Ok(buf)
    }
}

impl<W> Dispatcher for WriterDispatcher<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn notify(
        &self,
        locator: &SourceLocator,
        data: &UpdateData,
        destinations: &[DestinationId],
    ) -> Result<()> {
        let line = Self::encode(locator, data, destinations)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}
