//! Outbound JSON-lines sink.
//!
//! [`JsonLinesSink`] forwards every event seen on the bus tap to an async
//! writer as newline-delimited JSON, one [`Event`] per line.  The sink is
//! agnostic about the meaning of the events; it only serialises and writes.
//!
//! The sink owns a receiver, never a sender, so it finishes on its own once
//! every [`MapBus`](crate::bus::MapBus) clone has been dropped and the
//! remaining buffered events are written.

use gsm_types::{Event, GsmError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub struct JsonLinesSink {
    rx: broadcast::Receiver<Event>,
}

impl JsonLinesSink {
    /// Create a sink draining `rx`, usually obtained from
    /// [`MapBus::subscribe_all`](crate::bus::MapBus::subscribe_all).
    pub fn new(rx: broadcast::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Write events until the bus closes.  Returns the number of lines
    /// written.
    ///
    /// # Errors
    ///
    /// [`GsmError::Serialization`] if an event cannot be encoded and
    /// [`GsmError::Channel`] if the writer fails.
    pub async fn run<W>(mut self, mut writer: W) -> Result<u64, GsmError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let mut line = serde_json::to_vec(&event)
                        .map_err(|e| GsmError::Serialization(e.to_string()))?;
                    line.push(b'\n');
                    writer
                        .write_all(&line)
                        .await
                        .map_err(|e| GsmError::Channel(format!("sink write failed: {e}")))?;
                    writer
                        .flush()
                        .await
                        .map_err(|e| GsmError::Channel(format!("sink flush failed: {e}")))?;
                    written += 1;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "json sink lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(written, "bus closed; json sink finished");
                    return Ok(written);
                }
            }
        }
    }
}
