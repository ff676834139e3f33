// Single-writer gate for outbound frames.
use std::sync::Arc;

use natter_wire::Command;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tracing::trace;

use crate::counters::ConnectionStats;
use crate::error::{ClientError, Result};

/// Serializes every write against one socket.
///
/// The mutex around the write half is the write permit: whoever holds it
/// writes one whole frame and flushes before releasing it, so frames from
/// concurrent callers never interleave. Frames larger than the server's
/// `max_payload` are rejected before the permit is requested. A pending
/// write resolves with `Cancelled` as soon as the connection is released.
pub(crate) struct WriteGate {
    stream: Mutex<OwnedWriteHalf>,
    max_payload: usize,
    cancel: watch::Receiver<bool>,
    stats: Arc<ConnectionStats>,
    runtime: Handle,
}

impl WriteGate {
    pub(crate) fn new(
        stream: OwnedWriteHalf,
        max_payload: usize,
        cancel: watch::Receiver<bool>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            stream: Mutex::new(stream),
            max_payload,
            cancel,
            stats,
            runtime: Handle::current(),
        }
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Runtime the socket is registered with; blocking callers drive their
    /// writes on it.
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) async fn send(&self, command: Command<'_>) -> Result<()> {
        let frame = command.encode()?;
        if frame.len() > self.max_payload {
            return Err(ClientError::PayloadTooLarge {
                max: self.max_payload,
                actual: frame.len(),
            });
        }

        let mut cancel = self.cancel.clone();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => return Err(ClientError::Cancelled),
            stream = self.stream.lock() => stream,
        };
        let written = tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => return Err(ClientError::Cancelled),
            written = async {
                stream.write_all(&frame).await?;
                stream.flush().await
            } => written,
        };
        written?;

        self.stats.record_frame_out(frame.len());
        if matches!(command, Command::Ping) {
            self.stats.record_heartbeat();
        }
        trace!(verb = command.verb(), bytes = frame.len(), "frame written");
        Ok(())
    }

    /// Closes the write direction once any in-flight frame has finished.
    pub(crate) async fn shutdown(&self) -> std::io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.shutdown().await
    }
}
