// The socket-bound resources of one established connection.
use std::sync::Arc;
use std::time::Duration;

use natter_wire::ServerInfo;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::writer::WriteGate;
use crate::config::Host;

/// Everything that must be torn down together when a connection ends.
///
/// Replaced as a whole under the transition lock; never mutated in place.
pub(super) struct ActiveConnection {
    pub(super) epoch: u64,
    pub(super) host: Host,
    pub(super) info: Arc<ServerInfo>,
    pub(super) writer: Arc<WriteGate>,
    cancel_tx: watch::Sender<bool>,
    consumer: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    pub(super) fn new(
        epoch: u64,
        host: Host,
        info: Arc<ServerInfo>,
        writer: Arc<WriteGate>,
        cancel_tx: watch::Sender<bool>,
        consumer: JoinHandle<()>,
    ) -> Self {
        Self {
            epoch,
            host,
            info,
            writer,
            cancel_tx,
            consumer: Some(consumer),
        }
    }

    /// Tears everything down. Every step runs even if an earlier one failed.
    pub(super) async fn release(mut self, timeout: Duration) {
        // Stops the consumer loop and unblocks pending writes.
        self.cancel_tx.send_replace(true);

        match tokio::time::timeout(timeout, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(host = %self.host, error = %err, "write half shutdown failed"),
            Err(_) => debug!(host = %self.host, "write half shutdown timed out"),
        }

        if let Some(consumer) = self.consumer.take() {
            let abort = consumer.abort_handle();
            match tokio::time::timeout(timeout, consumer).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => warn!(host = %self.host, error = %err, "consumer task failed"),
                Err(_) => {
                    warn!(host = %self.host, "consumer did not stop in time; aborting");
                    abort.abort();
                }
            }
        }
        // The read half is owned by the consumer and closes with it; the
        // write half closes when the last `WriteGate` reference drops.
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.cancel_tx.send_replace(true);
    }
}
