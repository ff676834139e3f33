// Background reader: turns socket bytes into ops and watches for dead peers.
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use anyhow::{Context, anyhow};
use bytes::BytesMut;
use futures::FutureExt;
use natter_wire::{Command, ErrOp, ProtocolOp, decode_op};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, Span, debug};

use super::Inner;
use super::writer::WriteGate;
use crate::config::ConsumerTuning;
use crate::counters::ConnectionStats;
use crate::dispatch::{Dispatcher, panic_message};
use crate::error::ClientError;

/// How a consumer loop ended without faulting.
#[derive(Debug)]
pub(super) enum Outcome {
    /// The connection was released.
    Cancelled,
    /// The server closed its side of the socket.
    PeerClosed,
    /// The server sent `-ERR`; ops after it were not processed.
    ServerError(ErrOp),
}

pub(super) struct Consumer {
    pub(super) inner: Weak<Inner>,
    pub(super) epoch: u64,
    pub(super) read: OwnedReadHalf,
    /// Bytes already read during the handshake but not yet decoded.
    pub(super) buffer: BytesMut,
    pub(super) writer: Arc<WriteGate>,
    pub(super) cancel: watch::Receiver<bool>,
    pub(super) ops: Dispatcher<ProtocolOp>,
    pub(super) stats: Arc<ConnectionStats>,
    pub(super) tuning: ConsumerTuning,
    pub(super) auto_pong: bool,
}

impl Consumer {
    pub(super) fn spawn(self, span: Span) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let inner = self.inner.clone();
                let epoch = self.epoch;
                let outcome = match AssertUnwindSafe(self.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(anyhow!("consumer panicked: {}", panic_message(panic.as_ref()))),
                };
                // Completion runs on its own task: it releases this connection,
                // which waits for this task to finish.
                if let Some(inner) = inner.upgrade() {
                    tokio::spawn(
                        inner
                            .on_consumer_completed(epoch, outcome)
                            .instrument(Span::current()),
                    );
                }
            }
            .instrument(span),
        )
    }

    async fn run(mut self) -> anyhow::Result<Outcome> {
        if let Some(outcome) = self.drain().await? {
            return Ok(outcome);
        }
        let mut idle_windows: u32 = 0;
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.wait_for(|cancelled| *cancelled) => return Ok(Outcome::Cancelled),
                read = timeout(self.tuning.spin_wait, self.read.read_buf(&mut self.buffer)) => read,
            };
            match read {
                Ok(Ok(0)) => return Ok(Outcome::PeerClosed),
                Ok(Ok(bytes)) => {
                    idle_windows = 0;
                    self.stats.record_bytes_in(bytes);
                    if let Some(outcome) = self.drain().await? {
                        return Ok(outcome);
                    }
                }
                Ok(Err(err)) => return Err(err).context("read from server"),
                Err(_) => {
                    idle_windows += 1;
                    if idle_windows >= self.tuning.idle_heartbeat_threshold {
                        // Probe for a half-open connection.
                        idle_windows = 0;
                        debug!("connection idle; sending PING");
                        if !self.send(Command::Ping).await? {
                            return Ok(Outcome::Cancelled);
                        }
                        continue;
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.wait_for(|cancelled| *cancelled) => return Ok(Outcome::Cancelled),
                        _ = sleep(self.tuning.idle_wait) => {}
                    }
                }
            }
        }
    }

    // Decodes and handles every complete frame in the buffer.
    async fn drain(&mut self) -> anyhow::Result<Option<Outcome>> {
        while let Some(op) = decode_op(&mut self.buffer).context("decode inbound frame")? {
            self.stats.record_op_received();
            match op {
                ProtocolOp::Err(err) => return Ok(Some(Outcome::ServerError(err))),
                ProtocolOp::Ping => {
                    if self.auto_pong && !self.send(Command::Pong).await? {
                        return Ok(Some(Outcome::Cancelled));
                    }
                    self.ops.dispatch(&ProtocolOp::Ping);
                }
                op => self.ops.dispatch(&op),
            }
        }
        Ok(None)
    }

    // Ok(false) when the write was cut short by release.
    async fn send(&self, command: Command<'_>) -> anyhow::Result<bool> {
        match self.writer.send(command).await {
            Ok(()) => Ok(true),
            Err(ClientError::Cancelled) => Ok(false),
            Err(err) => Err(anyhow::Error::new(err).context(format!("send {}", command.verb()))),
        }
    }
}
