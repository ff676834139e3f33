// Socket acquisition and the INFO/CONNECT exchange, one candidate host at a time.
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use natter_wire::{Command, ConnectOptions, ProtocolOp, decode_op};
use rand::seq::SliceRandom;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use super::Inner;
use super::consumer::Consumer;
use super::resources::ActiveConnection;
use super::writer::WriteGate;
use crate::config::{HandshakeTuning, Host};
use crate::error::{ClientError, Result};

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

impl Inner {
    /// Walks the candidate hosts until one completes the handshake.
    pub(super) async fn establish(self: &Arc<Self>, epoch: u64) -> Result<ActiveConnection> {
        let mut hosts = self.config.hosts.clone();
        if self.config.randomize_hosts {
            hosts.shuffle(&mut rand::thread_rng());
        }

        let mut last_error: Option<ClientError> = None;
        for host in &hosts {
            match self.try_host(host, epoch).await {
                Ok(Some(active)) => return Ok(active),
                Ok(None) => {}
                // A configuration problem; other hosts would answer the same.
                Err(err @ ClientError::AuthRequiredButMissing { .. }) => return Err(err),
                Err(err) => {
                    warn!(host = %host, error = %err, "connection attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(ClientError::NoConnectionCouldBeMade {
            source: last_error.map(Box::new),
        })
    }

    async fn try_host(self: &Arc<Self>, host: &Host, epoch: u64) -> Result<Option<ActiveConnection>> {
        let tuning = self.config.handshake;
        debug!(host = %host, "opening socket");
        let stream = open_socket(host, &tuning).await?;
        let (mut read, write) = stream.into_split();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

        let Some(first) = read_first_op(&mut read, &mut buffer, &tuning).await? else {
            warn!(host = %host, "no handshake frame received; trying next host");
            return Ok(None);
        };
        self.stats.record_op_received();
        let ProtocolOp::Info(info_op) = first else {
            warn!(host = %host, op = first.name(), "first frame was not INFO; trying next host");
            return Ok(None);
        };

        let info = info_op.server_info();
        if info.auth_required && self.config.credentials.is_none() {
            return Err(ClientError::AuthRequiredButMissing { host: host.clone() });
        }
        self.ops.dispatch(&ProtocolOp::Info(info_op));

        let max_payload = usize::try_from(info.max_payload)
            .ok()
            .filter(|max| *max > 0)
            .unwrap_or(self.config.default_max_payload);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let writer = Arc::new(WriteGate::new(
            write,
            max_payload,
            cancel_rx.clone(),
            Arc::clone(&self.stats),
        ));
        writer.send(Command::Connect(&self.connect_options())).await?;

        let consumer = Consumer {
            inner: Arc::downgrade(self),
            epoch,
            read,
            buffer,
            writer: Arc::clone(&writer),
            cancel: cancel_rx,
            ops: self.ops.clone(),
            stats: Arc::clone(&self.stats),
            tuning: self.config.consumer,
            auto_pong: self.config.auto_respond_to_ping,
        }
        .spawn(self.span.clone());

        Ok(Some(ActiveConnection::new(
            epoch,
            host.clone(),
            Arc::new(info),
            writer,
            cancel_tx,
            consumer,
        )))
    }

    fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new(self.config.name.clone());
        options.verbose = self.config.verbose;
        if let Some(credentials) = &self.config.credentials {
            options.user = Some(credentials.user.clone());
            options.pass = Some(credentials.pass.clone());
        }
        options
    }
}

async fn open_socket(host: &Host, tuning: &HandshakeTuning) -> Result<TcpStream> {
    let connect = TcpStream::connect((host.address.as_str(), host.port));
    let stream = timeout(tuning.connect_timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {host} timed out")))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Reads until one whole frame is buffered, retrying in `cycle_delay` slices
/// for at most `max_duration`. `None` means the peer stayed silent or hung up.
async fn read_first_op(
    read: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    tuning: &HandshakeTuning,
) -> Result<Option<ProtocolOp>> {
    let deadline = Instant::now() + tuning.max_duration;
    loop {
        if let Some(op) = decode_op(buffer)? {
            return Ok(Some(op));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let window = tuning.cycle_delay.min(deadline - now);
        match timeout(window, read.read_buf(buffer)).await {
            Ok(Ok(0)) => return Ok(None),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {}
        }
    }
}
