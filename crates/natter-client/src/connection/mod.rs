// Connection lifecycle state machine and the public send API.
mod consumer;
mod handshake;
mod resources;
mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use natter_wire::{Command, ProtocolOp, ServerInfo};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use self::consumer::Outcome;
use self::resources::ActiveConnection;
use self::writer::WriteGate;
use crate::config::ConnectionConfig;
use crate::counters::ConnectionStats;
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, Result};
use crate::events::{ConnectionState, DisconnectReason, LifecycleEvent};

/// A client connection to one of the configured servers.
///
/// Lifecycle transitions (`connect`, `disconnect`, failure-driven teardown)
/// are serialized by one lock; a request that arrives after the state has
/// already moved past it is a no-op. Sends are serialized by the write gate
/// and fail with `NotConnected` outside the `Connected` state.
///
/// The `*_blocking` send variants drive the same futures on the runtime the
/// connection was established on. They are for threads outside the runtime
/// and fail with `BlockingInRuntime` when called from inside it.
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    // Transition lock; owns the resources of the live connection.
    transition: Mutex<Option<ActiveConnection>>,
    // Lock-free views of the live connection for senders and accessors.
    writer: ArcSwapOption<WriteGate>,
    server_info: ArcSwapOption<ServerInfo>,
    disposed: AtomicBool,
    // Bumped on every connect attempt; consumer completions carry the value
    // they were started with.
    epoch: AtomicU64,
    events: Dispatcher<LifecycleEvent>,
    ops: Dispatcher<ProtocolOp>,
    stats: Arc<ConnectionStats>,
    span: Span,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let span = info_span!("natter_connection", client_id = %config.client_id);
        Self::with_span(config, span)
    }

    pub fn with_span(config: ConnectionConfig, span: Span) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                transition: Mutex::new(None),
                writer: ArcSwapOption::empty(),
                server_info: ArcSwapOption::empty(),
                disposed: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                events: Dispatcher::new("events"),
                ops: Dispatcher::new("ops"),
                stats: Arc::new(ConnectionStats::default()),
                span,
            }),
        }
    }

    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let config = ConnectionConfig::from_env_or_yaml(config_path).map_err(ClientError::Config)?;
        Ok(Self::new(config))
    }

    /// Client id used to scope subscription ids on the wire.
    pub fn id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Capabilities of the server currently connected to.
    pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.inner.server_info.load_full()
    }

    /// Largest frame the write gate accepts on the current connection.
    pub fn max_payload(&self) -> Option<usize> {
        self.inner.writer.load_full().map(|gate| gate.max_payload())
    }

    pub fn events(&self) -> &Dispatcher<LifecycleEvent> {
        &self.inner.events
    }

    pub fn ops(&self) -> &Dispatcher<ProtocolOp> {
        &self.inner.ops
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.inner.stats
    }

    pub async fn connect(&self) -> Result<()> {
        let span = self.inner.span.clone();
        self.inner.connect().instrument(span).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.ensure_not_disposed()?;
        let span = self.inner.span.clone();
        self.inner
            .disconnect_with(DisconnectReason::RequestedByCaller, None)
            .instrument(span)
            .await;
        Ok(())
    }

    /// Disconnects and disposes the connection. Observers are dropped and
    /// every later operation fails with `Disposed`.
    pub async fn close(&self) {
        let span = self.inner.span.clone();
        self.inner.close().instrument(span).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(Command::Ping).await
    }

    pub async fn pong(&self) -> Result<()> {
        self.send(Command::Pong).await
    }

    pub async fn publish(&self, subject: &str, payload: &[u8], reply_to: Option<&str>) -> Result<()> {
        self.send(Command::Publish {
            subject,
            reply_to,
            payload,
        })
        .await
    }

    pub async fn subscribe(
        &self,
        subject: &str,
        subscription_id: &str,
        queue_group: Option<&str>,
    ) -> Result<()> {
        self.send(self.subscribe_command(subject, subscription_id, queue_group))
            .await
    }

    pub async fn unsubscribe(&self, subscription_id: &str, max_messages: Option<u32>) -> Result<()> {
        self.send(self.unsubscribe_command(subscription_id, max_messages))
            .await
    }

    pub fn ping_blocking(&self) -> Result<()> {
        self.send_blocking(Command::Ping)
    }

    pub fn pong_blocking(&self) -> Result<()> {
        self.send_blocking(Command::Pong)
    }

    pub fn publish_blocking(&self, subject: &str, payload: &[u8], reply_to: Option<&str>) -> Result<()> {
        self.send_blocking(Command::Publish {
            subject,
            reply_to,
            payload,
        })
    }

    pub fn subscribe_blocking(
        &self,
        subject: &str,
        subscription_id: &str,
        queue_group: Option<&str>,
    ) -> Result<()> {
        self.send_blocking(self.subscribe_command(subject, subscription_id, queue_group))
    }

    pub fn unsubscribe_blocking(&self, subscription_id: &str, max_messages: Option<u32>) -> Result<()> {
        self.send_blocking(self.unsubscribe_command(subscription_id, max_messages))
    }

    fn subscribe_command<'a>(
        &'a self,
        subject: &'a str,
        subscription_id: &'a str,
        queue_group: Option<&'a str>,
    ) -> Command<'a> {
        Command::Subscribe {
            subject,
            queue_group,
            subscription_id,
            client_id: self.id(),
        }
    }

    fn unsubscribe_command<'a>(
        &'a self,
        subscription_id: &'a str,
        max_messages: Option<u32>,
    ) -> Command<'a> {
        Command::Unsubscribe {
            subscription_id,
            client_id: self.id(),
            max_messages,
        }
    }

    async fn send(&self, command: Command<'_>) -> Result<()> {
        self.inner.gate()?.send(command).await
    }

    fn send_blocking(&self, command: Command<'_>) -> Result<()> {
        // `Handle::block_on` panics on threads that have entered the runtime.
        if Handle::try_current().is_ok() {
            return Err(ClientError::BlockingInRuntime);
        }
        let gate = self.inner.gate()?;
        gate.runtime().block_on(gate.send(command))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.writer.store(None);
        // Dropping the resources raises the cancel signal; a transition in
        // progress finds `disposed` set and its consumer exits once the
        // connection state is released.
        if let Ok(mut slot) = self.inner.transition.try_lock()
            && let Some(active) = slot.take()
        {
            debug!(host = %active.host, "connection dropped; cancelling consumer");
            drop(active);
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    fn gate(&self) -> Result<Arc<WriteGate>> {
        self.ensure_not_disposed()?;
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.writer.load_full().ok_or(ClientError::NotConnected)
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }
        let mut slot = self.transition.lock().await;
        self.ensure_not_disposed()?;
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        // Resets the state if this future is dropped mid-attempt.
        let mut attempt = ConnectingGuard { inner: self, armed: true };
        if let Some(stale) = slot.take() {
            debug!(host = %stale.host, "releasing stale connection resources");
            self.clear_views();
            stale.release(self.config.release_timeout).await;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let result = self.establish(epoch).await;
        attempt.armed = false;
        match result {
            Ok(active) => {
                info!(
                    host = %active.host,
                    server_id = %active.info.server_id,
                    max_payload = active.writer.max_payload(),
                    "connected"
                );
                self.writer.store(Some(Arc::clone(&active.writer)));
                self.server_info.store(Some(Arc::clone(&active.info)));
                *slot = Some(active);
                self.set_state(ConnectionState::Connected);
                drop(slot);
                self.events.dispatch(&LifecycleEvent::Connected);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(error = %err, "connect failed");
                Err(err)
            }
        }
    }

    /// Tears down the live connection if there is one.
    ///
    /// With `epoch` set, only the connection started with that epoch is torn
    /// down. Returns whether a teardown happened.
    async fn disconnect_with(&self, reason: DisconnectReason, epoch: Option<u64>) -> bool {
        // A consumer can finish before the connect that started it has
        // published `Connected`; those callers always wait for the lock.
        if epoch.is_none() && self.state() != ConnectionState::Connected {
            return false;
        }
        let mut slot = self.transition.lock().await;
        if self.state() != ConnectionState::Connected {
            return false;
        }
        if let Some(expected) = epoch
            && let Some(active) = slot.as_ref()
            && active.epoch != expected
        {
            debug!(expected, current = active.epoch, "ignoring teardown for a previous connection");
            return false;
        }

        let active = slot.take();
        self.clear_views();
        if let Some(active) = active {
            active.release(self.config.release_timeout).await;
        }
        self.set_state(ConnectionState::Disconnected);
        drop(slot);
        info!(reason = ?reason, "disconnected");
        self.events.dispatch(&LifecycleEvent::Disconnected(reason));
        true
    }

    async fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disconnect_with(DisconnectReason::RequestedByCaller, None)
            .await;

        // A connect that finished while the teardown above was deciding.
        let mut slot = self.transition.lock().await;
        if let Some(active) = slot.take() {
            self.clear_views();
            active.release(self.config.release_timeout).await;
            self.set_state(ConnectionState::Disconnected);
            drop(slot);
            self.events
                .dispatch(&LifecycleEvent::Disconnected(DisconnectReason::RequestedByCaller));
        } else {
            drop(slot);
        }

        self.events.clear();
        self.ops.clear();
        debug!("connection closed");
    }

    async fn on_consumer_completed(self: Arc<Self>, epoch: u64, outcome: anyhow::Result<Outcome>) {
        match outcome {
            Ok(Outcome::Cancelled) => debug!("consumer stopped"),
            Ok(Outcome::PeerClosed) => {
                info!("server closed the connection");
                self.disconnect_with(DisconnectReason::ConsumerFailure, Some(epoch))
                    .await;
            }
            Ok(Outcome::ServerError(err)) => {
                warn!(message = %err.message, "server reported an error");
                let torn_down = self
                    .disconnect_with(DisconnectReason::ConsumerFailure, Some(epoch))
                    .await;
                if torn_down || self.epoch.load(Ordering::Acquire) == epoch {
                    self.ops.dispatch(&ProtocolOp::Err(err));
                } else {
                    debug!(message = %err.message, "dropping error from a previous connection");
                }
            }
            Err(err) => {
                error!(error = ?err, "consumer loop failed");
                let torn_down = self
                    .disconnect_with(DisconnectReason::ConsumerFailure, Some(epoch))
                    .await;
                if torn_down || self.epoch.load(Ordering::Acquire) == epoch {
                    let failure = Arc::new(ClientError::ConsumerFault(err));
                    self.events.dispatch(&LifecycleEvent::Failed(failure));
                }
            }
        }
    }

    fn clear_views(&self) {
        self.writer.store(None);
        self.server_info.store(None);
    }
}

struct ConnectingGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }
}
