// Lifecycle vocabulary shared by the state machine and the event sink.
use std::fmt;
use std::sync::Arc;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    RequestedByCaller,
    ConsumerFailure,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Connected,
    Disconnected(DisconnectReason),
    /// The background reader faulted; the connection has already been torn down.
    Failed(Arc<ClientError>),
}
