// Connection and protocol engine for the natter pub/sub client.
//
// A `Connection` picks one of the configured servers, performs the INFO/CONNECT
// handshake, and runs a background consumer that decodes inbound frames and
// hands them to the op sink. Outbound frames go through a single write gate.
pub mod config;
pub mod connection;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod observability;

pub use config::{ConnectionConfig, ConsumerTuning, Credentials, HandshakeTuning, Host};
pub use connection::Connection;
pub use counters::{ConnectionStats, StatsSnapshot};
pub use dispatch::{Dispatcher, ObserverHandle};
pub use error::{ClientError, Result};
pub use events::{ConnectionState, DisconnectReason, LifecycleEvent};
pub use natter_wire::{ErrOp, InfoOp, MsgOp, ProtocolOp, ServerInfo};
