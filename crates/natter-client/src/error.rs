// Error taxonomy surfaced by the client.
use crate::config::Host;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("connection has been closed")]
    Disposed,
    #[error("not connected")]
    NotConnected,
    #[error("no connection could be made to any configured host")]
    NoConnectionCouldBeMade {
        #[source]
        source: Option<Box<ClientError>>,
    },
    #[error("server {host} requires credentials but none are configured")]
    AuthRequiredButMissing { host: Host },
    #[error("frame of {actual} bytes exceeds server max payload of {max} bytes")]
    PayloadTooLarge { max: usize, actual: usize },
    #[error("consumer loop failed: {0:#}")]
    ConsumerFault(anyhow::Error),
    #[error("write cancelled by disconnect")]
    Cancelled,
    #[error("blocking send called from inside the tokio runtime")]
    BlockingInRuntime,
    #[error("socket error")]
    Io(#[from] std::io::Error),
    #[error("protocol error")]
    Wire(#[from] natter_wire::Error),
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
}
