// Text wire format for the natter pub/sub protocol.
//
// Every frame is an ASCII control line terminated by CRLF, optionally followed
// by a sized payload (also CRLF-terminated). Nothing in this crate performs
// I/O: commands encode to `Bytes`, and inbound bytes decode into `ProtocolOp`
// values from a caller-owned `BytesMut`.
pub mod command;
pub mod info;
pub mod op;

pub use command::{Command, ConnectOptions};
pub use info::ServerInfo;
pub use op::{ErrOp, InfoOp, MsgOp, ProtocolOp, decode_op, decode_ops};

pub const CRLF: &[u8] = b"\r\n";

/// Longest control line accepted before a CRLF shows up.
///
/// `INFO` payloads carrying many `connect_urls` are the largest legitimate
/// control lines; anything past this cap is treated as a corrupt stream.
pub const MAX_CONTROL_LINE: usize = 64 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("control line is not valid utf-8")]
    InvalidUtf8,
    #[error("malformed {verb} frame: {line}")]
    Malformed { verb: &'static str, line: String },
    #[error("invalid payload length in {verb} frame: {value}")]
    InvalidLength { verb: &'static str, value: String },
    #[error("payload for {verb} frame is not terminated by CRLF")]
    MissingPayloadTerminator { verb: &'static str },
    #[error("control line exceeds {limit} bytes")]
    ControlLineTooLong { limit: usize },
    #[error("failed to serialize connect options")]
    Serialize(#[source] serde_json::Error),
}
