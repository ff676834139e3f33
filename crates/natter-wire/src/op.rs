// Inbound frame decoding.
//
// `decode_op` consumes at most one complete frame from the front of the
// buffer. Partial frames are left untouched so the caller can append more
// bytes and retry; nothing is buffered inside the decoder itself.
use bytes::{Buf, Bytes, BytesMut};

use crate::{CRLF, Error, MAX_CONTROL_LINE, Result, ServerInfo};

/// Decoded server-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    Info(InfoOp),
    Msg(MsgOp),
    Ping,
    Pong,
    Ok,
    Err(ErrOp),
    /// A well-terminated frame whose verb this client does not know.
    Unrecognized(String),
}

impl ProtocolOp {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::Info(_) => "INFO",
            ProtocolOp::Msg(_) => "MSG",
            ProtocolOp::Ping => "PING",
            ProtocolOp::Pong => "PONG",
            ProtocolOp::Ok => "+OK",
            ProtocolOp::Err(_) => "-ERR",
            ProtocolOp::Unrecognized(_) => "UNRECOGNIZED",
        }
    }
}

/// Raw capability payload from an `INFO` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoOp {
    pub payload: String,
}

impl InfoOp {
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::parse(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgOp {
    pub subject: String,
    pub subscription_id: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrOp {
    pub message: String,
}

/// Decode the next complete frame, if the buffer holds one.
///
/// ```
/// use bytes::BytesMut;
/// use natter_wire::{ProtocolOp, decode_op};
///
/// let mut buf = BytesMut::from(&b"MSG foo sid1@C1 5\r\nhel"[..]);
/// assert!(decode_op(&mut buf).expect("decode").is_none());
/// buf.extend_from_slice(b"lo\r\nPING\r\n");
/// match decode_op(&mut buf).expect("decode") {
///     Some(ProtocolOp::Msg(msg)) => assert_eq!(&msg.payload[..], b"hello"),
///     other => panic!("unexpected {other:?}"),
/// }
/// assert_eq!(decode_op(&mut buf).expect("decode"), Some(ProtocolOp::Ping));
/// assert!(buf.is_empty());
/// ```
pub fn decode_op(buf: &mut BytesMut) -> Result<Option<ProtocolOp>> {
    loop {
        let Some(line_end) = find_crlf(buf) else {
            if buf.len() > MAX_CONTROL_LINE {
                return Err(Error::ControlLineTooLong {
                    limit: MAX_CONTROL_LINE,
                });
            }
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| Error::InvalidUtf8)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            // Stray CRLF between frames.
            buf.advance(line_end + CRLF.len());
            continue;
        }
        let (verb, rest) = match trimmed.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (trimmed, ""),
        };

        if verb.eq_ignore_ascii_case("MSG") {
            let header = rest.to_string();
            return decode_msg(buf, line_end, &header);
        }

        let op = if verb.eq_ignore_ascii_case("INFO") {
            ProtocolOp::Info(InfoOp {
                payload: rest.to_string(),
            })
        } else if verb.eq_ignore_ascii_case("PING") {
            ProtocolOp::Ping
        } else if verb.eq_ignore_ascii_case("PONG") {
            ProtocolOp::Pong
        } else if verb.eq_ignore_ascii_case("+OK") {
            ProtocolOp::Ok
        } else if verb.eq_ignore_ascii_case("-ERR") {
            ProtocolOp::Err(ErrOp {
                message: rest.trim_matches('\'').to_string(),
            })
        } else {
            ProtocolOp::Unrecognized(trimmed.to_string())
        };
        buf.advance(line_end + CRLF.len());
        return Ok(Some(op));
    }
}

/// Drain every complete frame currently in the buffer.
pub fn decode_ops(buf: &mut BytesMut) -> Result<Vec<ProtocolOp>> {
    let mut ops = Vec::new();
    while let Some(op) = decode_op(buf)? {
        ops.push(op);
    }
    Ok(ops)
}

// MSG <subject> <sid> [reply-to] <#bytes>\r\n<payload>\r\n
fn decode_msg(buf: &mut BytesMut, line_end: usize, header: &str) -> Result<Option<ProtocolOp>> {
    let parts: Vec<&str> = header.split_ascii_whitespace().collect();
    let (subject, sid, reply_to, len) = match parts.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply_to, len] => (*subject, *sid, Some(*reply_to), *len),
        _ => {
            return Err(Error::Malformed {
                verb: "MSG",
                line: header.to_string(),
            });
        }
    };
    let payload_len: usize = len.parse().map_err(|_| Error::InvalidLength {
        verb: "MSG",
        value: len.to_string(),
    })?;

    let payload_start = line_end + CRLF.len();
    let bounds = payload_start
        .checked_add(payload_len)
        .and_then(|end| Some((end, end.checked_add(CRLF.len())?)));
    let Some((payload_end, frame_end)) = bounds else {
        return Err(Error::InvalidLength {
            verb: "MSG",
            value: len.to_string(),
        });
    };
    if buf.len() < frame_end {
        return Ok(None);
    }
    if &buf[payload_end..frame_end] != CRLF {
        return Err(Error::MissingPayloadTerminator { verb: "MSG" });
    }

    let subject = subject.to_string();
    let subscription_id = sid.to_string();
    let reply_to = reply_to.map(str::to_string);
    buf.advance(payload_start);
    let payload = buf.split_to(payload_len).freeze();
    buf.advance(CRLF.len());
    Ok(Some(ProtocolOp::Msg(MsgOp {
        subject,
        subscription_id,
        reply_to,
        payload,
    })))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|window| window == CRLF)
}
