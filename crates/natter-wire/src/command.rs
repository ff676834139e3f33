// Outbound commands and their exact wire encodings.
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::{CRLF, Error, Result};

/// Options carried by the `CONNECT` handshake frame.
///
/// ```
/// use natter_wire::{Command, ConnectOptions};
///
/// let options = ConnectOptions::new("orders-service");
/// let frame = Command::Connect(&options).encode().expect("encode");
/// assert!(frame.starts_with(b"CONNECT {\"name\":\"orders-service\""));
/// assert!(frame.ends_with(b"}\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectOptions {
    pub name: String,
    pub lang: String,
    pub version: String,
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

impl ConnectOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            verbose: false,
            pedantic: false,
            user: None,
            pass: None,
        }
    }
}

/// A single client-to-server frame.
///
/// ```
/// use natter_wire::Command;
///
/// let frame = Command::Publish {
///     subject: "foo",
///     reply_to: None,
///     payload: b"hello",
/// }
/// .encode()
/// .expect("encode");
/// assert_eq!(&frame[..], b"PUB foo 5\r\nhello\r\n");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Connect(&'a ConnectOptions),
    Ping,
    Pong,
    Publish {
        subject: &'a str,
        reply_to: Option<&'a str>,
        payload: &'a [u8],
    },
    Subscribe {
        subject: &'a str,
        queue_group: Option<&'a str>,
        subscription_id: &'a str,
        client_id: &'a str,
    },
    Unsubscribe {
        subscription_id: &'a str,
        client_id: &'a str,
        max_messages: Option<u32>,
    },
}

impl Command<'_> {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Connect(_) => "CONNECT",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Publish { .. } => "PUB",
            Command::Subscribe { .. } => "SUB",
            Command::Unsubscribe { .. } => "UNSUB",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Command::Connect(options) => {
                let json = serde_json::to_vec(options).map_err(Error::Serialize)?;
                let mut buf = BytesMut::with_capacity(json.len() + 10);
                buf.put_slice(b"CONNECT ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
                Ok(buf.freeze())
            }
            Command::Ping => Ok(Bytes::from_static(b"PING\r\n")),
            Command::Pong => Ok(Bytes::from_static(b"PONG\r\n")),
            Command::Publish {
                subject,
                reply_to,
                payload,
            } => {
                let len = payload.len().to_string();
                let reply_len = reply_to.map_or(0, |reply| reply.len() + 1);
                let mut buf = BytesMut::with_capacity(
                    4 + subject.len() + reply_len + 1 + len.len() + 2 + payload.len() + 2,
                );
                buf.put_slice(b"PUB ");
                buf.put_slice(subject.as_bytes());
                if let Some(reply_to) = reply_to {
                    buf.put_u8(b' ');
                    buf.put_slice(reply_to.as_bytes());
                }
                buf.put_u8(b' ');
                buf.put_slice(len.as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(payload);
                buf.put_slice(CRLF);
                Ok(buf.freeze())
            }
            Command::Subscribe {
                subject,
                queue_group,
                subscription_id,
                client_id,
            } => {
                let mut buf = BytesMut::with_capacity(
                    4 + subject.len() + 32 + subscription_id.len() + client_id.len(),
                );
                buf.put_slice(b"SUB ");
                buf.put_slice(subject.as_bytes());
                if let Some(queue_group) = queue_group {
                    buf.put_u8(b' ');
                    buf.put_slice(queue_group.as_bytes());
                }
                buf.put_u8(b' ');
                put_scoped_sid(&mut buf, subscription_id, client_id);
                buf.put_slice(CRLF);
                Ok(buf.freeze())
            }
            Command::Unsubscribe {
                subscription_id,
                client_id,
                max_messages,
            } => {
                let mut buf =
                    BytesMut::with_capacity(6 + subscription_id.len() + client_id.len() + 16);
                buf.put_slice(b"UNSUB ");
                put_scoped_sid(&mut buf, subscription_id, client_id);
                if let Some(max_messages) = max_messages {
                    buf.put_u8(b' ');
                    buf.put_slice(max_messages.to_string().as_bytes());
                }
                buf.put_slice(CRLF);
                Ok(buf.freeze())
            }
        }
    }
}

// Subscription ids are scoped to the client so several clients can reuse the
// same caller-chosen id against one server.
fn put_scoped_sid(buf: &mut BytesMut, subscription_id: &str, client_id: &str) {
    buf.put_slice(subscription_id.as_bytes());
    buf.put_u8(b'@');
    buf.put_slice(client_id.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_reply_to() {
        let frame = Command::Publish {
            subject: "foo",
            reply_to: None,
            payload: b"hello",
        }
        .encode()
        .expect("encode");
        assert_eq!(&frame[..], b"PUB foo 5\r\nhello\r\n");
    }

    #[test]
    fn publish_with_reply_to() {
        let frame = Command::Publish {
            subject: "foo",
            reply_to: Some("inbox.1"),
            payload: b"hi",
        }
        .encode()
        .expect("encode");
        assert_eq!(&frame[..], b"PUB foo inbox.1 2\r\nhi\r\n");
    }

    #[test]
    fn publish_length_counts_bytes_not_chars() {
        let payload = "héllo".as_bytes();
        let frame = Command::Publish {
            subject: "foo",
            reply_to: None,
            payload,
        }
        .encode()
        .expect("encode");
        assert!(frame.starts_with(b"PUB foo 6\r\n"));
    }

    #[test]
    fn publish_empty_payload() {
        let frame = Command::Publish {
            subject: "foo",
            reply_to: None,
            payload: b"",
        }
        .encode()
        .expect("encode");
        assert_eq!(&frame[..], b"PUB foo 0\r\n\r\n");
    }

    #[test]
    fn subscribe_with_queue_group() {
        let frame = Command::Subscribe {
            subject: "foo",
            queue_group: Some("grp"),
            subscription_id: "sid1",
            client_id: "C1",
        }
        .encode()
        .expect("encode");
        assert_eq!(&frame[..], b"SUB foo grp sid1@C1\r\n");
    }

    #[test]
    fn subscribe_without_queue_group() {
        let frame = Command::Subscribe {
            subject: "foo.>",
            queue_group: None,
            subscription_id: "sid1",
            client_id: "C1",
        }
        .encode()
        .expect("encode");
        assert_eq!(&frame[..], b"SUB foo.> sid1@C1\r\n");
    }

    #[test]
    fn unsubscribe_with_and_without_max() {
        let frame = Command::Unsubscribe {
            subscription_id: "sid1",
            client_id: "C1",
            max_messages: Some(5),
        }
        .encode()
        .expect("encode");
        assert_eq!(&frame[..], b"UNSUB sid1@C1 5\r\n");

        let frame = Command::Unsubscribe {
            subscription_id: "sid1",
            client_id: "C1",
            max_messages: None,
        }
        .encode()
        .expect("encode");
        assert_eq!(&frame[..], b"UNSUB sid1@C1\r\n");
    }

    #[test]
    fn heartbeat_frames() {
        assert_eq!(&Command::Ping.encode().expect("ping")[..], b"PING\r\n");
        assert_eq!(&Command::Pong.encode().expect("pong")[..], b"PONG\r\n");
    }

    #[test]
    fn connect_serializes_credentials_only_when_present() {
        let mut options = ConnectOptions::new("svc");
        options.verbose = true;
        let frame = Command::Connect(&options).encode().expect("encode");
        let text = std::str::from_utf8(&frame).expect("utf8");
        assert!(text.starts_with("CONNECT {"));
        assert!(text.ends_with("}\r\n"));
        assert!(text.contains("\"verbose\":true"));
        assert!(!text.contains("\"user\""));

        options.user = Some("alice".to_string());
        options.pass = Some("p\"w".to_string());
        let frame = Command::Connect(&options).encode().expect("encode");
        let json = &frame[b"CONNECT ".len()..frame.len() - 2];
        let value: serde_json::Value = serde_json::from_slice(json).expect("json");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["pass"], "p\"w");
        assert_eq!(value["lang"], "rust");
    }
}
