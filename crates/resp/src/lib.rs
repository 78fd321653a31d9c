//! RESP (Redis serialization protocol) support: the value model, an
//! incremental frame codec for `tokio_util::codec`, and a minimal async
//! client connection used to talk to cache backends.

use bytes::Bytes;

mod codec;
pub use codec::{encode, Codec};

pub mod client;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed mid-reply")]
    UnexpectedEof,
}

/// A decoded RESP2 value. `Null` covers both the null bulk string (`$-1`)
/// and the null array (`*-1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Value>),
}

impl Value {
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Value::Bulk(data.into())
    }

    /// The payload bytes of a bulk or simple-string value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bulk(data) => Some(data),
            Value::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// Converts a decoded client frame into a command argv.
///
/// Clients send commands as arrays of bulk strings; inline commands decode
/// to the same shape. Anything else is a protocol error.
pub fn command(value: Value) -> Result<Vec<Bytes>, Error> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(Error::Protocol(format!(
                "expected command array, got {other:?}"
            )))
        }
    };
    if items.is_empty() {
        return Err(Error::Protocol("empty command".to_string()));
    }
    items
        .into_iter()
        .map(|item| match item {
            Value::Bulk(data) => Ok(data),
            Value::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            other => Err(Error::Protocol(format!(
                "command argument must be a bulk string, got {other:?}"
            ))),
        })
        .collect()
}
