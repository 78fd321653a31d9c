//! Minimal RESP client connection: one command out, one reply back.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::{Codec, Error, Value};

/// A dialed backend connection. Not shareable; the caller owns the
/// connection exclusively for the duration of each command.
pub struct Conn {
    framed: Framed<TcpStream, Codec>,
}

impl Conn {
    pub async fn dial(addr: &str) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, Codec),
        })
    }

    /// Issues one command as a RESP array of bulk strings and reads one
    /// reply. Backend error replies surface as `Ok(Value::Error)`; transport
    /// and framing failures are `Err` and the connection must be discarded.
    pub async fn command(&mut self, verb: &[u8], args: &[Bytes]) -> Result<Value, Error> {
        let mut items = Vec::with_capacity(1 + args.len());
        items.push(Value::Bulk(Bytes::copy_from_slice(verb)));
        items.extend(args.iter().cloned().map(Value::Bulk));
        self.framed.send(Value::Array(items)).await?;

        match self.framed.next().await {
            Some(reply) => reply,
            None => Err(Error::UnexpectedEof),
        }
    }
}
