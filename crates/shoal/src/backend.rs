//! In-memory RESP cache backend. Ships as the `shoal-backend` binary for
//! local runs and doubles as the backend fixture in integration tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use resp::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemBackend {
    items: RwLock<HashMap<Bytes, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Direct read access, used by tests to observe placement.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.items
            .read()
            .unwrap()
            .get(key)
            .map(|v| Bytes::copy_from_slice(v))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.items.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }

    /// Accepts RESP connections until cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let Ok((socket, _addr)) = accept else {
                        continue;
                    };
                    let backend = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = backend.client(socket).await {
                            tracing::debug!(%err, "backend connection ended");
                        }
                    });
                }
                _ = stop.cancelled() => return Ok(()),
            }
        }
    }

    async fn client(self: Arc<Self>, socket: TcpStream) -> anyhow::Result<()> {
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, resp::Codec);
        let mut out = BytesMut::new();
        while let Some(frame) = framed.next().await {
            let argv = resp::command(frame?)?;
            let (reply, close) = self.apply(&argv);
            resp::encode(&reply, &mut out);
            framed.get_mut().write_all(&out).await?;
            out.clear();
            if close {
                break;
            }
        }
        framed.get_mut().shutdown().await?;
        Ok(())
    }

    fn apply(&self, argv: &[Bytes]) -> (Value, bool) {
        let verb = &argv[0];
        if verb.eq_ignore_ascii_case(b"PING") {
            return (Value::Simple("PONG".to_string()), false);
        }
        if verb.eq_ignore_ascii_case(b"QUIT") {
            return (Value::Simple("OK".to_string()), true);
        }
        if verb.eq_ignore_ascii_case(b"SET") {
            if argv.len() != 3 {
                return (arity_error(verb), false);
            }
            self.items
                .write()
                .unwrap()
                .insert(argv[1].clone(), argv[2].to_vec());
            return (Value::Simple("OK".to_string()), false);
        }
        if verb.eq_ignore_ascii_case(b"GET") {
            if argv.len() != 2 {
                return (arity_error(verb), false);
            }
            let reply = match self.get(&argv[1]) {
                Some(data) => Value::Bulk(data),
                None => Value::Null,
            };
            return (reply, false);
        }
        if verb.eq_ignore_ascii_case(b"DEL") {
            if argv.len() != 2 {
                return (arity_error(verb), false);
            }
            let removed = self.items.write().unwrap().remove(&argv[1]).is_some();
            return (Value::Integer(removed as i64), false);
        }
        if verb.eq_ignore_ascii_case(b"APPEND") {
            if argv.len() != 3 {
                return (arity_error(verb), false);
            }
            let mut items = self.items.write().unwrap();
            let value = items.entry(argv[1].clone()).or_default();
            value.extend_from_slice(&argv[2]);
            return (Value::Integer(value.len() as i64), false);
        }
        if verb.eq_ignore_ascii_case(b"MGET") {
            if argv.len() < 2 {
                return (arity_error(verb), false);
            }
            let items = self.items.read().unwrap();
            let replies = argv[1..]
                .iter()
                .map(|key| match items.get(key) {
                    Some(data) => Value::Bulk(Bytes::copy_from_slice(data)),
                    None => Value::Null,
                })
                .collect();
            return (Value::Array(replies), false);
        }
        if verb.eq_ignore_ascii_case(b"CONFIG") {
            // Blank response, enough for redis-benchmark.
            if argv.len() < 3 {
                return (arity_error(verb), false);
            }
            return (
                Value::Array(vec![Value::Bulk(argv[2].clone()), Value::bulk("")]),
                false,
            );
        }
        (
            Value::Error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(verb)
            )),
            false,
        )
    }
}

fn arity_error(verb: &[u8]) -> Value {
    Value::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        String::from_utf8_lossy(verb)
    ))
}
