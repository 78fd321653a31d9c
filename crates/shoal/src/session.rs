//! The RESP front door: one `Session` per client connection, dispatching
//! parsed commands either locally, to a routed backend, or to the
//! distributed-get orchestrator. Every command writes exactly one reply
//! into the connection's output buffer.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use resp::Value;

use crate::hint::{self, RoutingHint};
use crate::{distget, App};

/// What the serve loop should do with the connection after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// `QUIT`: flush the pending reply, then close.
    Close,
    /// `DETACH`: hand the transport to a task that replies `OK` and closes,
    /// dropping any still-buffered pipeline input.
    Detach,
}

pub struct Session {
    app: Arc<App>,
}

impl Session {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    /// Handles one parsed command, appending its reply to `out`.
    pub async fn dispatch(&self, mut argv: Vec<Bytes>, out: &mut BytesMut) -> Disposition {
        metrics::counter!("shoal_commands_total").increment(1);

        // Consume an optional routing hint from the last argument.
        let mut routing_key: Option<Bytes> = None;
        let mut len_hint: Option<usize> = None;
        if argv.len() >= 2 {
            let parsed = hint::parse(&argv[argv.len() - 1]);
            match parsed {
                Ok(None) => {}
                Ok(Some(RoutingHint::Hash { key, len })) => {
                    routing_key = Some(key);
                    len_hint = len;
                    argv.pop();
                }
                Ok(Some(RoutingHint::Index(i))) => {
                    if i == 0 || i >= argv.len() - 1 {
                        reply_error(out, format!("ERR invalid index [{i}]"));
                        return Disposition::Continue;
                    }
                    routing_key = Some(argv[i].clone());
                    argv.pop();
                }
                Err(err) => {
                    reply_error(out, format!("ERR {err}"));
                    return Disposition::Continue;
                }
            }
        }

        let verb = argv[0].clone();
        if verb.eq_ignore_ascii_case(b"PING") {
            match routing_key {
                // A hinted PING probes the backend owning the hint key.
                Some(key) => self.forward(key, argv, out).await,
                None => resp::encode(&Value::Simple("PONG".to_string()), out),
            }
            return Disposition::Continue;
        }
        if verb.eq_ignore_ascii_case(b"QUIT") {
            resp::encode(&Value::Simple("OK".to_string()), out);
            return Disposition::Close;
        }
        if verb.eq_ignore_ascii_case(b"CONFIG") {
            // Stub for redis-benchmark compatibility.
            if argv.len() < 3 {
                reply_error(out, "ERR wrong number of arguments for 'config' command");
            } else {
                resp::encode(
                    &Value::Array(vec![Value::Bulk(argv[2].clone()), Value::bulk("")]),
                    out,
                );
            }
            return Disposition::Continue;
        }
        if verb.eq_ignore_ascii_case(b"DETACH") {
            return Disposition::Detach;
        }
        if verb.eq_ignore_ascii_case(b"DISTGET") {
            if argv.len() != 2 {
                reply_error(out, "ERR wrong number of arguments for 'distget' command");
                return Disposition::Continue;
            }
            let started = std::time::Instant::now();
            match distget::orchestrate(&self.app, &argv[1], len_hint).await {
                Ok(value) => resp::encode(&value, out),
                Err(err) => reply_error(out, format!("ERR {err}")),
            }
            metrics::histogram!("shoal_distget_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            return Disposition::Continue;
        }

        // Pass-through: route by the hint key, the first operand, or a
        // synthesized key that lands on an arbitrary backend.
        let key = match routing_key {
            Some(key) => key,
            None if argv.len() >= 2 => argv[1].clone(),
            None => Bytes::from(uuid::Uuid::new_v4().to_string()),
        };
        self.forward(key, argv, out).await;
        Disposition::Continue
    }

    async fn forward(&self, key: Bytes, argv: Vec<Bytes>, out: &mut BytesMut) {
        let mut argv = argv.into_iter();
        let verb = argv.next().expect("argv is never empty");
        let args: Vec<Bytes> = argv.collect();
        let started = std::time::Instant::now();
        match self.app.cluster.dispatch(&key, verb, args).await {
            Ok(reply) => resp::encode(&reply, out),
            Err(err) => reply_error(out, format!("ERR {err}")),
        }
        metrics::histogram!("shoal_dispatch_duration_seconds")
            .record(started.elapsed().as_secs_f64());
    }
}

fn reply_error(out: &mut BytesMut, text: impl Into<String>) {
    resp::encode(&Value::Error(text.into()), out);
}
