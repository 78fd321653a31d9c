//! Distributed GET: reassembles a value stored as `n` chunks under
//! `<name>/<i>` by fanning the chunk reads out over every live proxy peer.
//! The initiator assigns indices round-robin, broadcasts one work order,
//! and concatenates the returned chunks in index order. Failure policy is
//! all-or-nothing: any peer error fails the whole request.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use resp::Value;
use tokio::sync::Semaphore;

use crate::broadcast::{BroadcastContext, Envelope, CTRL_BROADCAST_DISTRIBUTED_GET};
use crate::App;

/// Work order broadcast to all peers: which peer reads which chunk index.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DistributedGetInput {
    pub name: String,
    pub assign: BTreeMap<usize, String>,
}

/// One peer's share of the chunks, base64-encoded per index.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct DistributedGetOutput {
    pub data: BTreeMap<usize, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DistGetError {
    #[error("no cache")]
    NoCache,
    #[error("incomplete cache data")]
    Incomplete,
    #[error("index [{0}] not found")]
    MissingIndex(usize),
    #[error("invalid cache length [{0}]")]
    BadLength(String),
    #[error("no peers available")]
    NoPeers,
}

/// Runs one distributed get from the initiating proxy.
#[tracing::instrument(level = "debug", skip(app, name), err(level = "warn"))]
pub(crate) async fn orchestrate(
    app: &App,
    name: &[u8],
    len_hint: Option<usize>,
) -> Result<Value, DistGetError> {
    metrics::counter!("shoal_distget_requests_total").increment(1);
    let name = String::from_utf8_lossy(name).into_owned();

    // A len= routing hint short-circuits the <name>/len lookup.
    let n = match len_hint {
        Some(n) => n,
        None => chunk_count(app, &name).await?,
    };
    if n == 0 {
        return Err(DistGetError::BadLength("0".to_string()));
    }

    let mut nodes = app.coordinator.members().await.map_err(|err| {
        tracing::warn!(%err, "membership lookup failed");
        DistGetError::NoCache
    })?;
    nodes.sort();
    nodes.dedup();
    if nodes.is_empty() {
        return Err(DistGetError::NoPeers);
    }

    let input = DistributedGetInput {
        name: name.clone(),
        assign: assign(n, &nodes),
    };
    let payload = Envelope::new(
        CTRL_BROADCAST_DISTRIBUTED_GET,
        app.coordinator.name(),
        serde_json::to_value(&input).map_err(|_| DistGetError::Incomplete)?,
    )
    .encode()
    .map_err(|_| DistGetError::Incomplete)?;

    let replies = app.coordinator.broadcast(payload).await.map_err(|err| {
        tracing::warn!(%err, "broadcast failed");
        DistGetError::NoCache
    })?;

    // Fail-fast aggregation: every peer must have succeeded.
    let mut merged: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for peer in replies {
        if let Some(err) = peer.error {
            tracing::warn!(peer = %peer.id, %err, "peer failed its chunk reads");
            return Err(DistGetError::NoCache);
        }
        if peer.reply.is_empty() {
            // Peer had no assigned indices.
            continue;
        }
        let output: DistributedGetOutput =
            serde_json::from_slice(&peer.reply).map_err(|_| DistGetError::Incomplete)?;
        for (index, encoded) in output.data {
            let chunk = base64::decode(&encoded).map_err(|_| DistGetError::Incomplete)?;
            merged.insert(index, chunk);
        }
    }

    let mut assembled = Vec::new();
    for index in 0..n {
        match merged.remove(&index) {
            Some(chunk) => assembled.extend_from_slice(&chunk),
            None => return Err(DistGetError::MissingIndex(index)),
        }
    }
    Ok(Value::Bulk(assembled.into()))
}

/// Round-robin index assignment over the (sorted) peer set.
pub(crate) fn assign(n: usize, nodes: &[String]) -> BTreeMap<usize, String> {
    (0..n).map(|i| (i, nodes[i % nodes.len()].clone())).collect()
}

/// Resolves the chunk count from `GET <name>/len` through the local
/// cluster. String, bulk, and integer reply shapes are all accepted.
async fn chunk_count(app: &App, name: &str) -> Result<usize, DistGetError> {
    let key = format!("{name}/len");
    let reply = app
        .cluster
        .dispatch(
            key.as_bytes(),
            Bytes::from_static(b"GET"),
            vec![Bytes::copy_from_slice(key.as_bytes())],
        )
        .await
        .map_err(|err| {
            tracing::warn!(%err, %key, "length lookup failed");
            DistGetError::NoCache
        })?;

    let raw = match &reply {
        Value::Integer(i) => {
            return usize::try_from(*i).map_err(|_| DistGetError::BadLength(i.to_string()))
        }
        Value::Null => return Err(DistGetError::NoCache),
        value => match value.as_bytes() {
            Some(text) => String::from_utf8_lossy(text).into_owned(),
            None => {
                tracing::warn!(%key, ?reply, "unexpected length reply shape");
                return Err(DistGetError::NoCache);
            }
        },
    };
    raw.trim()
        .parse::<usize>()
        .map_err(|_| DistGetError::BadLength(raw.clone()))
}

/// Receiver side of the broadcast: reads the chunks assigned to this peer
/// from its local cluster, bounded by `max_active` concurrent reads. Any
/// chunk failure aborts the whole peer reply.
pub(crate) async fn handle_remote(
    ctx: &BroadcastContext,
    input: DistributedGetInput,
) -> anyhow::Result<Bytes> {
    let own: Vec<usize> = input
        .assign
        .iter()
        .filter(|(_, peer)| **peer == ctx.self_id)
        .map(|(&index, _)| index)
        .collect();
    if own.is_empty() {
        return Ok(Bytes::new());
    }

    let limit = Arc::new(Semaphore::new(ctx.max_active));
    let fetches = own.into_iter().map(|index| {
        let key = format!("{}/{}", input.name, index);
        let limit = limit.clone();
        let cluster = ctx.cluster.clone();
        async move {
            let _permit = limit.acquire().await.expect("semaphore is never closed");
            let reply = cluster
                .dispatch(
                    key.as_bytes(),
                    Bytes::from_static(b"GET"),
                    vec![Bytes::copy_from_slice(key.as_bytes())],
                )
                .await?;
            match reply {
                Value::Bulk(data) => Ok((index, data)),
                Value::Null => anyhow::bail!("index [{index}] not found"),
                Value::Error(err) => anyhow::bail!(err),
                other => anyhow::bail!("unexpected reply for {key}: {other:?}"),
            }
        }
    });

    let chunks = futures::future::try_join_all(fetches).await?;
    let mut output = DistributedGetOutput::default();
    for (index, data) in chunks {
        output.data.insert(index, base64::encode(&data));
    }
    Ok(serde_json::to_vec(&output)?.into())
}
