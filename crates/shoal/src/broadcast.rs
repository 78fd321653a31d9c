//! Broadcast envelopes and the receiver-side handler table. Payloads are
//! self-describing JSON; only the distributed-get type carries interesting
//! data, the rest are liveness pings from the fleet coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::cluster::Cluster;
use crate::distget::{self, DistributedGetInput};

pub const CTRL_BROADCAST_LEADER_LIVENESS: &str = "CTRL_BROADCAST_LEADER_LIVENESS";
pub const CTRL_BROADCAST_EMPTY: &str = "CTRL_BROADCAST_EMPTY";
pub const CTRL_BROADCAST_DISTRIBUTED_GET: &str = "CTRL_BROADCAST_DISTRIBUTED_GET";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: &str, source: String, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            source,
            data,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Everything the receiver side of a broadcast needs. Holds the cluster by
/// one-way reference; the cluster never points back.
pub struct BroadcastContext {
    pub cluster: Arc<Cluster>,
    /// This proxy's identity, matched against distributed-get assignments.
    pub self_id: String,
    pub leader_active: Arc<AtomicBool>,
    /// Concurrency cap for local chunk reads.
    pub max_active: usize,
}

/// Dispatches one inbound broadcast by its type discriminator.
#[tracing::instrument(level = "debug", skip_all, err(level = "warn"))]
pub async fn handle(ctx: Arc<BroadcastContext>, payload: Bytes) -> anyhow::Result<Bytes> {
    let envelope = Envelope::decode(&payload).map_err(|err| {
        tracing::error!(%err, "unmarshal failed");
        err
    })?;

    match envelope.kind.as_str() {
        CTRL_BROADCAST_LEADER_LIVENESS => {
            ctx.leader_active.store(true, Ordering::Relaxed);
            Ok(Bytes::new())
        }
        CTRL_BROADCAST_EMPTY => Ok(Bytes::new()),
        CTRL_BROADCAST_DISTRIBUTED_GET => {
            if !ctx.cluster.is_online() {
                anyhow::bail!("cluster offline");
            }
            let input: DistributedGetInput = serde_json::from_value(envelope.data)?;
            distget::handle_remote(&ctx, input).await
        }
        other => anyhow::bail!("failed: unsupported type: {other}"),
    }
}
