//! Seam onto the external fleet coordinator. The proxy only consumes a
//! narrow surface: its own identity, the live peer set, and an
//! all-peers broadcast with per-peer replies. Leader election and durable
//! group state stay on the other side of this trait.

use std::sync::Mutex;

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Outcome of delivering one broadcast to one peer.
#[derive(Debug, Clone)]
pub struct BroadcastReply {
    pub id: String,
    pub reply: Bytes,
    pub error: Option<String>,
}

/// Receiver-side callback invoked for every inbound broadcast payload.
pub type BroadcastHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>;

#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    /// This proxy's identity among its peers.
    fn name(&self) -> String;

    /// Current live peer identities, in no particular order.
    async fn members(&self) -> anyhow::Result<Vec<String>>;

    /// Sends `payload` to every peer including self and waits for all
    /// replies.
    async fn broadcast(&self, payload: Bytes) -> anyhow::Result<Vec<BroadcastReply>>;

    fn register_handler(&self, handler: BroadcastHandler);
}

/// Single-member coordinator for a proxy running without a peer group:
/// the membership list is just this process, and broadcasts loop back into
/// the registered handler.
pub struct SoloCoordinator {
    id: String,
    handler: Mutex<Option<BroadcastHandler>>,
}

impl SoloCoordinator {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            handler: Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl Coordinator for SoloCoordinator {
    fn name(&self) -> String {
        self.id.clone()
    }

    async fn members(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec![self.id.clone()])
    }

    async fn broadcast(&self, payload: Bytes) -> anyhow::Result<Vec<BroadcastReply>> {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .context("no broadcast handler registered")?;
        let reply = match handler(payload).await {
            Ok(reply) => BroadcastReply {
                id: self.id.clone(),
                reply,
                error: None,
            },
            Err(err) => BroadcastReply {
                id: self.id.clone(),
                reply: Bytes::new(),
                error: Some(err.to_string()),
            },
        };
        Ok(vec![reply])
    }

    fn register_handler(&self, handler: BroadcastHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}
