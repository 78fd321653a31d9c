//! Shared fixtures: in-process backends, a live proxy listener, and an
//! in-process multi-peer coordinator group.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use shoal::backend::MemBackend;
use shoal::broadcast::BroadcastContext;
use shoal::cluster::{Cluster, ClusterConfig};
use shoal::coordinator::{BroadcastHandler, BroadcastReply, Coordinator};
use shoal::App;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub fn b(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Binds an in-memory backend on an ephemeral port and serves it.
pub async fn spawn_backend() -> (String, Arc<MemBackend>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let backend = MemBackend::new();
    let stop = CancellationToken::new();
    tokio::spawn(backend.clone().serve(listener, stop.clone()));
    (addr, backend, stop)
}

pub struct TestProxy {
    pub app: Arc<App>,
    pub cluster: Arc<Cluster>,
    pub addr: String,
    pub stop: CancellationToken,
}

/// Builds a full proxy (cluster + broadcast wiring + RESP listener) over
/// the given backends and coordinator.
pub async fn spawn_proxy(members: &[String], coordinator: Arc<dyn Coordinator>) -> TestProxy {
    let cluster = Arc::new(Cluster::new(ClusterConfig {
        max_idle: 2,
        max_active: 8,
        workers: 4,
        ..ClusterConfig::default()
    }));
    for member in members {
        cluster.add_member(member);
    }
    cluster.ping_members().await.unwrap();

    let leader_active = Arc::new(AtomicBool::new(false));
    shoal::register_broadcast(
        coordinator.as_ref(),
        BroadcastContext {
            cluster: cluster.clone(),
            self_id: coordinator.name(),
            leader_active: leader_active.clone(),
            max_active: 8,
        },
    );
    let app = Arc::new(App {
        cluster: cluster.clone(),
        coordinator,
        leader_active,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let stop = CancellationToken::new();
    tokio::spawn(shoal::serve(app.clone(), listener, stop.clone(), 32));

    TestProxy {
        app,
        cluster,
        addr,
        stop,
    }
}

/// An in-process broadcast fabric shared by a set of [`GroupCoordinator`]s,
/// standing in for the external fleet coordinator.
#[derive(Default)]
pub struct Group {
    handlers: Mutex<HashMap<String, BroadcastHandler>>,
}

impl Group {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct GroupCoordinator {
    id: String,
    group: Arc<Group>,
}

impl GroupCoordinator {
    pub fn new(id: impl Into<String>, group: Arc<Group>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            group,
        })
    }
}

#[async_trait::async_trait]
impl Coordinator for GroupCoordinator {
    fn name(&self) -> String {
        self.id.clone()
    }

    async fn members(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .group
            .handlers
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect())
    }

    async fn broadcast(&self, payload: Bytes) -> anyhow::Result<Vec<BroadcastReply>> {
        let handlers: Vec<(String, BroadcastHandler)> = {
            let handlers = self.group.handlers.lock().unwrap();
            handlers
                .iter()
                .map(|(id, handler)| (id.clone(), handler.clone()))
                .collect()
        };

        let mut replies = Vec::new();
        for (id, handler) in handlers {
            match handler(payload.clone()).await {
                Ok(reply) => replies.push(BroadcastReply {
                    id,
                    reply,
                    error: None,
                }),
                Err(err) => replies.push(BroadcastReply {
                    id,
                    reply: Bytes::new(),
                    error: Some(err.to_string()),
                }),
            }
        }
        Ok(replies)
    }

    fn register_handler(&self, handler: BroadcastHandler) {
        self.group
            .handlers
            .lock()
            .unwrap()
            .insert(self.id.clone(), handler);
    }
}
