//! Routed command dispatch over the backend fleet: a consistent-hash ring
//! picks the owning host, a bounded per-host queue hands the command to one
//! of a fixed set of workers, and each worker borrows a pooled connection
//! for the duration of a single command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use deadpool::managed::{self, Metrics, Object, RecycleResult};
use resp::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Commands queued per host before producers block.
const QUEUE_DEPTH: usize = 10_000;
/// Pooled connections idle for longer than this are discarded.
const IDLE_TIMEOUT: Duration = Duration::from_secs(240);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Partition count for the consistent hashring.
    pub partitions: usize,
    /// Replication factor for the consistent hashring.
    pub replication_factor: usize,
    /// Maximum idle connections kept per host.
    pub max_idle: usize,
    /// Maximum simultaneously checked-out connections per host. Also caps
    /// the parallelism of distributed chunk reads.
    pub max_active: usize,
    /// Worker tasks draining each host's queue.
    pub workers: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partitions: 27_103,
            replication_factor: 10,
            max_idle: 3,
            max_active: 1_000,
            workers: 100,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("no members in the hashring")]
    NoMembers,
    #[error("cluster is offline")]
    Offline,
    #[error(transparent)]
    Resp(#[from] resp::Error),
    #[error("connection pool: {0}")]
    Pool(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// One queued command. The worker writes the outcome into `done` exactly
/// once; the producer awaits the paired receiver.
struct CommandRequest {
    verb: Bytes,
    args: Vec<Bytes>,
    done: oneshot::Sender<Result<Value, ClusterError>>,
}

struct ConnManager {
    host: String,
}

impl managed::Manager for ConnManager {
    type Type = resp::client::Conn;
    type Error = resp::Error;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        resp::client::Conn::dial(&self.host).await
    }

    async fn recycle(&self, _conn: &mut Self::Type, metrics: &Metrics) -> RecycleResult<Self::Error> {
        if metrics.last_used() > IDLE_TIMEOUT {
            return Err(managed::RecycleError::Message(
                "connection idle past timeout".into(),
            ));
        }
        Ok(())
    }
}

type ConnPool = managed::Pool<ConnManager>;

struct Member {
    host: String,
    queue: async_channel::Sender<CommandRequest>,
    pool: ConnPool,
    workers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
}

struct State {
    ring: hashring::Ring,
    members: HashMap<String, Member>,
}

pub struct Cluster {
    config: ClusterConfig,
    state: RwLock<State>,
    online: AtomicBool,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        let ring = hashring::Ring::new(hashring::Config {
            partition_count: config.partitions,
            replication_factor: config.replication_factor,
            ..hashring::Config::default()
        });
        Self {
            config,
            state: RwLock::new(State {
                ring,
                members: HashMap::new(),
            }),
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Registers a backend host: dedicated connection pool, bounded queue,
    /// and worker set, plus a spot on the hashring. Idempotent.
    pub fn add_member(&self, host: &str) {
        let mut state = self.state.write().unwrap();
        if state.members.contains_key(host) {
            return;
        }

        let pool = ConnPool::builder(ConnManager {
            host: host.to_string(),
        })
        .max_size(self.config.max_active)
        .build()
        .expect("pool builder only fails when timeouts lack a runtime");

        let (queue, jobs) = async_channel::bounded::<CommandRequest>(QUEUE_DEPTH);

        let workers = (0..self.config.workers)
            .map(|i| {
                let id = format!("{host}/{i:04}");
                tokio::spawn(worker(id, pool.clone(), jobs.clone()))
            })
            .collect();
        let sweeper = tokio::spawn(sweep_idle(pool.clone(), self.config.max_idle));

        if state.ring.is_empty() {
            tracing::info!(%host, "init hashring");
        } else {
            tracing::info!(%host, "add to hashring");
        }
        state.ring.add(host);
        state.members.insert(
            host.to_string(),
            Member {
                host: host.to_string(),
                queue,
                pool,
                workers,
                sweeper,
            },
        );
    }

    /// Routes `verb args` to the host owning `key` and awaits its reply.
    /// Enqueueing blocks when the host's queue is full; completion blocks
    /// until a worker has run the command. Errors are surfaced verbatim and
    /// never retried.
    pub async fn dispatch(
        &self,
        key: &[u8],
        verb: Bytes,
        args: Vec<Bytes>,
    ) -> Result<Value, ClusterError> {
        if !self.is_online() {
            return Err(ClusterError::Offline);
        }
        let queue = {
            let state = self.state.read().unwrap();
            let host = state.ring.locate(key).ok_or(ClusterError::NoMembers)?;
            state
                .members
                .get(host)
                .ok_or(ClusterError::Offline)?
                .queue
                .clone()
        };

        let (done, reply) = oneshot::channel();
        queue
            .send(CommandRequest { verb, args, done })
            .await
            .map_err(|_| ClusterError::Offline)?;
        reply.await.map_err(|_| ClusterError::Offline)?
    }

    /// Owner of `key` under the current member set.
    pub fn locate(&self, key: &[u8]) -> Option<String> {
        let state = self.state.read().unwrap();
        state.ring.locate(key).map(str::to_string)
    }

    /// Startup health check: every backend must answer `PING` with `PONG`.
    pub async fn ping_members(&self) -> Result<(), ClusterError> {
        let queues: Vec<(String, async_channel::Sender<CommandRequest>)> = {
            let state = self.state.read().unwrap();
            state
                .members
                .values()
                .map(|m| (m.host.clone(), m.queue.clone()))
                .collect()
        };

        for (host, queue) in queues {
            let (done, reply) = oneshot::channel();
            queue
                .send(CommandRequest {
                    verb: Bytes::from_static(b"PING"),
                    args: Vec::new(),
                    done,
                })
                .await
                .map_err(|_| ClusterError::Offline)?;
            match reply.await.map_err(|_| ClusterError::Offline)?? {
                Value::Simple(pong) if pong == "PONG" => {
                    tracing::info!(%host, "backend answered ping");
                }
                other => {
                    return Err(ClusterError::UnexpectedReply(format!(
                        "PING to {host} returned {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Marks the cluster offline, closes every host queue, and drains the
    /// workers. In-flight commands complete normally; new dispatches fail
    /// with [`ClusterError::Offline`].
    pub async fn shutdown(&self) {
        self.online.store(false, Ordering::Relaxed);
        let members: Vec<Member> = {
            let mut state = self.state.write().unwrap();
            state.members.drain().map(|(_, member)| member).collect()
        };
        for member in members {
            tracing::info!(host = %member.host, "closing member");
            member.queue.close();
            for handle in member.workers {
                let _ = handle.await;
            }
            member.sweeper.abort();
            member.pool.close();
        }
    }
}

/// Drains one host's queue. Runs until the queue is closed; each command
/// holds one pooled connection for exactly its own execution window.
async fn worker(id: String, pool: ConnPool, jobs: async_channel::Receiver<CommandRequest>) {
    tracing::debug!(runner = %id, "runner started");
    while let Ok(job) = jobs.recv().await {
        let result = run_command(&pool, &job.verb, &job.args).await;
        if job.done.send(result).is_err() {
            // Caller disconnected while the command was in flight; the
            // reply is discarded.
            tracing::debug!(runner = %id, "dropping reply for a vanished caller");
        }
    }
    tracing::debug!(runner = %id, "runner stopped");
}

async fn run_command(
    pool: &ConnPool,
    verb: &Bytes,
    args: &[Bytes],
) -> Result<Value, ClusterError> {
    let mut conn = pool.get().await.map_err(pool_error)?;
    match conn.command(verb, args).await {
        Ok(reply) => Ok(reply),
        Err(err) => {
            // A broken transport must not be recycled; the next borrow
            // dials fresh.
            let _ = Object::take(conn);
            Err(err.into())
        }
    }
}

fn pool_error(err: managed::PoolError<resp::Error>) -> ClusterError {
    match err {
        managed::PoolError::Backend(err) => ClusterError::Resp(err),
        other => ClusterError::Pool(other.to_string()),
    }
}

/// Periodically drops idle connections that have outlived the idle timeout
/// and trims the idle set down to `max_idle`.
async fn sweep_idle(pool: ConnPool, max_idle: usize) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let mut excess = pool.status().available.saturating_sub(max_idle);
        pool.retain(|_, metrics| {
            if metrics.last_used() > IDLE_TIMEOUT {
                return false;
            }
            if excess > 0 {
                excess -= 1;
                return false;
            }
            true
        });
    }
}
