//! Delivery of consensus messages between nodes.
//!
//! Sends are fire-and-forget: the actor hands over an [`Envelope`] and moves
//! on, lost messages are recovered by the next heartbeat. A peer that fails
//! to answer is skipped for an exponentially growing interval.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use memkv_common::error::{MemkvError, Result};
use memkv_common::types::{ClusterConfig, NodeId};
use memkv_storage::Envelope;
use tracing::{debug, trace};

use crate::actor::NodeHandle;

/// Outbound half of the cluster network.
pub trait Transport: Send + Sync + 'static {
    /// Queues a message for delivery. Must not block.
    fn send(&self, envelope: Envelope);
}

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    retry_at: Instant,
}

/// Per-peer retry schedule for unreachable peers.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    peers: Mutex<HashMap<NodeId, Failures>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a message to `peer` may be attempted at `now`.
    pub fn ready(&self, peer: NodeId, now: Instant) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .map_or(true, |f| now >= f.retry_at)
    }

    /// Records a failed delivery and returns the delay before the next try.
    pub fn record_failure(&self, peer: NodeId, now: Instant) -> Duration {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let count = peers.get(&peer).map_or(0, |f| f.count).saturating_add(1);
        let delay = self
            .base
            .checked_mul(1 << (count - 1).min(16))
            .map_or(self.max, |d| d.min(self.max));
        peers.insert(
            peer,
            Failures {
                count,
                retry_at: now + delay,
            },
        );
        delay
    }

    pub fn record_success(&self, peer: NodeId) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer);
    }

    /// Consecutive failed deliveries to `peer`.
    pub fn failures(&self, peer: NodeId) -> u32 {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .map_or(0, |f| f.count)
    }
}

/// Posts envelopes as JSON to each peer's `/raft/step` route.
pub struct HttpTransport {
    client: reqwest::Client,
    peers: HashMap<NodeId, String>,
    backoff: Arc<Backoff>,
}

impl HttpTransport {
    /// Retries start one heartbeat after a failure and are capped at half an
    /// election timeout.
    pub fn new(local: NodeId, config: &ClusterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.election_timeout_ms.max(1)))
            .build()
            .map_err(|err| MemkvError::Config(format!("http client: {err}")))?;

        let peers = config
            .nodes
            .iter()
            .filter(|n| n.node_id != local)
            .map(|n| (n.node_id, format!("http://{}/raft/step", n.socket_addr())))
            .collect();

        let backoff = Backoff::new(
            Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            Duration::from_millis(config.election_timeout_ms / 2),
        );

        Ok(Self {
            client,
            peers,
            backoff: Arc::new(backoff),
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, envelope: Envelope) {
        let Some(url) = self.peers.get(&envelope.to).cloned() else {
            debug!(to = envelope.to, "no address for peer, dropping message");
            return;
        };
        let peer = envelope.to;
        if !self.backoff.ready(peer, Instant::now()) {
            trace!(peer, "peer backing off, dropping message");
            return;
        }
        let client = self.client.clone();
        let backoff = Arc::clone(&self.backoff);

        tokio::spawn(async move {
            let kind = envelope.message.kind();
            let sent = client
                .post(&url)
                .json(&envelope)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match sent {
                Ok(_) => backoff.record_success(peer),
                Err(err) => {
                    let retry_in = backoff.record_failure(peer, Instant::now());
                    let err = MemkvError::NetworkUnavailable {
                        peer,
                        reason: err.to_string(),
                    };
                    debug!(kind, error = %err, ?retry_in, "raft message not delivered");
                }
            }
        });
    }
}

/// In-process network for running a whole cluster inside one runtime.
#[derive(Clone, Default)]
pub struct LocalRouter {
    routes: Arc<RwLock<HashMap<NodeId, NodeHandle>>>,
    disconnected: Arc<RwLock<HashSet<NodeId>>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn register(&self, handle: NodeHandle) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), handle);
    }

    /// Drops every message to or from `id` until it is reconnected.
    pub fn disconnect(&self, id: NodeId) {
        self.disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn route(&self, envelope: &Envelope) -> Option<NodeHandle> {
        let disconnected = self.disconnected.read().unwrap_or_else(PoisonError::into_inner);
        if disconnected.contains(&envelope.from) || disconnected.contains(&envelope.to) {
            return None;
        }
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.to)
            .cloned()
    }
}

impl Transport for LocalRouter {
    fn send(&self, envelope: Envelope) {
        let Some(handle) = self.route(&envelope) else {
            trace!(from = envelope.from, to = envelope.to, "local message dropped");
            return;
        };
        tokio::spawn(async move {
            let _ = handle.step(envelope).await;
        });
    }
}
