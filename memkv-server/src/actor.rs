//! The consensus actor: one tokio task per node that owns the [`RaftNode`]
//! and serializes every event through a single queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use memkv_common::error::{MemkvError, Result};
use memkv_common::types::{ClusterConfig, LogIndex, NodeId, Term};
use memkv_storage::{ApplyReport, Envelope, KvCommand, KvResponse, NodeStatus, RaftNode};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::transport::Transport;

const EVENT_QUEUE_DEPTH: usize = 1024;

/// Runtime settings of the actor.
#[derive(Debug, Clone, Copy)]
pub struct ActorConfig {
    pub tick_interval: Duration,
    pub proposal_timeout: Duration,
}

impl From<&ClusterConfig> for ActorConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            proposal_timeout: Duration::from_millis(config.proposal_timeout_ms),
        }
    }
}

/// Everything the actor reacts to.
enum Event {
    Tick,
    Step(Envelope),
    Propose {
        command: KvCommand,
        reply: oneshot::Sender<Result<KvResponse>>,
    },
    Read {
        key: String,
        stale: bool,
        reply: oneshot::Sender<Result<String>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// A proposal waiting for its entry to be applied.
struct Pending {
    term: Term,
    reply: oneshot::Sender<Result<KvResponse>>,
}

/// A leader read held back until the leader has applied an entry of its term.
struct ParkedRead {
    key: String,
    reply: oneshot::Sender<Result<String>>,
}

/// Cloneable client side of a running node.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    events: mpsc::Sender<Event>,
    status: watch::Receiver<NodeStatus>,
    proposal_timeout: Duration,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Watch channel of status snapshots, refreshed after every event.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Status { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Hands an inbound consensus message to the actor.
    pub async fn step(&self, envelope: Envelope) -> Result<()> {
        self.send(Event::Step(envelope)).await
    }

    pub async fn write(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let command = KvCommand::Put {
            key: key.into(),
            value: value.into(),
        };
        self.propose(command).await.map(|_| ())
    }

    /// Removes a key, reporting whether it existed.
    pub async fn delete(&self, key: impl Into<String>) -> Result<bool> {
        let command = KvCommand::Delete { key: key.into() };
        match self.propose(command).await? {
            KvResponse::Removed(existed) => Ok(existed),
            other => Err(MemkvError::Consensus(format!(
                "unexpected response to delete: {other:?}"
            ))),
        }
    }

    /// Replicates a command and waits until it is applied on this node.
    pub async fn propose(&self, command: KvCommand) -> Result<KvResponse> {
        if command.key().is_empty() {
            return Err(MemkvError::InvalidArgument("key must not be empty".into()));
        }
        let (reply, rx) = oneshot::channel();
        self.send(Event::Propose { command, reply }).await?;

        match tokio::time::timeout(self.proposal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(stopped()),
            Err(_) => Err(MemkvError::Timeout),
        }
    }

    /// Reads a key. A freshly elected leader answers once its first entry
    /// is applied, or fails with [`MemkvError::Timeout`].
    pub async fn read(&self, key: impl Into<String>, stale: bool) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Read {
            key: key.into(),
            stale,
            reply,
        })
        .await?;

        match tokio::time::timeout(self.proposal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(stopped()),
            Err(_) => Err(MemkvError::Timeout),
        }
    }

    /// Stops the actor. Pending proposals are dropped.
    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.events.send(event).await.map_err(|_| stopped())
    }
}

fn stopped() -> MemkvError {
    MemkvError::Consensus("node is not running".into())
}

/// Starts the actor and its ticker on the current tokio runtime.
pub fn spawn_node(node: RaftNode, transport: Arc<dyn Transport>, config: ActorConfig) -> NodeHandle {
    let id = node.id();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (status_tx, status_rx) = watch::channel(node.status());

    let ticker = events_tx.clone();
    let tick_interval = config.tick_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if ticker.send(Event::Tick).await.is_err() {
                break;
            }
        }
    });

    let actor = NodeActor::new(node, transport, events_rx, status_tx);
    tokio::spawn(actor.run());

    NodeHandle {
        id,
        events: events_tx,
        status: status_rx,
        proposal_timeout: config.proposal_timeout,
    }
}

struct NodeActor {
    node: RaftNode,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<Event>,
    status: watch::Sender<NodeStatus>,
    pending: BTreeMap<LogIndex, Pending>,
    parked_reads: Vec<ParkedRead>,
}

impl NodeActor {
    fn new(
        node: RaftNode,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<Event>,
        status: watch::Sender<NodeStatus>,
    ) -> Self {
        Self {
            node,
            transport,
            events,
            status,
            pending: BTreeMap::new(),
            parked_reads: Vec::new(),
        }
    }

    async fn run(mut self) {
        let id = self.node.id();
        info!(node = id, peers = ?self.node.peers(), "consensus actor started");

        while let Some(event) = self.events.recv().await {
            if matches!(event, Event::Shutdown) {
                info!(node = id, "consensus actor shutting down");
                break;
            }

            let result = match self.handle(event) {
                Err(err) if err.is_fatal() => Err(err),
                handled => self.advance().and(handled),
            };
            if let Err(err) = result {
                if err.is_fatal() {
                    error!(node = id, error = %err, "fatal consensus error, stopping node");
                    break;
                }
                warn!(node = id, error = %err, "event failed");
            }
        }
        // dropping pending replies wakes their callers
        self.pending.clear();
        self.parked_reads.clear();
    }

    fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Tick => self.node.tick(),
            Event::Step(envelope) => self.node.step(envelope),
            Event::Propose { command, reply } => {
                let proposed = command.encode().and_then(|data| self.node.propose(data));
                match proposed {
                    Ok((index, term)) => {
                        debug!(node = self.node.id(), index, term, key = command.key(), "proposal accepted");
                        self.pending.insert(index, Pending { term, reply });
                        Ok(())
                    }
                    Err(err) if err.is_fatal() => {
                        let _ = reply.send(Err(MemkvError::Consensus(err.to_string())));
                        Err(err)
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        Ok(())
                    }
                }
            }
            Event::Read { key, stale, reply } => {
                match self.node.read(&key, stale) {
                    Err(MemkvError::LeaderNotReady { term }) => {
                        debug!(node = self.node.id(), term, key = %key, "read parked until the leader catches up");
                        self.parked_reads.push(ParkedRead { key, reply });
                    }
                    result => {
                        let _ = reply.send(result);
                    }
                }
                Ok(())
            }
            Event::Status { reply } => {
                let _ = reply.send(self.node.status());
                Ok(())
            }
            Event::Shutdown => Ok(()),
        }
    }

    /// Flushes outbound messages, applies newly committed entries and
    /// publishes the resulting status.
    fn advance(&mut self) -> Result<()> {
        for envelope in self.node.take_messages() {
            self.transport.send(envelope);
        }

        let applied = self.node.apply_committed();
        let result = applied.map(|reports| {
            for report in reports {
                self.resolve(report);
            }
        });

        if !self.pending.is_empty() {
            // callers that gave up no longer need a slot
            self.pending.retain(|_, p| !p.reply.is_closed());
            self.fail_deposed_proposals();
        }
        if !self.parked_reads.is_empty() {
            self.serve_parked_reads();
        }
        self.status.send_replace(self.node.status());
        result
    }

    fn serve_parked_reads(&mut self) {
        let parked = std::mem::take(&mut self.parked_reads);
        for read in parked {
            if read.reply.is_closed() {
                continue;
            }
            match self.node.read(&read.key, false) {
                Err(MemkvError::LeaderNotReady { .. }) => self.parked_reads.push(read),
                result => {
                    let _ = read.reply.send(result);
                }
            }
        }
    }

    fn resolve(&mut self, report: ApplyReport) {
        let Some(pending) = self.pending.remove(&report.index) else {
            return;
        };
        let outcome = if pending.term != report.term {
            // another leader's entry took this slot
            Err(MemkvError::LeadershipLost)
        } else {
            report.response.ok_or_else(|| {
                MemkvError::Consensus(format!("entry {} carried no command", report.index))
            })
        };
        let _ = pending.reply.send(outcome);
    }

    fn fail_deposed_proposals(&mut self) {
        let term = self.node.term();
        if self.node.is_leader() && self.pending.values().all(|p| p.term == term) {
            return;
        }
        let failed: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(_, p)| !self.node.is_leader() || p.term != term)
            .map(|(index, _)| *index)
            .collect();

        warn!(node = self.node.id(), count = failed.len(), "failing proposals after losing leadership");
        for index in failed {
            if let Some(pending) = self.pending.remove(&index) {
                let _ = pending.reply.send(Err(MemkvError::LeadershipLost));
            }
        }
    }
}
