use super::hard_state::{HardStateStorage, MemHardStateStorage, VoteRecord};
use super::log::{LogEntry, LogEntryType, RaftLog};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
use super::state_machine::{KeyValueStore, KvCommand, KvResponse, StateMachine};
use super::wal::LogStorage;
use memkv_common::error::{MemkvError, Result};
use memkv_common::types::{ClusterConfig, LogIndex, NodeId, Term, NO_NODE};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Timing and batching knobs, in timer ticks.
#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    /// Base election timeout; the effective timeout is drawn from
    /// `[election_tick, 2 * election_tick)` on every reset.
    pub election_tick: u64,
    pub heartbeat_tick: u64,
    pub max_entries_per_message: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_tick: 10,
            heartbeat_tick: 1,
            max_entries_per_message: 64,
        }
    }
}

impl From<&ClusterConfig> for RaftConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            election_tick: config.election_ticks(),
            heartbeat_tick: config.heartbeat_ticks(),
            max_entries_per_message: config.max_entries_per_message,
        }
    }
}

/// Point-in-time view of a node, as served by the Status operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: NodeId,
    pub leader: NodeId, // NO_NODE until a leader is known
    #[serde(rename = "raftTerm")]
    pub term: Term,
    #[serde(rename = "raftIndex")]
    pub log_index: LogIndex,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub role: NodeRole,
}

/// Records one entry applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub index: LogIndex,
    pub term: Term,
    pub response: Option<KvResponse>, // None for leader no-ops
}

pub type KvStateMachine = Box<dyn StateMachine<Command = KvCommand, Response = KvResponse>>;

/// A Raft node: controls its own state and participates in consensus.
///
/// The node does no I/O besides its own storage: outbound messages are queued
/// and collected with [`RaftNode::take_messages`], time advances through
/// [`RaftNode::tick`], and committed entries reach the state machine through
/// [`RaftNode::apply_committed`].
pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,

    current_term: Term,
    voted_for: Option<NodeId>,
    role: NodeRole,
    leader_id: Option<NodeId>,
    log: RaftLog,
    hard_state: Box<dyn HardStateStorage>,

    election_elapsed: u64,
    randomized_election_timeout: u64,
    heartbeat_elapsed: u64,
    votes_received: HashSet<NodeId>,

    next_index: HashMap<NodeId, LogIndex>,  // For each peer: next entry to send
    match_index: HashMap<NodeId, LogIndex>, // For each peer: last index known replicated

    outbox: Vec<Envelope>,
    state_machine: KvStateMachine,
}

impl RaftNode {
    /// Create a volatile Raft node. `cluster` lists every voter, this node included.
    pub fn new(id: NodeId, cluster: &[NodeId], config: RaftConfig) -> Self {
        let mut peers: Vec<NodeId> = cluster.iter().copied().filter(|&p| p != id).collect();
        peers.sort_unstable();
        peers.dedup();

        let mut node = Self {
            id,
            peers,
            config,
            current_term: 0,
            voted_for: None,
            role: NodeRole::Follower,
            leader_id: None,
            log: RaftLog::new(),
            hard_state: Box::new(MemHardStateStorage::new()),
            election_elapsed: 0,
            randomized_election_timeout: 0,
            heartbeat_elapsed: 0,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            outbox: Vec::new(),
            state_machine: Box::new(KeyValueStore::default()),
        };
        node.reset_election_timer();
        node
    }

    /// Create a node over durable storage, recovering its term, vote and log.
    pub fn restore(
        id: NodeId,
        cluster: &[NodeId],
        config: RaftConfig,
        log_storage: Box<dyn LogStorage>,
        hard_state: Box<dyn HardStateStorage>,
    ) -> Result<Self> {
        if id == NO_NODE || !cluster.contains(&id) {
            return Err(MemkvError::Config(format!(
                "node {id} is not a member of cluster {cluster:?}"
            )));
        }
        let record = hard_state.load()?;
        let log = RaftLog::open(log_storage)?;

        let mut node = Self::new(id, cluster, config);
        node.current_term = record.term;
        node.voted_for = record.voted_for;
        node.log = log;
        node.hard_state = hard_state;
        info!(
            node = id,
            term = record.term,
            voted_for = ?record.voted_for,
            last_index = node.log.last_index(),
            "restored raft state"
        );
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.log.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.log.last_applied
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            leader: self.leader_id.unwrap_or(NO_NODE),
            term: self.current_term,
            log_index: self.log.last_index(),
            commit_index: self.log.commit_index,
            last_applied: self.log.last_applied,
            role: self.role,
        }
    }

    /// Votes needed for a majority, this node included.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Drains the messages queued since the last call.
    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) -> Result<()> {
        match self.role {
            NodeRole::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_tick {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append();
                }
            }
            NodeRole::Follower | NodeRole::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election_timeout {
                    self.campaign()?;
                }
            }
        }
        Ok(())
    }

    /// Starts an election for the next term.
    pub fn campaign(&mut self) -> Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_vote()?;

        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.reset_election_timer();
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        info!(node = self.id, term = self.current_term, "starting election");

        if self.votes_received.len() >= self.quorum() {
            return self.become_leader();
        }

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers.clone() {
            self.send(peer, RaftMessage::RequestVote(request.clone()));
        }
        Ok(())
    }

    /// Feeds one inbound message into the state machine.
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { from, to, message } = envelope;
        if to != self.id {
            warn!(node = self.id, to, "dropping message addressed to another node");
            return Ok(());
        }
        if !self.peers.contains(&from) {
            warn!(node = self.id, from, "dropping message from unknown peer");
            return Ok(());
        }
        debug!(node = self.id, from, kind = message.kind(), term = message.term(), "step");

        if message.term() > self.current_term {
            let leader = match message {
                RaftMessage::AppendEntries(_) => Some(from),
                _ => None,
            };
            info!(
                node = self.id,
                from,
                term = message.term(),
                "observed higher term, stepping down"
            );
            self.become_follower(message.term(), leader)?;
        }

        match message {
            RaftMessage::RequestVote(req) => self.handle_request_vote(from, req),
            RaftMessage::RequestVoteResponse(resp) => self.receive_vote(from, resp),
            RaftMessage::AppendEntries(req) => self.handle_append_entries(from, req),
            RaftMessage::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, resp);
                Ok(())
            }
        }
    }

    /// Called by the leader to append a new client command (application-level payload)
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(LogIndex, Term)> {
        if self.role != NodeRole::Leader {
            return Err(MemkvError::not_leader(self.leader_id));
        }
        let index = self.append_local(LogEntryType::Command, data)?;
        debug!(node = self.id, index, term = self.current_term, "appended proposal");

        self.broadcast_append();
        self.maybe_commit();
        Ok((index, self.current_term))
    }

    /// Applies all entries between last_applied..=commit_index to the state machine
    pub fn apply_committed(&mut self) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::new();
        while self.log.last_applied < self.log.commit_index {
            let next = self.log.last_applied + 1;
            let entry = self.log.get(next)?;
            let term = entry.term;

            let response = match entry.entry_type {
                LogEntryType::Noop => None,
                LogEntryType::Command => {
                    let command = KvCommand::decode(next, &entry.data)?;
                    Some(self.state_machine.apply(command))
                }
            };

            self.log.last_applied = next;
            applied.push(ApplyReport {
                index: next,
                term,
                response,
            });
        }
        if let Some(last) = applied.last() {
            debug!(node = self.id, last_applied = last.index, "applied committed entries");
        }
        Ok(applied)
    }

    /// Whether the state machine reflects every write committed before this
    /// node became leader: an entry of the current term is committed and
    /// everything up to the commit index is applied.
    pub fn read_ready(&self) -> bool {
        self.role == NodeRole::Leader
            && self.log.term_at(self.log.commit_index) == Some(self.current_term)
            && self.log.last_applied == self.log.commit_index
    }

    /// Reads a key from the local state machine. Without `stale`, only a
    /// leader that is [`read_ready`](Self::read_ready) answers.
    pub fn read(&self, key: &str, stale: bool) -> Result<String> {
        if !stale {
            if self.role != NodeRole::Leader {
                return Err(MemkvError::not_leader(self.leader_id));
            }
            if !self.read_ready() {
                return Err(MemkvError::LeaderNotReady {
                    term: self.current_term,
                });
            }
        }
        self.state_machine
            .get(key)
            .ok_or_else(|| MemkvError::KeyNotFound(key.to_string()))
    }

    /// Handles RequestVote RPC. The term has already been reconciled by `step`.
    fn handle_request_vote(&mut self, from: NodeId, req: RequestVoteRequest) -> Result<()> {
        let granted = req.term == self.current_term
            && self.voted_for.map_or(true, |v| v == req.candidate_id)
            && self.log.is_up_to_date(req.last_log_index, req.last_log_term);

        if granted {
            self.voted_for = Some(req.candidate_id);
            self.persist_vote()?;
            self.reset_election_timer();
        }
        debug!(
            node = self.id,
            candidate = req.candidate_id,
            term = self.current_term,
            granted,
            "vote request"
        );

        self.send(
            from,
            RaftMessage::RequestVoteResponse(RequestVoteResponse {
                term: self.current_term,
                vote_granted: granted,
            }),
        );
        Ok(())
    }

    /// Handles a vote response
    fn receive_vote(&mut self, voter_id: NodeId, resp: RequestVoteResponse) -> Result<()> {
        if self.role != NodeRole::Candidate || resp.term != self.current_term {
            return Ok(());
        }

        if resp.vote_granted {
            self.votes_received.insert(voter_id);
            if self.votes_received.len() >= self.quorum() {
                return self.become_leader();
            }
        }
        Ok(())
    }

    /// Handles AppendEntries RPC as a follower
    fn handle_append_entries(&mut self, from: NodeId, req: AppendEntriesRequest) -> Result<()> {
        // 1. Reject if term is older
        if req.term < self.current_term {
            self.reply_append(from, false, 0);
            return Ok(());
        }

        // 2. A live leader for this term exists
        match self.role {
            NodeRole::Leader => {
                error!(
                    node = self.id,
                    other = from,
                    term = self.current_term,
                    "second leader in the same term"
                );
                self.reply_append(from, false, 0);
                return Ok(());
            }
            NodeRole::Candidate => self.become_follower(self.current_term, Some(from))?,
            NodeRole::Follower => {}
        }
        self.leader_id = Some(from);
        self.reset_election_timer();

        // 3. Validate previous entry consistency
        if self.log.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            let hint = self
                .log
                .last_index()
                .min(req.prev_log_index.saturating_sub(1));
            debug!(
                node = self.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                hint,
                "rejecting append, log mismatch"
            );
            self.reply_append(from, false, hint);
            return Ok(());
        }

        // 4. Append new entries (overwrite conflicting entries)
        let last_new = req.prev_log_index + req.entries.len() as LogIndex;
        let mut fresh: Vec<LogEntry> = Vec::new();
        for entry in req.entries {
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    warn!(node = self.id, index = entry.index, "truncating conflicting entries");
                    self.log.truncate_from(entry.index)?;
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }
        self.log.extend(fresh)?;

        // 5. Update commit index
        let commit = req.leader_commit.min(last_new);
        if commit > self.log.commit_index {
            self.log.commit_index = commit;
        }

        self.reply_append(from, true, last_new);
        Ok(())
    }

    /// Called when follower responds to an AppendEntries RPC
    fn handle_append_entries_response(&mut self, from: NodeId, resp: AppendEntriesResponse) {
        if self.role != NodeRole::Leader || resp.term != self.current_term {
            return;
        }

        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        let next = self.next_index.get(&from).copied().unwrap_or(1);
        if resp.success {
            let matched = matched.max(resp.match_index);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, next.max(matched + 1));
            self.maybe_commit();

            if matched < self.log.last_index() {
                self.send_append(from);
            }
        } else {
            // Follower rejected: back off using its hint and retry
            let retry = (resp.match_index + 1)
                .min(next.saturating_sub(1))
                .max(matched + 1);
            self.next_index.insert(from, retry);
            self.send_append(from);
        }
    }

    /// Check if a log index is safely replicated on majority → commit it
    fn maybe_commit(&mut self) {
        if self.role != NodeRole::Leader {
            return;
        }
        let mut match_indexes: Vec<LogIndex> = self
            .peers
            .iter()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        match_indexes.push(self.log.last_index()); // include leader's own index
        match_indexes.sort_unstable_by(|a, b| b.cmp(a)); // descending

        let new_commit = match_indexes[self.quorum() - 1];
        // only entries from the current term are committed by counting replicas
        if new_commit > self.log.commit_index
            && self.log.term_at(new_commit) == Some(self.current_term)
        {
            self.log.commit_index = new_commit;
            debug!(node = self.id, commit_index = new_commit, "commit index advanced");
        }
    }

    /// Transition to follower role. A new term clears the vote.
    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        let was = self.role;
        self.role = NodeRole::Follower;
        if term != self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_vote()?;
        }
        self.leader_id = leader;
        self.votes_received.clear();
        self.reset_election_timer();
        if was != NodeRole::Follower {
            info!(node = self.id, term, from = ?was, "became follower");
        }
        Ok(())
    }

    /// Transition to leader role after winning an election
    fn become_leader(&mut self) -> Result<()> {
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id);
        self.heartbeat_elapsed = 0;
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        info!(node = self.id, term = self.current_term, "became leader");

        // Append a Noop entry to confirm leadership to followers
        self.append_local(LogEntryType::Noop, vec![])?;
        self.broadcast_append();
        self.maybe_commit();
        Ok(())
    }

    fn append_local(&mut self, entry_type: LogEntryType, data: Vec<u8>) -> Result<LogIndex> {
        let prev_index = self.log.last_index();
        let prev_term = self.log.last_term();
        let index = prev_index + 1;
        self.log.append(
            prev_index,
            prev_term,
            LogEntry {
                term: self.current_term,
                index,
                entry_type,
                data,
            },
        )?;
        Ok(index)
    }

    /// Sends AppendEntries (entries or heartbeat) to every peer
    fn broadcast_append(&mut self) {
        for peer in self.peers.clone() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let last_index = self.log.last_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last_index + 1)
            .clamp(1, last_index + 1);

        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(next, self.config.max_entries_per_message);

        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.log.commit_index,
        };
        self.send(peer, RaftMessage::AppendEntries(request));
    }

    fn reply_append(&mut self, to: NodeId, success: bool, match_index: LogIndex) {
        self.send(
            to,
            RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                term: self.current_term,
                success,
                match_index,
            }),
        );
    }

    fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.outbox.push(Envelope {
            from: self.id,
            to,
            message,
        });
    }

    fn persist_vote(&mut self) -> Result<()> {
        self.hard_state.save(&VoteRecord {
            term: self.current_term,
            voted_for: self.voted_for,
        })
    }

    fn reset_election_timer(&mut self) {
        let base = self.config.election_tick.max(1);
        self.election_elapsed = 0;
        self.randomized_election_timeout = rand::thread_rng().gen_range(base..2 * base);
    }
}
