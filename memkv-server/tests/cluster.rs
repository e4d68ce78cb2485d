use std::collections::BTreeMap;
use std::time::Duration;

use memkv_common::error::MemkvError;
use memkv_common::types::{NodeId, Term, NO_NODE};
use memkv_server::{spawn_node, ActorConfig, LocalRouter, NodeHandle};
use memkv_storage::{
    FileHardStateStorage, FileLogStorage, NodeRole, NodeStatus, RaftConfig, RaftNode,
};

const RAFT: RaftConfig = RaftConfig {
    election_tick: 30,
    heartbeat_tick: 5,
    max_entries_per_message: 64,
};

const ACTOR: ActorConfig = ActorConfig {
    tick_interval: Duration::from_millis(5),
    proposal_timeout: Duration::from_secs(3),
};

struct Cluster {
    router: LocalRouter,
    nodes: BTreeMap<NodeId, NodeHandle>,
}

impl Cluster {
    fn start(size: u64) -> Self {
        let ids: Vec<NodeId> = (1..=size).collect();
        let router = LocalRouter::new();
        let mut nodes = BTreeMap::new();
        for &id in &ids {
            let node = RaftNode::new(id, &ids, RAFT);
            let handle = spawn_node(node, router.transport(), ACTOR);
            router.register(handle.clone());
            nodes.insert(id, handle);
        }
        Self { router, nodes }
    }

    fn handle(&self, id: NodeId) -> &NodeHandle {
        &self.nodes[&id]
    }

    /// Kills a node: cuts it off and stops its actor.
    async fn kill(&mut self, id: NodeId) {
        self.router.disconnect(id);
        if let Some(handle) = self.nodes.remove(&id) {
            handle.shutdown().await;
        }
    }

    /// Waits until every live node reports the same leader in a term of at
    /// least `min_term`.
    async fn await_leader(&self, min_term: Term) -> (NodeId, Term) {
        await_agreement(self.nodes.values().cloned().collect(), min_term).await
    }
}

async fn await_agreement(handles: Vec<NodeHandle>, min_term: Term) -> (NodeId, Term) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let statuses: Vec<NodeStatus> = handles.iter().map(|h| *h.subscribe().borrow()).collect();
            let first = statuses[0];
            let agreed = first.leader != NO_NODE
                && first.term >= min_term
                && statuses
                    .iter()
                    .all(|s| s.leader == first.leader && s.term == first.term);
            if agreed {
                return (first.leader, first.term);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cluster did not agree on a leader")
}

async fn bootstrap(size: u64) {
    let cluster = Cluster::start(size);
    let (leader, term) = cluster.await_leader(1).await;

    assert!(term >= 1);
    for id in 1..=size {
        let status = cluster.handle(id).status().await.unwrap();
        assert_eq!(status.leader, leader);
        let expected = if id == leader {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        };
        assert_eq!(status.role, expected);
    }
    // the new leader's no-op is the first entry of the log
    let status = cluster.handle(leader).status().await.unwrap();
    assert!(status.log_index >= 1);
}

#[tokio::test]
async fn bootstrap_one_node() {
    bootstrap(1).await;
}

#[tokio::test]
async fn bootstrap_three_nodes() {
    bootstrap(3).await;
}

#[tokio::test]
async fn bootstrap_five_nodes() {
    bootstrap(5).await;
}

#[tokio::test]
async fn bootstrap_seven_nodes() {
    bootstrap(7).await;
}

#[tokio::test]
async fn write_then_read_on_leader() {
    let cluster = Cluster::start(3);
    let (leader, _) = cluster.await_leader(1).await;
    let leader = cluster.handle(leader);

    leader.write("a", "1").await.unwrap();
    assert_eq!(leader.read("a", false).await.unwrap(), "1");
    leader.write("a", "2").await.unwrap();
    assert_eq!(leader.read("a", false).await.unwrap(), "2");
}

#[tokio::test]
async fn followers_serve_stale_reads_once_applied() {
    let cluster = Cluster::start(3);
    let (leader, _) = cluster.await_leader(1).await;
    cluster.handle(leader).write("k", "v").await.unwrap();

    let follower = cluster.nodes.keys().copied().find(|&id| id != leader).unwrap();
    let follower = cluster.handle(follower);

    match follower.read("k", false).await {
        Err(MemkvError::NotLeader { leader: hint }) => assert_eq!(hint, leader),
        other => panic!("unexpected read result {other:?}"),
    }

    let value = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match follower.read("k", true).await {
                Ok(value) => return value,
                Err(MemkvError::KeyNotFound(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(err) => panic!("stale read failed: {err}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(value, "v");
}

#[tokio::test]
async fn write_on_follower_names_leader() {
    let cluster = Cluster::start(3);
    let (leader, _) = cluster.await_leader(1).await;
    let follower = cluster.nodes.keys().copied().find(|&id| id != leader).unwrap();

    match cluster.handle(follower).write("x", "y").await {
        Err(MemkvError::NotLeader { leader: hint }) => assert_eq!(hint, leader),
        other => panic!("unexpected write result {other:?}"),
    }
}

#[tokio::test]
async fn reelection_after_leader_is_killed() {
    let mut cluster = Cluster::start(3);
    let (old_leader, old_term) = cluster.await_leader(1).await;
    cluster.handle(old_leader).write("before", "1").await.unwrap();

    cluster.kill(old_leader).await;
    let (leader, term) = cluster.await_leader(old_term + 1).await;
    assert_ne!(leader, old_leader);
    assert!(term > old_term);

    let leader = cluster.handle(leader);
    leader.write("after", "2").await.unwrap();
    assert_eq!(leader.read("after", false).await.unwrap(), "2");
    // committed writes survive the change of leader
    assert_eq!(leader.read("before", false).await.unwrap(), "1");
}

#[tokio::test]
async fn partitioned_leader_loses_pending_proposal() {
    let cluster = Cluster::start(3);
    let (old_leader, old_term) = cluster.await_leader(1).await;
    cluster.router.disconnect(old_leader);

    let stranded = cluster.handle(old_leader).clone();
    let pending = tokio::spawn(async move { stranded.write("lost", "1").await });

    let others: Vec<NodeHandle> = cluster
        .nodes
        .iter()
        .filter(|(&id, _)| id != old_leader)
        .map(|(_, h)| h.clone())
        .collect();
    let (new_leader, term) = await_agreement(others, old_term + 1).await;
    assert_ne!(new_leader, old_leader);
    assert!(term > old_term);

    cluster.router.reconnect(old_leader);
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(MemkvError::LeadershipLost)), "{result:?}");

    cluster.await_leader(term).await;
    let stale = cluster.handle(old_leader).read("lost", true).await;
    assert!(matches!(stale, Err(MemkvError::KeyNotFound(_))));
}

#[tokio::test]
async fn proposal_times_out_without_quorum() {
    let mut cluster = Cluster::start(3);
    let (leader, _) = cluster.await_leader(1).await;
    let followers: Vec<NodeId> = cluster.nodes.keys().copied().filter(|&id| id != leader).collect();
    for id in followers {
        cluster.kill(id).await;
    }

    let lone = {
        let router = LocalRouter::new();
        let node = RaftNode::new(1, &[1, 2, 3], RAFT);
        spawn_node(
            node,
            router.transport(),
            ActorConfig {
                tick_interval: ACTOR.tick_interval,
                proposal_timeout: Duration::from_millis(300),
            },
        )
    };
    // a lone member of a three-node cluster never learns of a leader
    assert!(matches!(lone.write("k", "v").await, Err(MemkvError::NotLeader { leader: NO_NODE })));

    let result = tokio::time::timeout(Duration::from_secs(10), cluster.handle(leader).write("k", "v")).await;
    assert!(matches!(result, Ok(Err(MemkvError::Timeout))));
}

#[tokio::test]
async fn restart_keeps_term_vote_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let start = || {
        let node = RaftNode::restore(
            1,
            &[1],
            RAFT,
            Box::new(FileLogStorage::open(dir.path()).unwrap()),
            Box::new(FileHardStateStorage::new(dir.path()).unwrap()),
        )
        .unwrap();
        spawn_node(node, LocalRouter::new().transport(), ACTOR)
    };

    let handle = start();
    let (_, first_term) = await_agreement(vec![handle.clone()], 1).await;
    handle.write("a", "1").await.unwrap();
    handle.write("b", "2").await.unwrap();
    assert!(handle.delete("b").await.unwrap());
    let before = handle.status().await.unwrap();
    handle.shutdown().await;
    let mut closed = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while closed.changed().await.is_ok() {}
    })
    .await
    .unwrap();

    let handle = start();
    let restored = *handle.subscribe().borrow();
    assert_eq!(restored.term, first_term);
    assert_eq!(restored.log_index, before.log_index);
    assert_eq!(restored.commit_index, 0);

    let (_, term) = await_agreement(vec![handle.clone()], first_term + 1).await;
    assert_eq!(term, first_term + 1);

    let mut status = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.last_applied > before.log_index),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(handle.read("a", false).await.unwrap(), "1");
    assert!(matches!(handle.read("b", false).await, Err(MemkvError::KeyNotFound(_))));
}
