use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::info;

use crate::config::{Config, TimingConfig};
use crate::error::ApiError;
use crate::rpc::StatusReply;
use crate::state_machine::StateMachine;
use crate::transport::PeerClient;

mod election;
mod replication;

/// One replicated command together with the term it was accepted under.
/// The `(index, term)` pair is the entry's identity for replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Everything the protocol mutates. Guarded by the single node lock: every
/// handler and reply-folding step reads term and role, decides, and mutates
/// under one acquisition, so multi-field decisions are atomic.
pub(crate) struct NodeState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
    pub role: Role,
    /// Highest index known replicated on a majority; -1 when nothing is.
    pub commit_index: i64,
    /// Highest index handed to the state machine; never above commit_index.
    pub last_applied: i64,
    /// Instant of the last event that refreshed follower patience.
    pub last_heartbeat: Instant,
    pub election_timeout: Duration,
    pub votes_received: usize,
    /// Leader-only: per-peer highest index known replicated there.
    pub match_index: HashMap<String, i64>,
}

impl NodeState {
    /// Hands every newly committed entry to the state machine, ascending.
    pub(crate) fn apply_committed(&mut self, machine: &dyn StateMachine) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = self.log.get(next as usize).unwrap_or_else(|| {
                panic!(
                    "commit index {} points past log length {}",
                    self.commit_index,
                    self.log.len()
                )
            });
            machine.apply(next as u64, entry);
            self.last_applied = next;
        }
    }
}

/// A single cluster member: the locked protocol state plus everything needed
/// to reach peers and report committed entries.
pub struct RaftNode {
    id: String,
    peers: Vec<String>,
    timing: TimingConfig,
    transport: PeerClient,
    state_machine: Arc<dyn StateMachine>,
    state: Mutex<NodeState>,
}

impl RaftNode {
    pub fn new(
        config: Config,
        transport: PeerClient,
        state_machine: Arc<dyn StateMachine>,
    ) -> Arc<Self> {
        let election_timeout = sample_election_timeout(&config.timing);
        Arc::new(RaftNode {
            id: config.node_id,
            peers: config.peers,
            timing: config.timing,
            transport,
            state_machine,
            state: Mutex::new(NodeState {
                current_term: 0,
                voted_for: None,
                log: Vec::new(),
                role: Role::Follower,
                commit_index: -1,
                last_applied: -1,
                last_heartbeat: Instant::now(),
                election_timeout,
                votes_received: 0,
                match_index: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drives the node for the life of the process. Followers and candidates
    /// poll for election timeout at tick granularity; leaders broadcast a
    /// replication round each heartbeat and then re-evaluate the commit
    /// index. Role changes made by RPC handlers take effect on the next
    /// iteration.
    pub async fn run(self: Arc<Self>) {
        info!(id = %self.id, cluster_size = self.cluster_size(), "node driver started");
        loop {
            let role = self.state.lock().await.role;
            match role {
                Role::Leader => {
                    self.broadcast_append_entries().await;
                    self.advance_commit_index().await;
                    sleep(self.timing.heartbeat_interval()).await;
                }
                Role::Follower | Role::Candidate => {
                    sleep(self.timing.tick_interval()).await;
                    let timed_out = {
                        let state = self.state.lock().await;
                        state.role != Role::Leader
                            && state.last_heartbeat.elapsed() > state.election_timeout
                    };
                    if timed_out {
                        self.start_election().await;
                    }
                }
            }
        }
    }

    /// Appends a client command to the log. Leader only; replication and
    /// commitment happen on subsequent heartbeats.
    pub async fn submit(&self, command: String) -> Result<u64, ApiError> {
        let mut state = self.state.lock().await;
        if state.role != Role::Leader {
            return Err(ApiError::NotLeader);
        }
        let term = state.current_term;
        state.log.push(LogEntry { term, command });
        let index = (state.log.len() - 1) as u64;
        info!(index, term, "accepted client command");
        Ok(index)
    }

    pub async fn status(&self) -> StatusReply {
        let state = self.state.lock().await;
        StatusReply {
            id: self.id.clone(),
            role: state.role,
            term: state.current_term,
            log: state.log.clone(),
            commit_index: state.commit_index,
        }
    }

    pub(crate) fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the cluster, self included.
    pub(crate) fn is_majority(&self, count: usize) -> bool {
        count * 2 > self.cluster_size()
    }

    pub(crate) fn sample_election_timeout(&self) -> Duration {
        sample_election_timeout(&self.timing)
    }
}

fn sample_election_timeout(timing: &TimingConfig) -> Duration {
    let ms = rand::thread_rng()
        .gen_range(timing.election_timeout_min_ms..=timing.election_timeout_max_ms);
    Duration::from_millis(ms)
}


#[cfg(test)]
mod tests {
    use super::testutil::test_node;
    use super::*;

    #[tokio::test]
    async fn test_boots_as_follower_with_empty_state() {
        let (node, _) = test_node("a", &["http://b", "http://c"]);
        let state = node.state.lock().await;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert!(state.log.is_empty());
        assert_eq!(state.commit_index, -1);
        assert_eq!(state.last_applied, -1);
    }

    #[tokio::test]
    async fn test_majority_thresholds() {
        let (three, _) = test_node("a", &["http://b", "http://c"]);
        assert!(!three.is_majority(1));
        assert!(three.is_majority(2));
        assert!(three.is_majority(3));

        let (five, _) = test_node("a", &["b", "c", "d", "e"]);
        assert!(!five.is_majority(2));
        assert!(five.is_majority(3));

        let (single, _) = test_node("a", &[]);
        assert!(single.is_majority(1));
    }

    #[tokio::test]
    async fn test_submit_rejected_when_not_leader() {
        let (node, _) = test_node("a", &["http://b"]);
        let err = node.submit("SET x=1".to_string()).await.unwrap_err();
        assert!(matches!(err, ApiError::NotLeader));
        assert!(node.state.lock().await.log.is_empty());
    }

    #[tokio::test]
    async fn test_submit_appends_with_current_term() {
        let (node, _) = test_node("a", &["http://b"]);
        {
            let mut state = node.state.lock().await;
            state.role = Role::Leader;
            state.current_term = 3;
        }
        assert_eq!(node.submit("SET x=1".to_string()).await.unwrap(), 0);
        assert_eq!(node.submit("SET y=2".to_string()).await.unwrap(), 1);

        let state = node.state.lock().await;
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.log[1].term, 3);
        assert_eq!(state.log[1].command, "SET y=2");
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (node, _) = test_node("a", &["http://b"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 2;
            state.role = Role::Leader;
            state.log.push(LogEntry {
                term: 2,
                command: "SET x=1".to_string(),
            });
            state.commit_index = 0;
        }
        let status = node.status().await;
        assert_eq!(status.id, "a");
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.term, 2);
        assert_eq!(status.log.len(), 1);
        assert_eq!(status.commit_index, 0);
    }

    #[tokio::test]
    async fn test_election_timeout_sampled_within_range() {
        let (node, _) = test_node("a", &[]);
        for _ in 0..32 {
            let timeout = node.sample_election_timeout();
            assert!(timeout >= Duration::from_millis(3000));
            assert!(timeout <= Duration::from_millis(6000));
        }
    }
}
