use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{RaftNode, Role};
use crate::rpc::{AppendEntriesReply, AppendEntriesRequest};

impl RaftNode {
    /// One replication round: snapshot the request under the lock, then send
    /// to every peer concurrently. The same round doubles as the heartbeat.
    pub(crate) async fn broadcast_append_entries(self: &Arc<Self>) {
        let request = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            AppendEntriesRequest {
                term: state.current_term,
                leader_id: self.id.clone(),
                leader_commit: state.commit_index,
                entries: state.log.clone(),
            }
        };

        for peer in &self.peers {
            let node = Arc::clone(self);
            let peer = peer.clone();
            let request = request.clone();
            tokio::spawn(async move {
                node.replicate_to(peer, request).await;
            });
        }
    }

    async fn replicate_to(self: Arc<Self>, peer: String, request: AppendEntriesRequest) {
        let sent_term = request.term;
        let sent_len = request.entries.len();
        match self.transport.append_entries(&peer, &request).await {
            Ok(reply) => {
                self.record_append_reply(sent_term, &peer, sent_len, &reply)
                    .await;
            }
            Err(err) => debug!(%peer, error = %err, "append entries dropped"),
        }
    }

    /// Folds one replication reply into node state. A success acknowledges
    /// exactly the log snapshot that was sent, so the peer's match index is
    /// derived from the sent length rather than the live log.
    pub(crate) async fn record_append_reply(
        &self,
        sent_term: u64,
        peer: &str,
        sent_len: usize,
        reply: &AppendEntriesReply,
    ) {
        let mut state = self.state.lock().await;
        if reply.term > state.current_term {
            self.step_down_locked(&mut state, reply.term);
            return;
        }
        if reply.success && state.role == Role::Leader && state.current_term == sent_term {
            state
                .match_index
                .insert(peer.to_string(), sent_len as i64 - 1);
        }
    }

    /// Advances the commit index onto the log tail once a strict majority of
    /// the cluster (self included) holds it, then applies the newly
    /// committed entries in order.
    pub(crate) async fn advance_commit_index(&self) {
        let mut state = self.state.lock().await;
        if state.role != Role::Leader || state.log.is_empty() {
            return;
        }
        let target = state.log.len() as i64 - 1;
        if target == state.commit_index {
            return;
        }
        // Only entries of the leader's own term are committed by counting;
        // earlier-term entries commit implicitly underneath them.
        if state.log[target as usize].term != state.current_term {
            return;
        }
        let replicas = 1 + state
            .match_index
            .values()
            .filter(|&&index| index >= target)
            .count();
        if self.is_majority(replicas) {
            state.commit_index = target;
            info!(index = target, replicas, "majority reached, committing");
            state.apply_committed(self.state_machine.as_ref());
        }
    }

    /// Follower-side replication: reject stale leaders, adopt the leader's
    /// log wholesale when it is at least as long as ours, and chase the
    /// leader's commit index.
    pub async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesReply {
        let mut state = self.state.lock().await;
        if request.term < state.current_term {
            warn!(
                leader = %request.leader_id,
                term = request.term,
                current_term = state.current_term,
                "rejecting append entries from stale leader"
            );
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
            };
        }

        state.last_heartbeat = Instant::now();
        if request.term > state.current_term {
            self.step_down_locked(&mut state, request.term);
        } else if state.role == Role::Candidate {
            // A legitimate leader exists for this term; yield to it.
            state.role = Role::Follower;
        }

        // A shorter incoming log is an out-of-order straggler; adopting it
        // would shrink a log this node already extended.
        if request.entries.len() >= state.log.len() {
            state.log = request.entries;
        }

        if request.leader_commit > state.commit_index {
            state.commit_index = request.leader_commit.min(state.log.len() as i64 - 1);
            state.apply_committed(self.state_machine.as_ref());
        }

        AppendEntriesReply {
            term: state.current_term,
            success: true,
        }
    }
}
