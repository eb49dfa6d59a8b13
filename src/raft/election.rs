use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::{NodeState, RaftNode, Role};
use crate::rpc::{VoteReply, VoteRequest};

impl RaftNode {
    /// Stands as candidate for the next term and solicits votes from every
    /// peer concurrently. Each solicitation is an independent task so one
    /// slow peer cannot stall the rest of the round.
    pub(crate) async fn start_election(self: &Arc<Self>) {
        let (request, won_uncontested) = {
            let mut state = self.state.lock().await;
            // A straggler vote may have completed the majority between the
            // timeout check and this point.
            if state.role == Role::Leader {
                return;
            }
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.id.clone());
            state.votes_received = 1;
            state.last_heartbeat = Instant::now();
            state.election_timeout = self.sample_election_timeout();
            info!(term = state.current_term, "election timeout, standing as candidate");

            // With no peers the self-vote already carries the majority.
            let won = self.is_majority(state.votes_received);
            if won {
                self.become_leader_locked(&mut state);
            }
            let request = VoteRequest {
                term: state.current_term,
                candidate_id: self.id.clone(),
            };
            (request, won)
        };

        if won_uncontested {
            self.broadcast_append_entries().await;
            return;
        }

        for peer in &self.peers {
            let node = Arc::clone(self);
            let peer = peer.clone();
            let request = request.clone();
            tokio::spawn(async move {
                node.solicit_vote(peer, request).await;
            });
        }
    }

    async fn solicit_vote(self: Arc<Self>, peer: String, request: VoteRequest) {
        let issued_term = request.term;
        match self.transport.request_vote(&peer, &request).await {
            Ok(reply) => {
                if self.record_vote_reply(issued_term, &peer, &reply).await {
                    // Assert leadership right away so peers reset their
                    // election timers before another timeout fires.
                    self.broadcast_append_entries().await;
                }
            }
            Err(err) => debug!(%peer, error = %err, "vote request dropped"),
        }
    }

    /// Folds one vote reply into node state. Returns true when this reply
    /// completed the majority and the node became leader.
    pub(crate) async fn record_vote_reply(
        &self,
        issued_term: u64,
        peer: &str,
        reply: &VoteReply,
    ) -> bool {
        let mut state = self.state.lock().await;
        if reply.term > state.current_term {
            self.step_down_locked(&mut state, reply.term);
            return false;
        }
        // Replies from an abandoned candidacy are stale; discard them.
        if !reply.vote_granted || state.role != Role::Candidate || state.current_term != issued_term
        {
            return false;
        }
        state.votes_received += 1;
        debug!(%peer, votes = state.votes_received, term = issued_term, "vote granted");
        if self.is_majority(state.votes_received) {
            self.become_leader_locked(&mut state);
            return true;
        }
        false
    }

    pub(crate) fn become_leader_locked(&self, state: &mut NodeState) {
        state.role = Role::Leader;
        state.match_index = self.peers.iter().map(|peer| (peer.clone(), -1)).collect();
        info!(
            term = state.current_term,
            votes = state.votes_received,
            "won election, assuming leadership"
        );
    }

    /// Unconditional return to follower at a newly observed higher term.
    /// Callers must invoke this before any further decision based on the
    /// old term.
    pub(crate) fn step_down_locked(&self, state: &mut NodeState, term: u64) {
        info!(
            old_term = state.current_term,
            new_term = term,
            "observed higher term, stepping down"
        );
        state.current_term = term;
        state.role = Role::Follower;
        state.voted_for = None;
        state.last_heartbeat = Instant::now();
    }

    /// Grants the vote iff the request is for the current term and this
    /// node's vote is unspent or already went to the same candidate.
    pub async fn handle_request_vote(&self, request: VoteRequest) -> VoteReply {
        let mut state = self.state.lock().await;
        if request.term > state.current_term {
            self.step_down_locked(&mut state, request.term);
        }
        let grant = request.term == state.current_term
            && state
                .voted_for
                .as_deref()
                .map_or(true, |voted| voted == request.candidate_id);
        if grant {
            state.voted_for = Some(request.candidate_id.clone());
            state.last_heartbeat = Instant::now();
            info!(candidate = %request.candidate_id, term = request.term, "granting vote");
        }
        VoteReply {
            term: state.current_term,
            vote_granted: grant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::test_node;
    use super::*;

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let (node, _) = test_node("a", &["http://b", "http://c"]);

        let reply = node
            .handle_request_vote(VoteRequest {
                term: 1,
                candidate_id: "b".to_string(),
            })
            .await;
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 1);

        // A different candidate in the same term is refused.
        let reply = node
            .handle_request_vote(VoteRequest {
                term: 1,
                candidate_id: "c".to_string(),
            })
            .await;
        assert!(!reply.vote_granted);

        // The same candidate may be re-granted.
        let reply = node
            .handle_request_vote(VoteRequest {
                term: 1,
                candidate_id: "b".to_string(),
            })
            .await;
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn test_stale_term_vote_refused() {
        let (node, _) = test_node("a", &["http://b"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 5;
        }
        let reply = node
            .handle_request_vote(VoteRequest {
                term: 3,
                candidate_id: "b".to_string(),
            })
            .await;
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn test_higher_term_vote_request_forces_step_down() {
        let (node, _) = test_node("a", &["http://b", "http://c"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 5;
            state.role = Role::Leader;
            state.voted_for = Some("a".to_string());
        }
        let reply = node
            .handle_request_vote(VoteRequest {
                term: 6,
                candidate_id: "c".to_string(),
            })
            .await;
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 6);

        let state = node.state.lock().await;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 6);
        assert_eq!(state.voted_for.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_vote_grant_refreshes_patience() {
        let (node, _) = test_node("a", &["http://b"]);
        {
            let mut state = node.state.lock().await;
            state.last_heartbeat = Instant::now() - std::time::Duration::from_secs(60);
        }
        node.handle_request_vote(VoteRequest {
            term: 1,
            candidate_id: "b".to_string(),
        })
        .await;
        let state = node.state.lock().await;
        assert!(state.last_heartbeat.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_majority_of_grants_wins_leadership() {
        let (node, _) = test_node("a", &["http://b", "http://c"]);
        node.start_election().await;
        {
            let state = node.state.lock().await;
            assert_eq!(state.role, Role::Candidate);
            assert_eq!(state.current_term, 1);
            assert_eq!(state.voted_for.as_deref(), Some("a"));
            assert_eq!(state.votes_received, 1);
        }

        let won = node
            .record_vote_reply(
                1,
                "http://b",
                &VoteReply {
                    term: 1,
                    vote_granted: true,
                },
            )
            .await;
        assert!(won);

        let state = node.state.lock().await;
        assert_eq!(state.role, Role::Leader);
        assert_eq!(state.match_index.len(), 2);
        assert_eq!(state.match_index["http://b"], -1);
        assert_eq!(state.match_index["http://c"], -1);
    }

    #[tokio::test]
    async fn test_denied_votes_do_not_count() {
        let (node, _) = test_node("a", &["http://b", "http://c"]);
        node.start_election().await;

        let won = node
            .record_vote_reply(
                1,
                "http://b",
                &VoteReply {
                    term: 1,
                    vote_granted: false,
                },
            )
            .await;
        assert!(!won);
        let state = node.state.lock().await;
        assert_eq!(state.role, Role::Candidate);
        assert_eq!(state.votes_received, 1);
    }

    #[tokio::test]
    async fn test_higher_term_reply_abandons_candidacy() {
        let (node, _) = test_node("a", &["http://b", "http://c"]);
        node.start_election().await;

        let won = node
            .record_vote_reply(
                1,
                "http://b",
                &VoteReply {
                    term: 4,
                    vote_granted: false,
                },
            )
            .await;
        assert!(!won);

        let state = node.state.lock().await;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 4);
        assert_eq!(state.voted_for, None);
    }

    #[tokio::test]
    async fn test_grant_from_earlier_candidacy_is_discarded() {
        let (node, _) = test_node("a", &["http://b", "http://c"]);
        node.start_election().await;
        node.start_election().await; // term 2 supersedes term 1

        let won = node
            .record_vote_reply(
                1,
                "http://b",
                &VoteReply {
                    term: 1,
                    vote_granted: true,
                },
            )
            .await;
        assert!(!won);
        let state = node.state.lock().await;
        assert_eq!(state.current_term, 2);
        assert_eq!(state.votes_received, 1);
    }

    #[tokio::test]
    async fn test_single_node_cluster_elects_itself() {
        let (node, _) = test_node("a", &[]);
        node.start_election().await;
        let state = node.state.lock().await;
        assert_eq!(state.role, Role::Leader);
        assert_eq!(state.current_term, 1);
    }
}
