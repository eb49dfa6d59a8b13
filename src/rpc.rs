use serde::{Deserialize, Serialize};

use crate::raft::{LogEntry, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    /// Highest index the leader knows to be committed; -1 when nothing is.
    pub leader_commit: i64,
    /// The leader's entire log. Followers adopt it wholesale when it is at
    /// least as long as their own.
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReply {
    pub success: bool,
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub id: String,
    pub role: Role,
    pub term: u64,
    pub log: Vec<LogEntry>,
    pub commit_index: i64,
}
