use tracing::info;

use crate::raft::LogEntry;

/// Sink for committed commands. Entries are delivered in ascending index
/// order, each exactly once per node.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: u64, entry: &LogEntry);
}

/// Applier used by the standalone binary: records each committed command to
/// the log stream.
pub struct LogApplier;

impl StateMachine for LogApplier {
    fn apply(&self, index: u64, entry: &LogEntry) {
        info!(index, term = entry.term, command = %entry.command, "applied committed entry");
    }
}
