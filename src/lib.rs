pub mod config;
pub mod error;
pub mod raft;
pub mod rpc;
pub mod server;
pub mod state_machine;
pub mod transport;
