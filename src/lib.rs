#![forbid(unsafe_code)]

//! Replicated command-execution core.
//!
//! Clients submit structured commands to any node of a cluster; write
//! commands are forwarded to the replication leader over a
//! line-oriented request/response protocol while reads run anywhere.
//! This crate holds the pieces that make that work: the command model
//! and its escalation transport, the sequential commit notifier worker
//! threads block on, and the bounded-lifetime socket pool the
//! messenger draws connections from.

pub mod clock;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod messenger;
pub mod notifier;
pub mod pool;
pub mod queue;
pub mod telemetry;
pub mod wire;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use cluster::{ClusterState, Peer, PeerRole};
pub use command::{Command, OutboundRequest, Priority, WriteConsistency};
pub use config::Config;
pub use messenger::ClusterMessenger;
pub use notifier::{SequentialNotifier, WaitResult};
pub use pool::SocketPool;
pub use queue::{CommandQueue, QueueTimeout};
pub use wire::Message;
