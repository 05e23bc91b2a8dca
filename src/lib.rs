//! A single Raft participant.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! The node state machine ([`node`]) owns term, vote, commit and apply state and
//! runs behind a mailbox ([`runtime`]). Leaders push client commands through the
//! [`pipeline`] and replicate them with one [`replication`] actor per peer;
//! followers are driven through the RPC [`service`].

pub mod client_api;
pub mod cluster;
pub mod codec;
pub mod command;
pub mod config;
pub mod election;
pub mod error;
pub mod journal;
pub mod kv;
pub mod machine;
pub mod node;
pub mod pipeline;
pub mod register;
pub mod replication;
pub mod runtime;
pub mod server;
pub mod service;
pub mod state;
pub mod storage;
pub mod timer;
pub mod transport;
pub mod types;

pub use command::NodeCommand;
pub use config::{CommitPolicy, Config, NodeOptions};
pub use error::{Error, Result};
pub use machine::{Command, StateMachine};
pub use node::{NodeState, NodeStatus};
pub use runtime::NodeHandle;
pub use server::{RaftNode, Server};
pub use state::Role;
pub use storage::{MemoryLog, ReplicatedLog, SegmentedLog};
pub use types::{LogEntry, LogIndex, NodeId, Term};
