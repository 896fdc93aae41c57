//! propnet: a propagation network replicated over gossip
//!
//! A network is a tree of groups holding contacts (cells) joined by wires.
//! Values written to a contact merge by the contact's blend mode and flow
//! along wires; gadget groups run a primitive once their inputs are ready.
//! Several nodes each own part of the tree and gossip settled contacts to
//! each other until their replicas agree.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────┐  gossip   ┌──────┐  gossip   ┌──────┐
//!  │Node A│◄──────────►│Node B│◄──────────►│Node C│
//!  │ src  │            │ mid  │            │ sink │
//!  └──────┘            └──────┘            └──────┘
//! ```
//!
//! ## Propagation
//! - A write merges into its contact (`blend`)
//! - Settled contacts fan out along wires, highest priority first (`scheduler`)
//! - Ready gadgets fire their primitive (`primitive`)
//!
//! ## Gossip Protocol
//! - Each node replicates its owned contacts plus their one-hop neighbours
//! - Settled contacts are broadcast to every connected peer as `update`s
//! - Periodic `sync-request`s repair updates that were lost
//! - Heartbeats drop peers that stop answering

pub mod blend;
pub mod config;
pub mod convergence;
pub mod error;
pub mod gossip;
pub mod network;
pub mod peer;
pub mod primitive;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::{GossipConfig, SchedulerConfig, SchedulerMode};
pub use convergence::{ConvergenceReport, Ownership};
pub use error::{NodeError, PrimitiveInputError, PropagationError, StorageError, TopologyError};
pub use gossip::{GossipNode, NodeStatus};
pub use network::{NetworkBuilder, Topology};
pub use peer::{ConnectionState, PeerInfo};
pub use primitive::{Primitive, PrimitiveRegistry};
pub use scheduler::{GadgetFailure, PendingWrite, PropagationReport, Propagator};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};
pub use transport::{GossipHandler, GossipTransport, HttpTransport, LocalTransport};
pub use types::*;
