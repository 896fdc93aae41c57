//! Error types for the propagation engine and the node lifecycle.
//!
//! Transport code works with `anyhow::Result`; everything a caller has to
//! branch on lives here.

use thiserror::Error;

use crate::types::{ContactId, GroupId, WireId};

/// A network description that breaks one of the topology invariants
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TopologyError {
    #[error("root group {0} is missing")]
    MissingRoot(GroupId),

    #[error("wire {wire} references unknown contact {contact}")]
    DanglingWire { wire: WireId, contact: ContactId },

    #[error("contact {contact} claims group {group}, which does not list it")]
    ContactNotListed { contact: ContactId, group: GroupId },

    #[error("boundary contact {contact} is missing from the boundary list of {group}")]
    BoundaryNotListed { contact: ContactId, group: GroupId },

    #[error("group {0} is not reachable from the root or sits on a cycle")]
    NotATree(GroupId),

    #[error("wire {wire} crosses from {from_group} to {to_group} without a boundary endpoint")]
    BoundaryCrossing {
        wire: WireId,
        from_group: GroupId,
        to_group: GroupId,
    },

    #[error("wire {wire} reaches into gadget {gadget} through non-port contact {contact}")]
    GadgetInterior {
        wire: WireId,
        gadget: GroupId,
        contact: ContactId,
    },

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("unknown contact {0}")]
    UnknownContact(ContactId),

    #[error("id {0} is used more than once")]
    IdInUse(String),

    #[error("gadget {group} uses unregistered primitive {primitive}")]
    UnknownPrimitive { group: GroupId, primitive: String },
}

/// Failure of a single external write
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PropagationError {
    #[error("write targets unknown contact {0}")]
    UnknownContact(ContactId),

    #[error("propagation did not converge: write to {contact} exceeded {limit} steps")]
    DidNotConverge { contact: ContactId, limit: usize },
}

/// A primitive refused its inputs; the gadget does not fire
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PrimitiveInputError {
    #[error("primitive {primitive} has no input port {port}")]
    UndeclaredPort { primitive: String, port: String },

    #[error("primitive {primitive} is missing input {port}")]
    MissingInput { primitive: String, port: String },

    #[error("primitive {primitive} expected {expected} on port {port}, got {actual}")]
    WrongType {
        primitive: String,
        port: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("primitive {primitive}: {reason}")]
    Invalid { primitive: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage is closed")]
    Closed,
}

/// Errors surfaced by the node lifecycle API
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node has not joined a network")]
    NotJoined,

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("contact {0} is not replicated by this node")]
    NotReplicated(ContactId),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Propagation(#[from] PropagationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
