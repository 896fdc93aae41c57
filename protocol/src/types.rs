use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique node identifier
pub type NodeId = String;
pub type NetworkId = String;
pub type GroupId = String;
pub type ContactId = String;
pub type WireId = String;

/// Content a contact can hold.
///
/// Serialized as plain JSON: numbers, strings, booleans, objects and arrays map
/// onto the variants one to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
    Collection(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::Collection(_) => "collection",
            Value::Record(_) => "record",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => write!(f, "{s:?}"),
            other => match serde_json::to_string(other) {
                Ok(json) => f.write_str(&json),
                Err(_) => f.write_str(other.type_name()),
            },
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Collection(items)
    }
}

/// Merge policy applied when a contact receives a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    #[default]
    AcceptLast,
    Max,
    Min,
    Sum,
    Union,
    /// Any mode name this build does not know. Every merge contradicts.
    #[serde(other)]
    Unsupported,
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlendMode::AcceptLast => "accept-last",
            BlendMode::Max => "max",
            BlendMode::Min => "min",
            BlendMode::Sum => "sum",
            BlendMode::Union => "union",
            BlendMode::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryDirection {
    Input,
    Output,
    #[default]
    None,
}

/// A mutable cell holding at most one value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub group_id: GroupId,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub blend_mode: BlendMode,
    pub name: String,
    #[serde(default)]
    pub is_boundary: bool,
    #[serde(default)]
    pub boundary_direction: BoundaryDirection,
}

impl Contact {
    pub fn is_input_port(&self) -> bool {
        self.is_boundary && self.boundary_direction == BoundaryDirection::Input
    }

    pub fn is_output_port(&self) -> bool {
        self.is_boundary && self.boundary_direction == BoundaryDirection::Output
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WireKind {
    #[default]
    Directed,
    Bidirectional,
}

/// A dependency between two contacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wire {
    pub id: WireId,
    pub from_id: ContactId,
    pub to_id: ContactId,
    #[serde(default)]
    pub kind: WireKind,
    /// Higher priority fans out first
    #[serde(default)]
    pub priority: i32,
    /// Source must hold a value before the gadget behind `to_id` may fire
    #[serde(default)]
    pub required: bool,
}

impl Wire {
    /// The endpoint a settle at `contact_id` flows into, if the wire carries
    /// values out of that contact.
    pub fn target_from(&self, contact_id: &str) -> Option<&ContactId> {
        if self.from_id == contact_id {
            Some(&self.to_id)
        } else if self.kind == WireKind::Bidirectional && self.to_id == contact_id {
            Some(&self.from_id)
        } else {
            None
        }
    }
}

/// A named scope. A group with a primitive is a gadget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<GroupId>,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub wire_ids: Vec<WireId>,
    #[serde(default)]
    pub subgroup_ids: Vec<GroupId>,
    #[serde(default)]
    pub boundary_contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub primitive: Option<String>,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>, parent_id: Option<GroupId>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id,
            contact_ids: Vec::new(),
            wire_ids: Vec::new(),
            subgroup_ids: Vec::new(),
            boundary_contact_ids: Vec::new(),
            primitive: None,
        }
    }

    pub fn is_gadget(&self) -> bool {
        self.primitive.is_some()
    }
}

/// One group with the records it owns, the unit of persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub group: Group,
    #[serde(default)]
    pub contacts: BTreeMap<ContactId, Contact>,
    #[serde(default)]
    pub wires: BTreeMap<WireId, Wire>,
}

/// A whole network description: the unit of persistence and replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub network_id: NetworkId,
    pub groups: BTreeMap<GroupId, GroupState>,
    pub current_group_id: GroupId,
    pub root_group_id: GroupId,
}

/// Lamport time of the write that settled a contact, tie-broken by node id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub time: u64,
    pub node: NodeId,
}

impl Stamp {
    pub fn new(time: u64, node: impl Into<NodeId>) -> Self {
        Self { time, node: node.into() }
    }
}

/// A contact's content as it is persisted: the value and the stamp of the
/// write that settled it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredContent {
    pub value: Value,
    pub stamp: Stamp,
}

impl StoredContent {
    pub fn new(value: Value, stamp: Stamp) -> Self {
        Self { value, stamp }
    }
}

/// Where a peer's gossip endpoint lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEndpoint {
    pub url: String,
    pub peer_id: NodeId,
}

impl PeerEndpoint {
    pub fn new(peer_id: impl Into<NodeId>, url: impl Into<String>) -> Self {
        Self { url: url.into(), peer_id: peer_id.into() }
    }
}

/// A gossip message exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GossipMessage {
    /// "This contact settled to this value"
    #[serde(rename_all = "camelCase")]
    Update {
        contact_id: ContactId,
        content: Value,
        origin_node: NodeId,
        logical_timestamp: u64,
    },
    /// "Send me what you hold for these contacts (all of them if empty)"
    #[serde(rename_all = "camelCase")]
    SyncRequest {
        sender: NodeId,
        #[serde(default)]
        contacts: Vec<ContactId>,
    },
    /// Liveness probe, echoed back by the receiver
    #[serde(rename_all = "camelCase")]
    Heartbeat { sender: NodeId, nonce: u64 },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Update { .. } => "update",
            GossipMessage::SyncRequest { .. } => "sync-request",
            GossipMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Response to a gossip message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipResponse {
    pub node_id: NodeId,
    #[serde(default)]
    pub replies: Vec<GossipMessage>,
}
