//! Indexed view of a network description.
//!
//! `Topology` owns a `NetworkState`, checks the structural invariants when it
//! is built and keeps the lookups the propagator needs on every step: which
//! group a contact lives in, which wires leave it, and which gadget it feeds.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::TopologyError;
use crate::primitive::Primitive;
use crate::types::*;

pub struct Topology {
    state: NetworkState,
    contact_group: HashMap<ContactId, GroupId>,
    wire_group: HashMap<WireId, GroupId>,
    outgoing: HashMap<ContactId, Vec<WireId>>,
    gadget_inputs: HashMap<ContactId, GroupId>,
    required_inputs: HashSet<ContactId>,
}

impl Topology {
    pub fn new(state: NetworkState) -> Result<Self, TopologyError> {
        let mut topology = Self {
            state,
            contact_group: HashMap::new(),
            wire_group: HashMap::new(),
            outgoing: HashMap::new(),
            gadget_inputs: HashMap::new(),
            required_inputs: HashSet::new(),
        };
        topology.reindex()?;
        Ok(topology)
    }

    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    pub fn network_id(&self) -> &str {
        &self.state.network_id
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.state.groups.get(id).map(|gs| &gs.group)
    }

    pub fn group_state(&self, id: &str) -> Option<&GroupState> {
        self.state.groups.get(id)
    }

    pub fn contact(&self, id: &str) -> Option<&Contact> {
        let group = self.contact_group.get(id)?;
        self.state.groups.get(group)?.contacts.get(id)
    }

    pub fn wire(&self, id: &str) -> Option<&Wire> {
        let group = self.wire_group.get(id)?;
        self.state.groups.get(group)?.wires.get(id)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.state.groups.values().flat_map(|gs| gs.contacts.values())
    }

    pub fn wires(&self) -> impl Iterator<Item = &Wire> {
        self.state.groups.values().flat_map(|gs| gs.wires.values())
    }

    pub fn contact_count(&self) -> usize {
        self.contact_group.len()
    }

    /// Wires a settle at `contact` flows along, with their targets, highest
    /// priority first
    pub fn fan_out(&self, contact: &str) -> Vec<(&Wire, &ContactId)> {
        let Some(ids) = self.outgoing.get(contact) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.wire(id))
            .filter_map(|wire| wire.target_from(contact).map(|target| (wire, target)))
            .collect()
    }

    /// The gadget this contact is an input port of
    pub fn gadget_for_input(&self, contact: &str) -> Option<&GroupId> {
        self.gadget_inputs.get(contact)
    }

    /// Whether a `required` wire delivers into this contact
    pub fn is_required_input(&self, contact: &str) -> bool {
        self.required_inputs.contains(contact)
    }

    pub fn input_ports(&self, gadget: &str) -> Vec<&Contact> {
        self.ports(gadget, Contact::is_input_port)
    }

    pub fn output_ports(&self, gadget: &str) -> Vec<&Contact> {
        self.ports(gadget, Contact::is_output_port)
    }

    fn ports(&self, gadget: &str, keep: fn(&Contact) -> bool) -> Vec<&Contact> {
        let Some(gs) = self.state.groups.get(gadget) else {
            return Vec::new();
        };
        gs.group
            .boundary_contact_ids
            .iter()
            .filter_map(|id| gs.contacts.get(id))
            .filter(|c| keep(c))
            .collect()
    }

    pub fn gadgets(&self) -> impl Iterator<Item = &Group> {
        self.state.groups.values().map(|gs| &gs.group).filter(|g| g.is_gadget())
    }

    /// The given groups plus everything below them
    pub fn subtree(&self, roots: &[GroupId]) -> HashSet<GroupId> {
        let mut out = HashSet::new();
        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            let Some(group) = self.group(id) else { continue };
            if out.insert(group.id.clone()) {
                stack.extend(group.subgroup_ids.iter().map(String::as_str));
            }
        }
        out
    }

    pub fn contacts_in(&self, groups: &HashSet<GroupId>) -> HashSet<ContactId> {
        groups
            .iter()
            .filter_map(|g| self.state.groups.get(g))
            .flat_map(|gs| gs.contacts.keys().cloned())
            .collect()
    }

    /// `contacts` plus every contact sharing a wire with one of them
    pub fn one_hop_closure(&self, contacts: &HashSet<ContactId>) -> HashSet<ContactId> {
        let mut closure = contacts.clone();
        for wire in self.wires() {
            if contacts.contains(&wire.from_id) {
                closure.insert(wire.to_id.clone());
            }
            if contacts.contains(&wire.to_id) {
                closure.insert(wire.from_id.clone());
            }
        }
        closure
    }

    pub fn content(&self, contact: &str) -> Option<&Value> {
        self.contact(contact).and_then(|c| c.content.as_ref())
    }

    pub fn set_content(&mut self, contact: &str, value: Value) -> bool {
        self.replace_content(contact, Some(value))
    }

    /// Overwrite a contact's content, clearing it with `None`
    pub fn replace_content(&mut self, contact: &str, content: Option<Value>) -> bool {
        let Some(group) = self.contact_group.get(contact) else {
            return false;
        };
        match self.state.groups.get_mut(group).and_then(|gs| gs.contacts.get_mut(contact)) {
            Some(c) => {
                c.content = content;
                true
            }
            None => false,
        }
    }

    /// Contact id → current content, for every contact
    pub fn snapshot(&self) -> BTreeMap<ContactId, Option<Value>> {
        self.contacts().map(|c| (c.id.clone(), c.content.clone())).collect()
    }

    fn reindex(&mut self) -> Result<(), TopologyError> {
        let root = self.state.root_group_id.clone();
        if !self.state.groups.contains_key(&root) {
            return Err(TopologyError::MissingRoot(root));
        }

        let mut contact_group = HashMap::new();
        for (group_id, gs) in &self.state.groups {
            for (id, contact) in &gs.contacts {
                if &contact.group_id != group_id || !gs.group.contact_ids.contains(id) {
                    return Err(TopologyError::ContactNotListed {
                        contact: id.clone(),
                        group: contact.group_id.clone(),
                    });
                }
                if contact.is_boundary && !gs.group.boundary_contact_ids.contains(id) {
                    return Err(TopologyError::BoundaryNotListed { contact: id.clone(), group: group_id.clone() });
                }
                if contact_group.insert(id.clone(), group_id.clone()).is_some() {
                    return Err(TopologyError::IdInUse(id.clone()));
                }
            }
            if let Some(missing) = gs.group.contact_ids.iter().find(|id| !gs.contacts.contains_key(*id)) {
                return Err(TopologyError::UnknownContact(missing.clone()));
            }
        }

        self.check_tree()?;

        let mut wire_group = HashMap::new();
        let mut outgoing: HashMap<ContactId, Vec<WireId>> = HashMap::new();
        let mut required_inputs = HashSet::new();
        for (group_id, gs) in &self.state.groups {
            for wire in gs.wires.values() {
                let ends = [&wire.from_id, &wire.to_id];
                for end in ends {
                    if !contact_group.contains_key(end) {
                        return Err(TopologyError::DanglingWire { wire: wire.id.clone(), contact: end.clone() });
                    }
                }
                self.check_crossing(wire, &contact_group)?;
                if wire_group.insert(wire.id.clone(), group_id.clone()).is_some() {
                    return Err(TopologyError::IdInUse(wire.id.clone()));
                }
                outgoing.entry(wire.from_id.clone()).or_default().push(wire.id.clone());
                if wire.kind == WireKind::Bidirectional {
                    outgoing.entry(wire.to_id.clone()).or_default().push(wire.id.clone());
                }
                if wire.required {
                    required_inputs.insert(wire.to_id.clone());
                    if wire.kind == WireKind::Bidirectional {
                        required_inputs.insert(wire.from_id.clone());
                    }
                }
            }
        }

        let mut gadget_inputs = HashMap::new();
        for gs in self.state.groups.values().filter(|gs| gs.group.is_gadget()) {
            for contact in gs.contacts.values().filter(|c| c.is_input_port()) {
                gadget_inputs.insert(contact.id.clone(), gs.group.id.clone());
            }
        }

        self.contact_group = contact_group;
        self.wire_group = wire_group;
        self.gadget_inputs = gadget_inputs;
        self.required_inputs = required_inputs;

        // sort fan-out once: priority descending, then id
        for wires in outgoing.values_mut() {
            wires.sort_by(|a, b| {
                let pa = self.wire(a).map(|w| w.priority).unwrap_or_default();
                let pb = self.wire(b).map(|w| w.priority).unwrap_or_default();
                pb.cmp(&pa).then_with(|| a.cmp(b))
            });
        }
        self.outgoing = outgoing;
        Ok(())
    }

    fn check_tree(&self) -> Result<(), TopologyError> {
        let groups = &self.state.groups;
        for (id, gs) in groups {
            if *id == self.state.root_group_id {
                if gs.group.parent_id.is_some() {
                    return Err(TopologyError::NotATree(id.clone()));
                }
                continue;
            }
            let parent = gs.group.parent_id.as_ref().ok_or_else(|| TopologyError::NotATree(id.clone()))?;
            let listed = groups.get(parent).is_some_and(|p| p.group.subgroup_ids.contains(id));
            if !listed {
                return Err(TopologyError::NotATree(id.clone()));
            }
            // walk up; more hops than groups means a cycle
            let mut cursor = parent;
            let mut hops = 0;
            while *cursor != self.state.root_group_id {
                hops += 1;
                cursor = match groups.get(cursor).and_then(|g| g.group.parent_id.as_ref()) {
                    Some(next) if hops <= groups.len() => next,
                    _ => return Err(TopologyError::NotATree(id.clone())),
                };
            }
        }
        Ok(())
    }

    fn check_crossing(&self, wire: &Wire, contact_group: &HashMap<ContactId, GroupId>) -> Result<(), TopologyError> {
        let from_group = &contact_group[&wire.from_id];
        let to_group = &contact_group[&wire.to_id];
        if from_group == to_group {
            return Ok(());
        }
        let from = &self.state.groups[from_group];
        let to = &self.state.groups[to_group];
        let from_boundary = from.contacts[&wire.from_id].is_boundary;
        let to_boundary = to.contacts[&wire.to_id].is_boundary;
        if !from_boundary && !to_boundary {
            return Err(TopologyError::BoundaryCrossing {
                wire: wire.id.clone(),
                from_group: from_group.clone(),
                to_group: to_group.clone(),
            });
        }
        for (gs, contact, boundary) in [(from, &wire.from_id, from_boundary), (to, &wire.to_id, to_boundary)] {
            if gs.group.is_gadget() && !boundary {
                return Err(TopologyError::GadgetInterior {
                    wire: wire.id.clone(),
                    gadget: gs.group.id.clone(),
                    contact: contact.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Builds a `NetworkState` with readable ids: groups keep the id they are
/// given, contacts are `group:name`, wires are `from->to`.
pub struct NetworkBuilder {
    state: NetworkState,
}

impl NetworkBuilder {
    pub fn new(network_id: &str) -> Self {
        let root = Group::new("root", "root", None);
        let mut groups = BTreeMap::new();
        groups.insert(
            root.id.clone(),
            GroupState { group: root, contacts: BTreeMap::new(), wires: BTreeMap::new() },
        );
        Self {
            state: NetworkState {
                network_id: network_id.to_string(),
                groups,
                current_group_id: "root".into(),
                root_group_id: "root".into(),
            },
        }
    }

    pub fn root(&self) -> GroupId {
        self.state.root_group_id.clone()
    }

    pub fn group(&mut self, parent: &str, id: &str) -> GroupId {
        let group = Group::new(id, id, Some(parent.to_string()));
        self.state.groups.insert(
            id.to_string(),
            GroupState { group, contacts: BTreeMap::new(), wires: BTreeMap::new() },
        );
        if let Some(gs) = self.state.groups.get_mut(parent) {
            gs.group.subgroup_ids.push(id.to_string());
        }
        id.to_string()
    }

    /// A gadget group whose ports mirror the primitive's declared inputs and
    /// outputs
    pub fn gadget(&mut self, parent: &str, id: &str, primitive: &Primitive) -> GroupId {
        let gadget = self.group(parent, id);
        if let Some(gs) = self.state.groups.get_mut(&gadget) {
            gs.group.primitive = Some(primitive.name.clone());
        }
        for input in &primitive.inputs {
            self.boundary(&gadget, &input.name, BoundaryDirection::Input, BlendMode::AcceptLast);
        }
        for output in &primitive.outputs {
            self.boundary(&gadget, output, BoundaryDirection::Output, BlendMode::AcceptLast);
        }
        gadget
    }

    pub fn contact(&mut self, group: &str, name: &str, mode: BlendMode) -> ContactId {
        self.insert_contact(group, name, mode, BoundaryDirection::None)
    }

    pub fn boundary(&mut self, group: &str, name: &str, direction: BoundaryDirection, mode: BlendMode) -> ContactId {
        self.insert_contact(group, name, mode, direction)
    }

    fn insert_contact(&mut self, group: &str, name: &str, mode: BlendMode, direction: BoundaryDirection) -> ContactId {
        let id = format!("{group}:{name}");
        let is_boundary = direction != BoundaryDirection::None;
        if let Some(gs) = self.state.groups.get_mut(group) {
            gs.group.contact_ids.push(id.clone());
            if is_boundary {
                gs.group.boundary_contact_ids.push(id.clone());
            }
            gs.contacts.insert(
                id.clone(),
                Contact {
                    id: id.clone(),
                    group_id: group.to_string(),
                    content: None,
                    blend_mode: mode,
                    name: name.to_string(),
                    is_boundary,
                    boundary_direction: direction,
                },
            );
        }
        id
    }

    pub fn wire(&mut self, from: &str, to: &str) -> WireId {
        self.wire_with(from, to, WireKind::Directed, 0, false)
    }

    pub fn required_wire(&mut self, from: &str, to: &str) -> WireId {
        self.wire_with(from, to, WireKind::Directed, 0, true)
    }

    /// Add a wire, stored in the closest group containing both endpoints
    pub fn wire_with(&mut self, from: &str, to: &str, kind: WireKind, priority: i32, required: bool) -> WireId {
        let id = format!("{from}->{to}");
        let owner = self.common_ancestor(from, to);
        if let Some(gs) = self.state.groups.get_mut(&owner) {
            gs.group.wire_ids.push(id.clone());
            gs.wires.insert(
                id.clone(),
                Wire {
                    id: id.clone(),
                    from_id: from.to_string(),
                    to_id: to.to_string(),
                    kind,
                    priority,
                    required,
                },
            );
        }
        id
    }

    pub fn build(self) -> NetworkState {
        self.state
    }

    fn group_of(&self, contact: &str) -> Option<GroupId> {
        self.state
            .groups
            .values()
            .find(|gs| gs.contacts.contains_key(contact))
            .map(|gs| gs.group.id.clone())
    }

    fn ancestors(&self, group: GroupId) -> Vec<GroupId> {
        let mut chain = vec![group];
        while let Some(parent) = chain
            .last()
            .and_then(|g| self.state.groups.get(g))
            .and_then(|gs| gs.group.parent_id.clone())
        {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
        }
        chain
    }

    fn common_ancestor(&self, from: &str, to: &str) -> GroupId {
        let (Some(a), Some(b)) = (self.group_of(from), self.group_of(to)) else {
            return self.root();
        };
        let up_b = self.ancestors(b);
        self.ancestors(a)
            .into_iter()
            .find(|g| up_b.contains(g))
            .unwrap_or_else(|| self.root())
    }
}
