//! Ownership of groups and the wire-aware convergence metric.
//!
//! A node owns a set of groups (each with its subtree) and replicates its
//! expected set: owned contacts plus every contact one wire away from them.
//! Convergence is measured against that set rather than the whole network.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::TopologyError;
use crate::network::Topology;
use crate::types::*;

/// What a node is responsible for in a topology
#[derive(Debug, Clone, Default)]
pub struct Ownership {
    pub groups: HashSet<GroupId>,
    pub gadgets: HashSet<GroupId>,
    pub contacts: HashSet<ContactId>,
    pub expected: HashSet<ContactId>,
}

impl Ownership {
    pub fn assign(topology: &Topology, owned: &[GroupId]) -> Result<Self, TopologyError> {
        if let Some(unknown) = owned.iter().find(|g| topology.group(g).is_none()) {
            return Err(TopologyError::UnknownGroup(unknown.clone()));
        }
        let groups = topology.subtree(owned);
        let gadgets = topology
            .gadgets()
            .filter(|g| groups.contains(&g.id))
            .map(|g| g.id.clone())
            .collect();
        let contacts = topology.contacts_in(&groups);
        let expected = topology.one_hop_closure(&contacts);
        Ok(Self { groups, gadgets, contacts, expected })
    }

    pub fn expects(&self, contact: &str) -> bool {
        self.expected.contains(contact)
    }

    /// Expected contacts in a stable order, for sync requests
    pub fn expected_sorted(&self) -> Vec<ContactId> {
        let mut ids: Vec<ContactId> = self.expected.iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceReport {
    /// Share of the expected set holding content
    pub ratio: f64,
    /// Share of every contact in the network holding content locally
    pub global_replication: f64,
    pub expected: usize,
    pub replicated: usize,
    pub held: usize,
    pub total: usize,
}

/// `|held ∩ expected| / |expected|`, 1.0 when nothing is expected
pub fn convergence_ratio(held: &HashSet<ContactId>, expected: &HashSet<ContactId>) -> f64 {
    if expected.is_empty() {
        return 1.0;
    }
    let replicated = expected.iter().filter(|id| held.contains(*id)).count();
    replicated as f64 / expected.len() as f64
}

pub fn measure(topology: &Topology, expected: &HashSet<ContactId>) -> ConvergenceReport {
    let held: HashSet<ContactId> = topology.contacts().filter(|c| c.content.is_some()).map(|c| c.id.clone()).collect();
    let total = topology.contact_count();
    let replicated = expected.iter().filter(|id| held.contains(*id)).count();
    ConvergenceReport {
        ratio: convergence_ratio(&held, expected),
        global_replication: if total == 0 { 1.0 } else { held.len() as f64 / total as f64 },
        expected: expected.len(),
        replicated,
        held: held.len(),
        total,
    }
}
