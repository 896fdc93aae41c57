//! Propagation to a fixpoint, and the two ways of scheduling it.
//!
//! `Propagator` owns a node's replica of the network and runs one external
//! write at a time until nothing more changes. `ImmediateScheduler` runs each
//! write as it arrives; `BatchScheduler` queues writes and runs them in
//! flushes. Both feed the same propagator, so final values do not depend on
//! which one is used.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, Mutex};

use crate::blend::{self, Resolution};
use crate::config::{SchedulerConfig, SchedulerMode};
use crate::error::{PrimitiveInputError, PropagationError, TopologyError};
use crate::network::Topology;
use crate::primitive::{self, Ports, PrimitiveRegistry};
use crate::types::*;

/// Where a write came from
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOrigin {
    /// Produced on this node
    Local,
    /// Settled state shipped by a peer
    Remote(Stamp),
}

#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub contact_id: ContactId,
    pub value: Value,
    pub origin: WriteOrigin,
    pub queued_at: Instant,
}

impl PendingWrite {
    pub fn local(contact_id: impl Into<ContactId>, value: Value) -> Self {
        Self { contact_id: contact_id.into(), value, origin: WriteOrigin::Local, queued_at: Instant::now() }
    }

    pub fn remote(contact_id: impl Into<ContactId>, value: Value, stamp: Stamp) -> Self {
        Self {
            contact_id: contact_id.into(),
            value,
            origin: WriteOrigin::Remote(stamp),
            queued_at: Instant::now(),
        }
    }
}

/// Lifecycle of one pending write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteState {
    Queued,
    Merging,
    Settled,
    Unchanged,
    Contradicted,
}

/// A contact that settled to a new value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactChange {
    pub contact_id: ContactId,
    pub group_id: GroupId,
    pub value: Value,
    pub stamp: Stamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionRecord {
    pub contact_id: ContactId,
    pub reason: String,
}

/// A gadget that refused its inputs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GadgetFailure {
    pub gadget: GroupId,
    #[serde(serialize_with = "as_message")]
    pub error: PrimitiveInputError,
}

fn as_message<S: Serializer>(error: &PrimitiveInputError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Everything one external write caused
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationReport {
    /// The contact the external write targeted
    #[serde(rename = "contactId")]
    pub write: ContactId,
    /// How the external write itself resolved
    pub state: WriteState,
    pub settled: Vec<ContactChange>,
    pub contradictions: Vec<ContradictionRecord>,
    pub fired: Vec<GroupId>,
    pub gadget_errors: Vec<GadgetFailure>,
    pub unchanged: usize,
    pub iterations: usize,
}

impl PropagationReport {
    fn new(write: &str) -> Self {
        Self {
            write: write.to_string(),
            state: WriteState::Queued,
            settled: Vec::new(),
            contradictions: Vec::new(),
            fired: Vec::new(),
            gadget_errors: Vec::new(),
            unchanged: 0,
            iterations: 0,
        }
    }
}

pub type Outcome = Result<PropagationReport, PropagationError>;

/// Which contacts this propagator may write and which gadgets it may fire.
/// `None` means no restriction.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    contacts: Option<HashSet<ContactId>>,
    gadgets: Option<HashSet<GroupId>>,
}

impl Scope {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn limited(contacts: HashSet<ContactId>, gadgets: HashSet<GroupId>) -> Self {
        Self { contacts: Some(contacts), gadgets: Some(gadgets) }
    }

    pub fn writes(&self, contact: &str) -> bool {
        self.contacts.as_ref().map_or(true, |set| set.contains(contact))
    }

    pub fn fires(&self, gadget: &str) -> bool {
        self.gadgets.as_ref().map_or(true, |set| set.contains(gadget))
    }
}

struct Step {
    contact: ContactId,
    value: Value,
    remote: Option<Stamp>,
}

/// State one write overwrote, kept so a write that does not converge can be
/// undone
#[derive(Default)]
struct Journal {
    contacts: HashMap<ContactId, (Option<Value>, Option<Stamp>)>,
    fired: HashMap<GroupId, Option<Ports>>,
}

pub struct Propagator {
    topology: Topology,
    primitives: Arc<PrimitiveRegistry>,
    scope: Scope,
    node_id: NodeId,
    clock: u64,
    stamps: HashMap<ContactId, Stamp>,
    last_fired: HashMap<GroupId, Ports>,
    max_iterations: usize,
}

impl Propagator {
    /// Build a propagator over `topology`. Every gadget must name a registered
    /// primitive.
    pub fn new(
        topology: Topology,
        primitives: Arc<PrimitiveRegistry>,
        node_id: impl Into<NodeId>,
        max_iterations: usize,
    ) -> Result<Self, TopologyError> {
        for gadget in topology.gadgets() {
            let name = gadget.primitive.as_deref().unwrap_or_default();
            if !primitives.contains(name) {
                return Err(TopologyError::UnknownPrimitive { group: gadget.id.clone(), primitive: name.to_string() });
            }
        }
        let node_id = node_id.into();
        // content already present in the description counts as settled at time 0
        let stamps = topology
            .contacts()
            .filter(|c| c.content.is_some())
            .map(|c| (c.id.clone(), Stamp::new(0, node_id.clone())))
            .collect();
        Ok(Self {
            topology,
            primitives,
            scope: Scope::everything(),
            node_id,
            clock: 0,
            stamps,
            last_fired: HashMap::new(),
            max_iterations,
        })
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn content(&self, contact: &str) -> Option<&Value> {
        self.topology.content(contact)
    }

    pub fn stamp(&self, contact: &str) -> Option<&Stamp> {
        self.stamps.get(contact)
    }

    /// Current Lamport time
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Place persisted content without propagating it. The clock moves past
    /// the restored stamp so later local writes still win.
    pub fn seed(&mut self, contact: &str, stored: StoredContent) -> bool {
        if !self.topology.set_content(contact, stored.value) {
            return false;
        }
        self.clock = self.clock.max(stored.stamp.time);
        self.stamps.insert(contact.to_string(), stored.stamp);
        true
    }

    /// Contacts in scope holding a value, restricted to `filter` unless it is
    /// empty
    pub fn held(&self, filter: &[ContactId]) -> Vec<ContactChange> {
        let wanted: HashSet<&str> = filter.iter().map(String::as_str).collect();
        self.topology
            .contacts()
            .filter(|c| wanted.is_empty() || wanted.contains(c.id.as_str()))
            .filter(|c| self.scope.writes(&c.id))
            .filter_map(|c| {
                let value = c.content.clone()?;
                let stamp = self.stamps.get(&c.id).cloned().unwrap_or_else(|| Stamp::new(0, self.node_id.clone()));
                Some(ContactChange { contact_id: c.id.clone(), group_id: c.group_id.clone(), value, stamp })
            })
            .collect()
    }

    /// Run one external write to a fixpoint.
    ///
    /// Fails with `DidNotConverge` once the write has taken `max_iterations`
    /// steps; whatever is still queued for it is dropped and everything it
    /// already settled is rolled back.
    pub fn propagate(&mut self, write: PendingWrite) -> Outcome {
        if self.topology.contact(&write.contact_id).is_none() {
            return Err(PropagationError::UnknownContact(write.contact_id));
        }
        let mut report = PropagationReport::new(&write.contact_id);
        let remote = match write.origin {
            WriteOrigin::Local => None,
            WriteOrigin::Remote(stamp) => Some(stamp),
        };
        let mut queue = VecDeque::from([Step { contact: write.contact_id.clone(), value: write.value, remote }]);
        let mut journal = Journal::default();

        while let Some(step) = queue.pop_front() {
            report.iterations += 1;
            if report.iterations > self.max_iterations {
                tracing::error!(
                    contact = %write.contact_id,
                    limit = self.max_iterations,
                    discarded = queue.len(),
                    rolled_back = journal.contacts.len(),
                    "Propagation did not converge"
                );
                self.roll_back(journal);
                return Err(PropagationError::DidNotConverge { contact: write.contact_id, limit: self.max_iterations });
            }
            let state = self.apply(step, &mut report, &mut queue, &mut journal);
            if report.iterations == 1 {
                report.state = state;
            }
        }
        Ok(report)
    }

    fn remember(&self, journal: &mut Journal, contact: &str) {
        journal
            .contacts
            .entry(contact.to_string())
            .or_insert_with(|| (self.topology.content(contact).cloned(), self.stamps.get(contact).cloned()));
    }

    fn roll_back(&mut self, journal: Journal) {
        for (contact, (content, stamp)) in journal.contacts {
            self.topology.replace_content(&contact, content);
            match stamp {
                Some(stamp) => self.stamps.insert(contact, stamp),
                None => self.stamps.remove(&contact),
            };
        }
        for (gadget, inputs) in journal.fired {
            match inputs {
                Some(inputs) => self.last_fired.insert(gadget, inputs),
                None => self.last_fired.remove(&gadget),
            };
        }
    }

    fn apply(
        &mut self,
        step: Step,
        report: &mut PropagationReport,
        queue: &mut VecDeque<Step>,
        journal: &mut Journal,
    ) -> WriteState {
        if let Some(stamp) = &step.remote {
            self.clock = self.clock.max(stamp.time);
        }
        if !self.scope.writes(&step.contact) {
            return WriteState::Unchanged;
        }
        let Some(contact) = self.topology.contact(&step.contact) else {
            return WriteState::Unchanged;
        };
        let group_id = contact.group_id.clone();
        let current = contact.content.as_ref().zip(self.stamps.get(&step.contact));

        tracing::trace!(contact = %step.contact, state = ?WriteState::Merging, "Merging write");
        let resolution = match &step.remote {
            Some(stamp) => blend::merge_replica(current, &step.value, stamp, contact.blend_mode),
            None => blend::merge(contact.content.as_ref(), &step.value, contact.blend_mode),
        };

        match resolution {
            Resolution::Unchanged => {
                if let Some(stamp) = &step.remote {
                    if blend::adopts_stamp(current, &step.value, stamp, contact.blend_mode) {
                        self.remember(journal, &step.contact);
                        self.stamps.insert(step.contact.clone(), stamp.clone());
                    }
                }
                report.unchanged += 1;
                WriteState::Unchanged
            }
            Resolution::Contradiction(reason) => {
                tracing::warn!(contact = %step.contact, %reason, "Contradiction, propagation halted for this write");
                report.contradictions.push(ContradictionRecord { contact_id: step.contact, reason });
                WriteState::Contradicted
            }
            Resolution::Settled(value) => {
                let stamp = match step.remote {
                    Some(stamp) => stamp,
                    None => {
                        self.clock += 1;
                        Stamp::new(self.clock, self.node_id.clone())
                    }
                };
                self.remember(journal, &step.contact);
                self.topology.set_content(&step.contact, value.clone());
                self.stamps.insert(step.contact.clone(), stamp.clone());

                for (_, target) in self.topology.fan_out(&step.contact) {
                    if self.scope.writes(target) {
                        queue.push_back(Step { contact: target.clone(), value: value.clone(), remote: None });
                    }
                }
                if let Some(gadget) = self.topology.gadget_for_input(&step.contact).cloned() {
                    self.try_fire(&gadget, report, queue, journal);
                }

                report.settled.push(ContactChange { contact_id: step.contact, group_id, value, stamp });
                WriteState::Settled
            }
        }
    }

    fn try_fire(
        &mut self,
        gadget: &GroupId,
        report: &mut PropagationReport,
        queue: &mut VecDeque<Step>,
        journal: &mut Journal,
    ) {
        if !self.scope.fires(gadget) {
            return;
        }
        let Some(name) = self.topology.group(gadget).and_then(|g| g.primitive.clone()) else {
            return;
        };
        let Some(primitive) = self.primitives.get(&name) else {
            tracing::warn!(gadget = %gadget, primitive = %name, "Gadget names an unregistered primitive");
            return;
        };

        let mut inputs = Ports::new();
        for port in self.topology.input_ports(gadget) {
            match &port.content {
                Some(value) => {
                    inputs.insert(port.name.clone(), value.clone());
                }
                None if self.topology.is_required_input(&port.id) => {
                    tracing::trace!(gadget = %gadget, port = %port.name, "Waiting on required input");
                    return;
                }
                None => {
                    let no_default = primitive.input(&port.name).is_some_and(|spec| spec.default.is_none());
                    if no_default {
                        return;
                    }
                }
            }
        }

        if self.last_fired.get(gadget) == Some(&inputs) {
            return;
        }

        match primitive::fire(gadget, &primitive, &inputs) {
            Ok(outputs) => {
                for port in self.topology.output_ports(gadget) {
                    if let Some(value) = outputs.get(&port.name) {
                        queue.push_back(Step { contact: port.id.clone(), value: value.clone(), remote: None });
                    }
                }
                let previous = self.last_fired.insert(gadget.clone(), inputs);
                journal.fired.entry(gadget.clone()).or_insert(previous);
                report.fired.push(gadget.clone());
            }
            Err(e) => {
                tracing::warn!(gadget = %gadget, error = %e, "Gadget did not fire");
                report.gadget_errors.push(GadgetFailure { gadget: gadget.clone(), error: e });
            }
        }
    }
}

/// Runs every write to a fixpoint before returning
pub struct ImmediateScheduler {
    engine: Arc<Mutex<Propagator>>,
}

impl ImmediateScheduler {
    pub fn new(engine: Arc<Mutex<Propagator>>) -> Self {
        Self { engine }
    }

    pub async fn submit(&self, write: PendingWrite) -> Outcome {
        self.engine.lock().await.propagate(write)
    }
}

/// Queues writes and runs them in flushes.
///
/// A flush starts in the background once `batch_size` writes are queued or
/// `batch_delay` after the first unflushed write. Background flush outcomes go
/// out on the channel returned by `new`.
pub struct BatchScheduler {
    engine: Arc<Mutex<Propagator>>,
    queue: Mutex<VecDeque<PendingWrite>>,
    batch_size: usize,
    batch_delay: Duration,
    timer_armed: AtomicBool,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl BatchScheduler {
    pub fn new(
        engine: Arc<Mutex<Propagator>>,
        batch_size: usize,
        batch_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            engine,
            queue: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            batch_delay,
            timer_armed: AtomicBool::new(false),
            outcomes: tx,
        });
        (scheduler, rx)
    }

    pub async fn enqueue(self: &Arc<Self>, write: PendingWrite) {
        let queued = {
            let mut queue = self.queue.lock().await;
            queue.push_back(write);
            queue.len()
        };
        if queued >= self.batch_size {
            self.spawn_flush(Duration::ZERO);
        } else if !self.timer_armed.swap(true, Ordering::SeqCst) {
            self.spawn_flush(self.batch_delay);
        }
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Process everything queued right now, in `batch_size` chunks
    pub async fn flush(&self) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        loop {
            let chunk = self.flush_once().await;
            if chunk.is_empty() {
                break;
            }
            outcomes.extend(chunk);
        }
        outcomes
    }

    async fn flush_once(&self) -> Vec<Outcome> {
        // take the engine first so concurrent flushes drain the queue in order
        let mut engine = self.engine.lock().await;
        let batch: Vec<PendingWrite> = {
            let mut queue = self.queue.lock().await;
            let take = queue.len().min(self.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return Vec::new();
        }
        tracing::debug!(writes = batch.len(), "Flushing batch");
        batch.into_iter().map(|write| engine.propagate(write)).collect()
    }

    fn spawn_flush(self: &Arc<Self>, after: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !after.is_zero() {
                tokio::time::sleep(after).await;
                this.timer_armed.store(false, Ordering::SeqCst);
            }
            this.background_flush().await;
        });
    }

    async fn background_flush(self: &Arc<Self>) {
        for outcome in self.flush_once().await {
            if self.outcomes.send(outcome).is_err() {
                tracing::debug!("Flush outcome dropped, receiver gone");
            }
        }
        if self.pending().await > 0 {
            self.spawn_flush(Duration::ZERO);
        }
    }
}

/// The scheduling strategy a node runs with
pub enum Scheduler {
    Immediate(ImmediateScheduler),
    Batch(Arc<BatchScheduler>),
}

impl Scheduler {
    /// Build the strategy `config` asks for. Batch mode also returns the
    /// receiver for background flush outcomes.
    pub fn new(
        engine: Arc<Mutex<Propagator>>,
        config: &SchedulerConfig,
    ) -> (Self, Option<mpsc::UnboundedReceiver<Outcome>>) {
        match config.mode {
            SchedulerMode::Immediate => (Scheduler::Immediate(ImmediateScheduler::new(engine)), None),
            SchedulerMode::Batch => {
                let (batch, rx) = BatchScheduler::new(engine, config.batch_size, config.batch_delay());
                (Scheduler::Batch(batch), Some(rx))
            }
        }
    }

    /// Hand a write to the scheduler. Immediate mode returns its outcome;
    /// batch mode queues it and returns nothing.
    pub async fn submit(&self, write: PendingWrite) -> Vec<Outcome> {
        match self {
            Scheduler::Immediate(immediate) => vec![immediate.submit(write).await],
            Scheduler::Batch(batch) => {
                batch.enqueue(write).await;
                Vec::new()
            }
        }
    }

    pub async fn flush(&self) -> Vec<Outcome> {
        match self {
            Scheduler::Immediate(_) => Vec::new(),
            Scheduler::Batch(batch) => batch.flush().await,
        }
    }

    pub async fn pending(&self) -> usize {
        match self {
            Scheduler::Immediate(_) => 0,
            Scheduler::Batch(batch) => batch.pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkBuilder;

    struct AddNet {
        state: NetworkState,
        a: ContactId,
        b: ContactId,
        r: ContactId,
    }

    /// A and B feed an `add` gadget whose sum lands in R
    fn add_net(required: bool) -> AddNet {
        let registry = PrimitiveRegistry::with_builtins();
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let a = nb.contact(&root, "A", BlendMode::AcceptLast);
        let b = nb.contact(&root, "B", BlendMode::AcceptLast);
        let r = nb.contact(&root, "R", BlendMode::AcceptLast);
        let adder = nb.gadget(&root, "adder", &registry.get("add").unwrap());
        if required {
            nb.required_wire(&a, &format!("{adder}:a"));
            nb.required_wire(&b, &format!("{adder}:b"));
        } else {
            nb.wire(&a, &format!("{adder}:a"));
            nb.wire(&b, &format!("{adder}:b"));
        }
        nb.wire(&format!("{adder}:sum"), &r);
        AddNet { state: nb.build(), a, b, r }
    }

    fn propagator(state: NetworkState) -> Propagator {
        let topology = Topology::new(state).unwrap();
        Propagator::new(topology, Arc::new(PrimitiveRegistry::with_builtins()), "node0", 1_000).unwrap()
    }

    #[test]
    fn test_add_gadget_example() {
        let net = add_net(false);
        let mut p = propagator(net.state);
        p.propagate(PendingWrite::local(&net.a, 5.into())).unwrap();
        assert_eq!(p.content(&net.r), None);
        p.propagate(PendingWrite::local(&net.b, 3.into())).unwrap();
        assert_eq!(p.content(&net.r), Some(&Value::Number(8.0)));
        let report = p.propagate(PendingWrite::local(&net.a, 10.into())).unwrap();
        assert_eq!(p.content(&net.r), Some(&Value::Number(13.0)));
        assert_eq!(report.state, WriteState::Settled);
        assert_eq!(report.fired, vec!["adder".to_string()]);
    }

    #[test]
    fn test_required_inputs_gate_firing() {
        let net = add_net(true);
        let mut p = propagator(net.state);
        let first = p.propagate(PendingWrite::local(&net.a, 5.into())).unwrap();
        assert!(first.fired.is_empty());
        assert!(first.gadget_errors.is_empty());

        let second = p.propagate(PendingWrite::local(&net.b, 3.into())).unwrap();
        assert_eq!(second.fired.len(), 1);

        // same inputs again: nothing fires, nothing settles
        let again = p.propagate(PendingWrite::local(&net.b, 3.into())).unwrap();
        assert_eq!(again.state, WriteState::Unchanged);
        assert!(again.fired.is_empty());
        assert!(again.settled.is_empty());
    }

    #[test]
    fn test_gadget_error_means_no_outputs() {
        let net = add_net(false);
        let mut p = propagator(net.state);
        p.propagate(PendingWrite::local(&net.a, 1.into())).unwrap();
        let report = p.propagate(PendingWrite::local(&net.b, "oops".into())).unwrap();
        assert!(report.fired.is_empty());
        assert_eq!(report.gadget_errors.len(), 1);
        assert_eq!(p.content(&net.r), None);
    }

    #[test]
    fn test_sum_cycle_does_not_converge() {
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let x = nb.contact(&root, "x", BlendMode::Sum);
        let y = nb.contact(&root, "y", BlendMode::Sum);
        nb.wire_with(&x, &y, WireKind::Bidirectional, 0, false);
        let other = nb.contact(&root, "other", BlendMode::AcceptLast);
        let mut p = propagator(nb.build());
        p.seed(&x, StoredContent::new(2.into(), Stamp::new(3, "node1")));

        let err = p.propagate(PendingWrite::local(&x, 1.into())).unwrap_err();
        assert_eq!(err, PropagationError::DidNotConverge { contact: x.clone(), limit: 1_000 });

        // everything the write settled is undone
        assert_eq!(p.content(&x), Some(&Value::Number(2.0)));
        assert_eq!(p.stamp(&x), Some(&Stamp::new(3, "node1")));
        assert_eq!(p.content(&y), None);
        assert_eq!(p.stamp(&y), None);
        assert!(p.held(&[]).iter().all(|c| c.contact_id == x));

        // the network stays usable
        p.propagate(PendingWrite::local(&other, 2.into())).unwrap();
        assert_eq!(p.content(&other), Some(&Value::Number(2.0)));
    }

    #[test]
    fn test_bidirectional_accept_last_comes_to_rest() {
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let x = nb.contact(&root, "x", BlendMode::AcceptLast);
        let y = nb.contact(&root, "y", BlendMode::AcceptLast);
        nb.wire_with(&x, &y, WireKind::Bidirectional, 0, false);
        let mut p = propagator(nb.build());
        p.propagate(PendingWrite::local(&y, 4.into())).unwrap();
        assert_eq!(p.content(&x), Some(&Value::Number(4.0)));
        let report = p.propagate(PendingWrite::local(&x, 9.into())).unwrap();
        assert_eq!(p.content(&y), Some(&Value::Number(9.0)));
        assert_eq!(report.iterations, 3);
    }

    #[test]
    fn test_contradiction_halts_branch_only() {
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let src = nb.contact(&root, "src", BlendMode::AcceptLast);
        let peak = nb.contact(&root, "peak", BlendMode::Max);
        let copy = nb.contact(&root, "copy", BlendMode::AcceptLast);
        let after_peak = nb.contact(&root, "after", BlendMode::AcceptLast);
        nb.wire(&src, &peak);
        nb.wire(&src, &copy);
        nb.wire(&peak, &after_peak);
        let mut p = propagator(nb.build());

        let report = p.propagate(PendingWrite::local(&src, "text".into())).unwrap();
        assert_eq!(report.contradictions.len(), 1);
        assert_eq!(report.contradictions[0].contact_id, peak);
        assert_eq!(p.content(&copy), Some(&Value::from("text")));
        assert_eq!(p.content(&after_peak), None);
    }

    #[test]
    fn test_higher_priority_settles_first() {
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let src = nb.contact(&root, "src", BlendMode::AcceptLast);
        let low = nb.contact(&root, "low", BlendMode::AcceptLast);
        let high = nb.contact(&root, "high", BlendMode::AcceptLast);
        nb.wire_with(&src, &low, WireKind::Directed, 0, false);
        nb.wire_with(&src, &high, WireKind::Directed, 10, false);
        let mut p = propagator(nb.build());
        let report = p.propagate(PendingWrite::local(&src, 1.into())).unwrap();
        let order: Vec<&str> = report.settled.iter().map(|c| c.contact_id.as_str()).collect();
        assert_eq!(order, vec!["root:src", "root:high", "root:low"]);
    }

    #[test]
    fn test_scope_limits_writes_and_firing() {
        let net = add_net(false);
        let topology = Topology::new(net.state).unwrap();
        let contacts: HashSet<ContactId> = [net.a.clone(), net.b.clone(), "adder:a".into(), "adder:b".into()].into();
        let mut p = Propagator::new(topology, Arc::new(PrimitiveRegistry::with_builtins()), "node0", 100)
            .unwrap()
            .with_scope(Scope::limited(contacts, HashSet::new()));
        p.propagate(PendingWrite::local(&net.a, 1.into())).unwrap();
        let report = p.propagate(PendingWrite::local(&net.b, 2.into())).unwrap();
        assert!(report.fired.is_empty());
        assert_eq!(p.content("adder:b"), Some(&Value::Number(2.0)));
        assert_eq!(p.content(&net.r), None);
    }

    #[test]
    fn test_remote_redelivery_is_idempotent() {
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let total = nb.contact(&root, "total", BlendMode::Sum);
        let mut p = propagator(nb.build());
        let stamp = Stamp::new(7, "node1");
        for _ in 0..3 {
            p.propagate(PendingWrite::remote(&total, 5.into(), stamp.clone())).unwrap();
        }
        assert_eq!(p.content(&total), Some(&Value::Number(5.0)));
        assert_eq!(p.stamp(&total), Some(&stamp));
        // the clock has seen the remote time
        p.propagate(PendingWrite::local(&total, 1.into())).unwrap();
        assert_eq!(p.stamp(&total).map(|s| s.time), Some(8));
    }

    #[test]
    fn test_equal_remote_value_moves_the_stamp_forward() {
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let x = nb.contact(&root, "x", BlendMode::AcceptLast);
        let mut p = propagator(nb.build());

        p.propagate(PendingWrite::remote(&x, 7.into(), Stamp::new(5, "node1"))).unwrap();
        let report = p.propagate(PendingWrite::remote(&x, 7.into(), Stamp::new(9, "node2"))).unwrap();
        assert_eq!(report.state, WriteState::Unchanged);
        assert!(report.settled.is_empty());
        assert_eq!(p.stamp(&x), Some(&Stamp::new(9, "node2")));

        // a write stamped between the two loses, as it does on every replica
        p.propagate(PendingWrite::remote(&x, 1.into(), Stamp::new(7, "node3"))).unwrap();
        assert_eq!(p.content(&x), Some(&Value::Number(7.0)));
    }

    #[test]
    fn test_seed_restores_stamp_and_clock() {
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let x = nb.contact(&root, "x", BlendMode::AcceptLast);
        let mut p = propagator(nb.build());

        assert!(p.seed(&x, StoredContent::new(5.into(), Stamp::new(12, "node0"))));
        assert!(!p.seed("missing", StoredContent::new(5.into(), Stamp::new(1, "node0"))));
        assert_eq!(p.clock(), 12);

        let report = p.propagate(PendingWrite::local(&x, 6.into())).unwrap();
        assert_eq!(report.settled[0].stamp, Stamp::new(13, "node0"));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let net = add_net(false);
        let mut p = propagator(net.state);
        p.propagate(PendingWrite::local(&net.a, 1.into())).unwrap();
        let report = p.propagate(PendingWrite::local(&net.b, "oops".into())).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["contactId"], "root:B");
        assert_eq!(json["state"], "settled");
        assert_eq!(json["settled"][0]["contactId"], "root:B");
        assert_eq!(json["settled"][0]["stamp"]["node"], "node0");
        assert_eq!(json["gadgetErrors"][0]["gadget"], "adder");
        assert!(json["gadgetErrors"][0]["error"].as_str().unwrap().contains("add"));
        assert_eq!(json["unchanged"], 0);
    }

    #[test]
    fn test_unknown_contact_is_rejected() {
        let mut p = propagator(add_net(false).state);
        assert_eq!(
            p.propagate(PendingWrite::local("nope", 1.into())),
            Err(PropagationError::UnknownContact("nope".into()))
        );
    }

    /// An acyclic graph mixing every blend mode and two gadgets
    fn mixed_net() -> NetworkState {
        let registry = PrimitiveRegistry::with_builtins();
        let mut nb = NetworkBuilder::new("net");
        let root = nb.root();
        let a = nb.contact(&root, "a", BlendMode::AcceptLast);
        let b = nb.contact(&root, "b", BlendMode::AcceptLast);
        let peak = nb.contact(&root, "peak", BlendMode::Max);
        let low = nb.contact(&root, "low", BlendMode::Min);
        let total = nb.contact(&root, "total", BlendMode::Sum);
        let seen = nb.contact(&root, "seen", BlendMode::Union);
        let product = nb.contact(&root, "product", BlendMode::AcceptLast);
        let adder = nb.gadget(&root, "adder", &registry.get("add").unwrap());
        let times = nb.gadget(&root, "times", &registry.get("multiply").unwrap());
        nb.wire(&a, &format!("{adder}:a"));
        nb.wire(&b, &format!("{adder}:b"));
        nb.wire(&format!("{adder}:sum"), &peak);
        nb.wire(&format!("{adder}:sum"), &low);
        nb.wire(&format!("{adder}:sum"), &total);
        nb.wire(&format!("{adder}:sum"), &seen);
        nb.wire(&format!("{adder}:sum"), &format!("{times}:a"));
        nb.wire(&b, &format!("{times}:b"));
        nb.wire(&format!("{times}:product"), &product);
        nb.build()
    }

    fn mixed_writes() -> Vec<(&'static str, f64)> {
        vec![("root:a", 1.0), ("root:b", 2.0), ("root:a", 7.0), ("root:b", -3.0), ("root:a", 7.0), ("root:b", 4.0)]
    }

    #[tokio::test]
    async fn test_batch_matches_immediate() {
        let immediate = Arc::new(Mutex::new(propagator(mixed_net())));
        let scheduler = ImmediateScheduler::new(immediate.clone());
        for (contact, value) in mixed_writes() {
            scheduler.submit(PendingWrite::local(contact, value.into())).await.unwrap();
        }

        let batched = Arc::new(Mutex::new(propagator(mixed_net())));
        let (batch, _rx) = BatchScheduler::new(batched.clone(), 4, Duration::from_secs(60));
        for (contact, value) in mixed_writes() {
            batch.enqueue(PendingWrite::local(contact, value.into())).await;
        }
        batch.flush().await;
        assert_eq!(batch.pending().await, 0);

        let left = immediate.lock().await.topology().snapshot();
        let right = batched.lock().await.topology().snapshot();
        assert_eq!(left, right);
        assert_eq!(left["root:product"], Some(Value::Number(44.0)));
        assert_eq!(left["root:peak"], Some(Value::Number(11.0)));
    }

    #[tokio::test]
    async fn test_batch_flushes_when_full() {
        let engine = Arc::new(Mutex::new(propagator(mixed_net())));
        let (batch, mut rx) = BatchScheduler::new(engine.clone(), 2, Duration::from_secs(60));
        batch.enqueue(PendingWrite::local("root:a", 1.into())).await;
        assert_eq!(batch.pending().await, 1);
        batch.enqueue(PendingWrite::local("root:b", 2.into())).await;

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.unwrap().write, "root:a");
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.unwrap().write, "root:b");
        assert_eq!(engine.lock().await.content("root:product"), Some(&Value::Number(6.0)));
    }

    #[tokio::test]
    async fn test_batch_flushes_after_delay() {
        let engine = Arc::new(Mutex::new(propagator(mixed_net())));
        let (batch, mut rx) = BatchScheduler::new(engine.clone(), 100, Duration::from_millis(20));
        batch.enqueue(PendingWrite::local("root:a", 5.into())).await;
        assert_eq!(engine.lock().await.content("root:a"), None);

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap().state, WriteState::Settled);
        assert_eq!(engine.lock().await.content("root:a"), Some(&Value::Number(5.0)));
        assert_eq!(batch.pending().await, 0);
    }

    #[tokio::test]
    async fn test_scheduler_modes() {
        let config = SchedulerConfig { mode: SchedulerMode::Batch, batch_delay_ms: 60_000, ..Default::default() };
        let engine = Arc::new(Mutex::new(propagator(mixed_net())));
        let (scheduler, rx) = Scheduler::new(engine.clone(), &config);
        assert!(rx.is_some());
        assert!(scheduler.submit(PendingWrite::local("root:a", 1.into())).await.is_empty());
        assert_eq!(scheduler.pending().await, 1);
        let flushed = scheduler.flush().await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(scheduler.pending().await, 0);

        let (immediate, rx) = Scheduler::new(engine, &SchedulerConfig::default());
        assert!(rx.is_none());
        let outcomes = immediate.submit(PendingWrite::local("root:b", 1.into())).await;
        assert_eq!(outcomes.len(), 1);
    }
}
