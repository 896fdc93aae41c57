//! Blend resolution: how a contact's current content absorbs an incoming value.
//!
//! Everything here is a pure function. Callers decide what to do with the
//! resolution; a contradiction must always reach a report or a log.

use crate::types::{BlendMode, Stamp, Value};

/// Outcome of offering a value to a contact
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Settled(Value),
    /// The contact already holds what the write would produce
    Unchanged,
    Contradiction(String),
}

/// Merge a locally produced value into a contact.
///
/// `accept-last` settles to the incoming value, reported as `Unchanged` when it
/// equals the current content so bidirectional wires come to rest.
pub fn merge(current: Option<&Value>, incoming: &Value, mode: BlendMode) -> Resolution {
    match mode {
        BlendMode::AcceptLast => match current {
            Some(cur) if cur == incoming => Resolution::Unchanged,
            _ => Resolution::Settled(incoming.clone()),
        },
        BlendMode::Max => extremum(current, incoming, mode, |new, cur| new > cur),
        BlendMode::Min => extremum(current, incoming, mode, |new, cur| new < cur),
        BlendMode::Sum => {
            let Some(add) = finite_number(incoming) else {
                return mismatch(mode, incoming);
            };
            let base = match current {
                None => 0.0,
                Some(Value::Number(n)) => *n,
                Some(other) => return mismatch(mode, other),
            };
            if current.is_some() && add == 0.0 {
                Resolution::Unchanged
            } else {
                Resolution::Settled(Value::Number(base + add))
            }
        }
        BlendMode::Union => union(current, incoming),
        BlendMode::Unsupported => {
            Resolution::Contradiction("contact has an unsupported blend mode".to_string())
        }
    }
}

/// Merge a value that arrived from a peer.
///
/// Peers ship settled state, not deltas. `accept-last` and `sum` contacts keep
/// whichever state carries the newer stamp; the lattice modes merge as usual.
/// Either way a redelivered update resolves to `Unchanged`.
pub fn merge_replica(
    current: Option<(&Value, &Stamp)>,
    incoming: &Value,
    incoming_stamp: &Stamp,
    mode: BlendMode,
) -> Resolution {
    match mode {
        BlendMode::AcceptLast | BlendMode::Sum => {
            if mode == BlendMode::Sum && finite_number(incoming).is_none() {
                return mismatch(mode, incoming);
            }
            match current {
                None => Resolution::Settled(incoming.clone()),
                Some((value, stamp)) if incoming_stamp > stamp && value != incoming => {
                    Resolution::Settled(incoming.clone())
                }
                Some(_) => Resolution::Unchanged,
            }
        }
        _ => merge(current.map(|(value, _)| value), incoming, mode),
    }
}

/// Whether an update that resolved `Unchanged` should still hand its stamp
/// to the replica: a last-writer-wins contact already holding the same value
/// under an older stamp takes the newer one, so a concurrent write stamped in
/// between loses here exactly as it does on the other replicas.
pub fn adopts_stamp(
    current: Option<(&Value, &Stamp)>,
    incoming: &Value,
    incoming_stamp: &Stamp,
    mode: BlendMode,
) -> bool {
    matches!(mode, BlendMode::AcceptLast | BlendMode::Sum)
        && current.is_some_and(|(value, stamp)| value == incoming && incoming_stamp > stamp)
}

fn extremum(
    current: Option<&Value>,
    incoming: &Value,
    mode: BlendMode,
    improves: impl Fn(f64, f64) -> bool,
) -> Resolution {
    let Some(new) = finite_number(incoming) else {
        return mismatch(mode, incoming);
    };
    match current {
        None => Resolution::Settled(incoming.clone()),
        Some(Value::Number(cur)) if improves(new, *cur) => Resolution::Settled(incoming.clone()),
        Some(Value::Number(_)) => Resolution::Unchanged,
        Some(other) => mismatch(mode, other),
    }
}

fn union(current: Option<&Value>, incoming: &Value) -> Resolution {
    let additions: Vec<&Value> = match incoming {
        Value::Collection(items) => items.iter().collect(),
        single => vec![single],
    };
    let mut merged = match current {
        None => Vec::new(),
        Some(Value::Collection(items)) => items.clone(),
        Some(other) => return mismatch(BlendMode::Union, other),
    };
    let before = merged.len();
    for item in additions {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    if current.is_some() && merged.len() == before {
        Resolution::Unchanged
    } else {
        Resolution::Settled(Value::Collection(merged))
    }
}

fn finite_number(value: &Value) -> Option<f64> {
    value.as_number().filter(|n| !n.is_nan())
}

fn mismatch(mode: BlendMode, value: &Value) -> Resolution {
    Resolution::Contradiction(format!("{mode} cannot blend a {} value", value.type_name()))
}
