//! Preference resolution: turns the competing preferences of one slot into a
//! single selected value or an impasse.
//!
//! Resolution order:
//! 1. Veto: any value with a `prohibit` or `reject` preference is eliminated
//! 2. Require: a single surviving required value wins outright and more than
//!    one is a constraint failure. A required value that is only rejected
//!    drops out, but a prohibited one fails the slot when no other
//!    requirement survives
//! 3. Candidates: the remaining acceptable values, in creation order
//! 4. Binary `better`/`worse` preferences induce a partial order; dominated
//!    candidates drop out and a cycle is a conflict
//! 5. `best` promotes, `worst` demotes (never emptying the set)
//! 6. One survivor wins; several mutually indifferent survivors yield the
//!    earliest-created one; otherwise the survivors tie
//!
//! The same procedure backs the consistency check ([`is_justified`]), which
//! only asks whether a committed value would still survive.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

use crate::preference::{Preference, PreferenceType};
use crate::symbol::{PreferenceId, Value};

/// Kinds of impasse a slot can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpasseKind {
    /// Several undistinguished candidates.
    Tie,
    /// Binary preferences form a cycle.
    Conflict,
    /// Over-constrained: nothing survives, or requirements clash.
    ConstraintFailure,
    /// No candidates at all, or a committed value produced no progress.
    NoChange,
}

impl ImpasseKind {
    /// The symbolic name placed on the impasse goal's `^impasse` attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            ImpasseKind::Tie => "tie",
            ImpasseKind::Conflict => "conflict",
            ImpasseKind::ConstraintFailure => "constraint-failure",
            ImpasseKind::NoChange => "no-change",
        }
    }
}

impl std::fmt::Display for ImpasseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of resolving one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A single value was selected.
    Selected {
        value: Value,
        /// The surviving candidate set the value was chosen from. Has one
        /// element unless the survivors were mutually indifferent.
        among: Vec<Value>,
    },
    /// No single value could be selected.
    Impasse {
        kind: ImpasseKind,
        /// Values involved in the impasse, in creation order.
        items: Vec<Value>,
    },
}

impl Resolution {
    /// The selected value, if any.
    pub fn winner(&self) -> Option<&Value> {
        match self {
            Resolution::Selected { value, .. } => Some(value),
            Resolution::Impasse { .. } => None,
        }
    }

    /// The impasse kind, if resolution failed.
    pub fn impasse_kind(&self) -> Option<ImpasseKind> {
        match self {
            Resolution::Selected { .. } => None,
            Resolution::Impasse { kind, .. } => Some(*kind),
        }
    }
}

/// Per-value view of a slot's preferences.
#[derive(Default)]
struct ValueTable<'a> {
    /// Earliest acceptable preference per value.
    acceptable: BTreeMap<&'a Value, PreferenceId>,
    /// Earliest require preference per value.
    required: BTreeMap<&'a Value, PreferenceId>,
    vetoed: BTreeSet<&'a Value>,
    /// The `prohibit` subset of `vetoed`.
    prohibited: BTreeSet<&'a Value>,
    best: BTreeSet<&'a Value>,
    worst: BTreeSet<&'a Value>,
    unary_indifferent: BTreeSet<&'a Value>,
    binary_indifferent: BTreeSet<(&'a Value, &'a Value)>,
    /// (better, worse) pairs from both `better` and `worse` preferences.
    dominance: Vec<(&'a Value, &'a Value)>,
}

impl<'a> ValueTable<'a> {
    fn build(prefs: &[&'a Preference]) -> Self {
        let mut table = ValueTable::default();
        for &pref in prefs {
            let value = &pref.value;
            match pref.kind {
                PreferenceType::Acceptable => keep_earliest(&mut table.acceptable, value, pref.id),
                PreferenceType::Require => keep_earliest(&mut table.required, value, pref.id),
                PreferenceType::Reject => {
                    table.vetoed.insert(value);
                }
                PreferenceType::Prohibit => {
                    table.vetoed.insert(value);
                    table.prohibited.insert(value);
                }
                PreferenceType::Best => {
                    table.best.insert(value);
                }
                PreferenceType::Worst => {
                    table.worst.insert(value);
                }
                PreferenceType::UnaryIndifferent => {
                    table.unary_indifferent.insert(value);
                }
                PreferenceType::Better => {
                    if let Some(referent) = &pref.referent {
                        table.dominance.push((value, referent));
                    }
                }
                PreferenceType::Worse => {
                    if let Some(referent) = &pref.referent {
                        table.dominance.push((referent, value));
                    }
                }
                PreferenceType::BinaryIndifferent => {
                    if let Some(referent) = &pref.referent {
                        table.binary_indifferent.insert((value, referent));
                        table.binary_indifferent.insert((referent, value));
                    }
                }
            }
        }
        table
    }

    /// Creation order of a value: its earliest acceptable or require preference.
    fn order(&self, value: &Value) -> Option<PreferenceId> {
        let a = self.acceptable.get(value).copied();
        let r = self.required.get(value).copied();
        match (a, r) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }

    fn sorted(&self, values: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
        let mut v: Vec<&Value> = values.into_iter().collect();
        v.sort_by_key(|value| (self.order(value), (*value).clone()));
        v.dedup();
        v.into_iter().cloned().collect()
    }

    fn indifferent(&self, a: &'a Value, b: &'a Value) -> bool {
        self.binary_indifferent.contains(&(a, b))
    }
}

fn keep_earliest<'a>(
    map: &mut BTreeMap<&'a Value, PreferenceId>,
    value: &'a Value,
    id: PreferenceId,
) {
    map.entry(value)
        .and_modify(|existing| *existing = (*existing).min(id))
        .or_insert(id);
}

/// Resolve a slot's preferences into a selected value or an impasse.
///
/// Deterministic: the same preference set always yields the same result,
/// independent of the order of `prefs`.
pub fn resolve(prefs: &[&Preference]) -> Resolution {
    let table = ValueTable::build(prefs);

    // Require, among the values that survive the veto.
    if !table.required.is_empty() {
        let required = table.sorted(
            table
                .required
                .keys()
                .copied()
                .filter(|v| !table.vetoed.contains(v)),
        );
        match required.len() {
            0 => {
                let prohibited = table.sorted(
                    table
                        .required
                        .keys()
                        .copied()
                        .filter(|v| table.prohibited.contains(v)),
                );
                if !prohibited.is_empty() {
                    return Resolution::Impasse {
                        kind: ImpasseKind::ConstraintFailure,
                        items: prohibited,
                    };
                }
            }
            1 => {
                let value = required[0].clone();
                return Resolution::Selected {
                    among: required,
                    value,
                };
            }
            _ => {
                return Resolution::Impasse {
                    kind: ImpasseKind::ConstraintFailure,
                    items: required,
                };
            }
        }
    }

    if table.acceptable.is_empty() {
        return Resolution::Impasse {
            kind: ImpasseKind::NoChange,
            items: Vec::new(),
        };
    }

    // Veto.
    let mut candidates: Vec<&Value> = table
        .acceptable
        .keys()
        .copied()
        .filter(|v| !table.vetoed.contains(v))
        .collect();
    candidates.sort_by_key(|v| table.order(v));
    if candidates.is_empty() {
        return Resolution::Impasse {
            kind: ImpasseKind::ConstraintFailure,
            items: table.sorted(table.acceptable.keys().copied()),
        };
    }

    // Binary partial order.
    match apply_dominance(&table, &candidates) {
        Ok(undominated) => candidates = undominated,
        Err(cycle) => {
            return Resolution::Impasse {
                kind: ImpasseKind::Conflict,
                items: table.sorted(cycle),
            };
        }
    }

    // Best / worst.
    if candidates.iter().any(|v| table.best.contains(v)) {
        candidates.retain(|v| table.best.contains(v));
    }
    let not_worst: Vec<&Value> = candidates
        .iter()
        .copied()
        .filter(|v| !table.worst.contains(v))
        .collect();
    if !not_worst.is_empty() {
        candidates = not_worst;
    }

    match candidates.len() {
        0 => Resolution::Impasse {
            kind: ImpasseKind::ConstraintFailure,
            items: Vec::new(),
        },
        1 => Resolution::Selected {
            value: candidates[0].clone(),
            among: vec![candidates[0].clone()],
        },
        _ => {
            let among = table.sorted(candidates.iter().copied());
            if mutually_indifferent(&table, &candidates) {
                Resolution::Selected {
                    value: among[0].clone(),
                    among,
                }
            } else {
                Resolution::Impasse {
                    kind: ImpasseKind::Tie,
                    items: among,
                }
            }
        }
    }
}

/// Consistency mode: does `current` still survive resolution?
///
/// A committed value stays justified while it is the winner, one of several
/// mutually indifferent survivors, or one of the tied survivors. Anything
/// else (vetoed, dominated, displaced by a requirement, no longer
/// acceptable) calls for re-decision.
pub fn is_justified(prefs: &[&Preference], current: &Value) -> bool {
    match resolve(prefs) {
        Resolution::Selected { among, .. } => among.contains(current),
        Resolution::Impasse {
            kind: ImpasseKind::Tie,
            items,
        } => items.contains(current),
        Resolution::Impasse { .. } => false,
    }
}

/// Drop candidates dominated by another candidate. Returns the members of
/// any dominance cycle as an error.
fn apply_dominance<'a>(
    table: &ValueTable<'a>,
    candidates: &[&'a Value],
) -> std::result::Result<Vec<&'a Value>, Vec<&'a Value>> {
    let index: BTreeMap<&Value, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, v)| (*v, i))
        .collect();
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..candidates.len() {
        graph.add_node(i);
    }
    for (better, worse) in &table.dominance {
        if better == worse {
            continue;
        }
        if let (Some(&b), Some(&w)) = (index.get(better), index.get(worse)) {
            graph.add_edge(b, w, ());
        }
    }

    let cyclic: Vec<&Value> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .flatten()
        .map(|i| candidates[i])
        .collect();
    if !cyclic.is_empty() {
        return Err(cyclic);
    }

    Ok(candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            graph
                .neighbors_directed(*i, petgraph::Direction::Incoming)
                .next()
                .is_none()
        })
        .map(|(_, v)| *v)
        .collect())
}

fn mutually_indifferent<'a>(table: &ValueTable<'a>, candidates: &[&'a Value]) -> bool {
    candidates.iter().all(|&c| {
        table.unary_indifferent.contains(c)
            || candidates
                .iter()
                .all(|&other| other == c || table.indifferent(c, other))
    })
}
