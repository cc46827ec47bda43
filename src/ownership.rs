//! Ownership and ancestry tracking.
//!
//! Facts and preferences whose value (or referent) is an object form a
//! directed link graph between objects. An object's depth is the smallest
//! goal level among the goals it can be reached from; an object that no goal
//! reaches is garbage.
//!
//! Link changes are buffered as they happen and applied in one
//! [`Ownership::flush`] at phase end. The flush only visits objects whose
//! depth can actually change, so creating or removing a subgoal costs about
//! as much as the subgoal's own objects. Because depth is re-derived from
//! the remaining sources rather than counted, unreachable cycles are
//! collected like anything else.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use serde::Serialize;

use crate::error::WmResult;
use crate::store::Store;
use crate::symbol::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkChangeKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct LinkChange {
    from: ObjectId,
    to: ObjectId,
    kind: LinkChangeKind,
}

/// Summary of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Buffered link changes applied.
    pub links_applied: usize,
    /// Objects whose depth was invalidated or lowered.
    pub region: usize,
    /// Objects found unreachable and destroyed, in id order.
    pub collected: Vec<ObjectId>,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        self.links_applied == 0 && self.region == 0
    }
}

/// Link multiset plus the pending change buffer.
#[derive(Debug, Default)]
pub struct Ownership {
    pending: Vec<LinkChange>,
    touched: BTreeSet<ObjectId>,
    outgoing: HashMap<ObjectId, HashMap<ObjectId, u32>>,
    incoming: HashMap<ObjectId, HashMap<ObjectId, u32>>,
    generation: u64,
}

impl Ownership {
    /// Buffer a new `from -> to` link. Self-links carry no reachability.
    pub fn post_link_addition(&mut self, from: ObjectId, to: ObjectId) {
        if from != to {
            self.pending.push(LinkChange {
                from,
                to,
                kind: LinkChangeKind::Added,
            });
        }
    }

    /// Buffer the removal of one `from -> to` link.
    pub fn post_link_removal(&mut self, from: ObjectId, to: ObjectId) {
        if from != to {
            self.pending.push(LinkChange {
                from,
                to,
                kind: LinkChangeKind::Removed,
            });
        }
    }

    /// Mark an object for depth recomputation at the next flush without a
    /// link change (new objects, goals gaining or losing their anchor).
    pub fn touch(&mut self, id: ObjectId) {
        self.touched.insert(id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.touched.len()
    }

    /// Live link multiplicity between two objects (as of the last flush).
    pub fn link_count(&self, from: ObjectId, to: ObjectId) -> u32 {
        self.outgoing
            .get(&from)
            .and_then(|m| m.get(&to))
            .copied()
            .unwrap_or(0)
    }

    /// Drop all links and buffered changes.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.touched.clear();
        self.outgoing.clear();
        self.incoming.clear();
    }

    fn apply(&mut self, change: LinkChange) {
        let LinkChange { from, to, kind } = change;
        match kind {
            LinkChangeKind::Added => {
                *self.outgoing.entry(from).or_default().entry(to).or_insert(0) += 1;
                *self.incoming.entry(to).or_default().entry(from).or_insert(0) += 1;
            }
            LinkChangeKind::Removed => {
                decrement(&mut self.outgoing, from, to);
                decrement(&mut self.incoming, to, from);
            }
        }
    }

    fn forget(&mut self, id: ObjectId) {
        if let Some(targets) = self.outgoing.remove(&id) {
            for to in targets.keys() {
                if let Some(m) = self.incoming.get_mut(to) {
                    m.remove(&id);
                }
            }
        }
        if let Some(sources) = self.incoming.remove(&id) {
            for from in sources.keys() {
                if let Some(m) = self.outgoing.get_mut(from) {
                    m.remove(&id);
                }
            }
        }
    }

    /// Apply every buffered change, bring depths up to date and destroy
    /// whatever is no longer reachable from a goal.
    ///
    /// Additions and new anchors only lower depths, so they walk forward only
    /// while a target improves. Removals and lost anchors invalidate just the
    /// objects whose depth could have come through what was lost, and those
    /// objects are settled again from their remaining sources. Anything left
    /// without a depth is garbage.
    ///
    /// Link removals caused by destroying garbage are buffered again and
    /// picked up by the next flush.
    pub fn flush(&mut self, store: &mut Store) -> WmResult<FlushReport> {
        let changes = std::mem::take(&mut self.pending);
        let touched = std::mem::take(&mut self.touched);
        if changes.is_empty() && touched.is_empty() {
            return Ok(FlushReport::default());
        }
        for change in &changes {
            self.apply(*change);
        }
        self.generation += 1;
        let generation = self.generation;

        // A removed link may have carried its target's depth when both ends
        // sat at the same level, or when the source is already gone.
        let mut suspects: Vec<ObjectId> = touched.into_iter().collect();
        for change in changes.iter().filter(|c| c.kind == LinkChangeKind::Removed) {
            let Some(to) = store.object(change.to) else {
                continue;
            };
            let from_depth = store.object(change.from).map(|o| o.depth);
            if to.depth.is_none() || from_depth.is_none_or(|d| d == to.depth) {
                suspects.push(change.to);
            }
        }

        // Invalidate. A child at the same depth may owe that depth to the
        // invalidated parent; a goal anchored at or above its depth does not.
        let mut unknown: Vec<ObjectId> = Vec::new();
        while let Some(id) = suspects.pop() {
            let Some(obj) = store.object_mut(id) else {
                continue;
            };
            if obj.mark == generation {
                continue;
            }
            let old = obj.depth;
            if let (Some(level), Some(depth)) = (obj.goal_level, old) {
                if level <= depth {
                    continue;
                }
            }
            obj.mark = generation;
            obj.depth = None;
            unknown.push(id);
            let Some(depth) = old else {
                continue;
            };
            if let Some(targets) = self.outgoing.get(&id) {
                for to in targets.keys() {
                    if store
                        .object(*to)
                        .is_some_and(|o| o.mark != generation && o.depth == Some(depth))
                    {
                        suspects.push(*to);
                    }
                }
            }
        }

        // Offers: anchors and surviving sources of invalidated objects, plus
        // the sources of new links.
        let mut heap: BinaryHeap<Reverse<(u32, ObjectId)>> = BinaryHeap::new();
        for &id in &unknown {
            let mut best = store.object(id).and_then(|o| o.goal_level);
            if let Some(sources) = self.incoming.get(&id) {
                for from in sources.keys() {
                    if let Some(src) = store.object(*from) {
                        if src.mark == generation {
                            continue;
                        }
                        if let Some(d) = src.depth {
                            best = Some(best.map_or(d, |b| b.min(d)));
                        }
                    }
                }
            }
            if let Some(d) = best {
                heap.push(Reverse((d, id)));
            }
        }
        for change in changes.iter().filter(|c| c.kind == LinkChangeKind::Added) {
            let depth = store.object(change.from).and_then(|o| o.depth);
            if let Some(d) = depth {
                heap.push(Reverse((d, change.to)));
            }
        }

        // Links do not add depth: settle in ascending order and walk forward
        // only where a depth improves.
        let mut lowered = 0usize;
        while let Some(Reverse((depth, id))) = heap.pop() {
            let Some(obj) = store.object_mut(id) else {
                continue;
            };
            if obj.depth.is_some_and(|d| d <= depth) {
                continue;
            }
            obj.depth = Some(depth);
            if obj.mark != generation {
                obj.mark = generation;
                lowered += 1;
            }
            if let Some(targets) = self.outgoing.get(&id) {
                for to in targets.keys() {
                    let improves = store
                        .object(*to)
                        .is_some_and(|o| o.depth.is_none_or(|d| d > depth));
                    if improves {
                        heap.push(Reverse((depth, *to)));
                    }
                }
            }
        }

        let mut garbage: Vec<ObjectId> = unknown
            .iter()
            .copied()
            .filter(|id| store.object(*id).is_some_and(|o| o.depth.is_none()))
            .collect();
        garbage.sort();

        for id in &garbage {
            store.destroy_object(self, *id)?;
        }
        for id in &garbage {
            self.forget(*id);
        }
        // Removals between two collected objects have nothing left to update.
        self.pending
            .retain(|c| store.object(c.from).is_some() || store.object(c.to).is_some());

        let report = FlushReport {
            links_applied: changes.len(),
            region: unknown.len() + lowered,
            collected: garbage,
        };
        tracing::debug!(
            links = report.links_applied,
            region = report.region,
            collected = report.collected.len(),
            requeued = self.pending.len(),
            "ownership flush"
        );
        Ok(report)
    }
}

fn decrement(map: &mut HashMap<ObjectId, HashMap<ObjectId, u32>>, a: ObjectId, b: ObjectId) {
    let Some(inner) = map.get_mut(&a) else {
        return;
    };
    if let Some(n) = inner.get_mut(&b) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            inner.remove(&b);
        }
    }
    if inner.is_empty() {
        map.remove(&a);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FactSupport, Limits};
    use crate::symbol::Value;

    fn setup() -> (Store, Ownership, ObjectId) {
        let mut store = Store::new(Limits::default(), true);
        let mut links = Ownership::default();
        let root = store.new_object('S').unwrap();
        store.object_mut(root).unwrap().goal_level = Some(1);
        links.touch(root);
        links.flush(&mut store).unwrap();
        (store, links, root)
    }

    fn link(store: &mut Store, links: &mut Ownership, from: ObjectId, attr: &str, to: ObjectId) {
        let slot = store.find_or_create_slot(from, &Value::sym(attr), false).unwrap();
        store
            .add_fact(links, slot, Value::from(to), FactSupport::Permanent, false)
            .unwrap();
    }

    fn unlink(store: &mut Store, links: &mut Ownership, from: ObjectId, attr: &str, to: ObjectId) {
        store
            .retract_permanent_fact(links, from, &Value::sym(attr), &Value::from(to))
            .unwrap();
    }

    #[test]
    fn links_propagate_root_depth() {
        let (mut store, mut links, root) = setup();
        let a = store.new_object('A').unwrap();
        let b = store.new_object('B').unwrap();
        link(&mut store, &mut links, root, "child", a);
        link(&mut store, &mut links, a, "child", b);
        let report = links.flush(&mut store).unwrap();
        assert!(report.collected.is_empty());
        assert_eq!(store.object(root).unwrap().depth, Some(1));
        assert_eq!(store.object(a).unwrap().depth, Some(1));
        assert_eq!(store.object(b).unwrap().depth, Some(1));
        assert_eq!(links.link_count(root, a), 1);
    }

    #[test]
    fn flush_is_idempotent() {
        let (mut store, mut links, root) = setup();
        let a = store.new_object('A').unwrap();
        link(&mut store, &mut links, root, "child", a);
        links.flush(&mut store).unwrap();
        let second = links.flush(&mut store).unwrap();
        assert!(second.is_noop());
        assert_eq!(store.object(a).unwrap().depth, Some(1));
    }

    #[test]
    fn unreachable_cycle_is_collected() {
        let (mut store, mut links, root) = setup();
        let a = store.new_object('A').unwrap();
        let b = store.new_object('B').unwrap();
        link(&mut store, &mut links, root, "child", a);
        link(&mut store, &mut links, a, "next", b);
        link(&mut store, &mut links, b, "next", a);
        links.flush(&mut store).unwrap();
        assert!(store.object(b).is_some());

        unlink(&mut store, &mut links, root, "child", a);
        let report = links.flush(&mut store).unwrap();
        assert_eq!(report.collected, vec![a, b]);
        assert!(store.object(a).is_none());
        assert!(store.object(b).is_none());
        assert!(store.object(root).is_some());

        // The cycle's own link removals are requeued and drain quietly.
        let next = links.flush(&mut store).unwrap();
        assert!(next.collected.is_empty());
        assert_eq!(links.pending_len(), 0);
    }

    #[test]
    fn second_path_keeps_object_alive() {
        let (mut store, mut links, root) = setup();
        let a = store.new_object('A').unwrap();
        let b = store.new_object('B').unwrap();
        link(&mut store, &mut links, root, "x", a);
        link(&mut store, &mut links, root, "y", b);
        link(&mut store, &mut links, a, "z", b);
        links.flush(&mut store).unwrap();

        unlink(&mut store, &mut links, root, "y", b);
        let report = links.flush(&mut store).unwrap();
        assert!(report.collected.is_empty());
        assert_eq!(store.object(b).unwrap().depth, Some(1));
    }

    #[test]
    fn depth_is_minimum_anchoring_goal_level() {
        let (mut store, mut links, root) = setup();
        let sub = store.new_object('S').unwrap();
        store.object_mut(sub).unwrap().goal_level = Some(2);
        links.touch(sub);
        let a = store.new_object('A').unwrap();
        link(&mut store, &mut links, sub, "thing", a);
        links.flush(&mut store).unwrap();
        assert_eq!(store.object(a).unwrap().depth, Some(2));

        link(&mut store, &mut links, root, "thing", a);
        links.flush(&mut store).unwrap();
        assert_eq!(store.object(a).unwrap().depth, Some(1));

        unlink(&mut store, &mut links, root, "thing", a);
        links.flush(&mut store).unwrap();
        assert_eq!(store.object(a).unwrap().depth, Some(2));
    }

    #[test]
    fn untouched_unlinked_object_is_collected_once_touched() {
        let (mut store, mut links, _root) = setup();
        let stray = store.new_object('X').unwrap();
        links.touch(stray);
        let report = links.flush(&mut store).unwrap();
        assert_eq!(report.collected, vec![stray]);
    }

    #[test]
    fn subgoal_churn_only_visits_the_subgoal() {
        let (mut store, mut links, root) = setup();
        for _ in 0..200 {
            let item = store.new_object('W').unwrap();
            link(&mut store, &mut links, root, "item", item);
        }
        links.flush(&mut store).unwrap();

        let sub = store.new_object('S').unwrap();
        store.object_mut(sub).unwrap().goal_level = Some(2);
        links.touch(sub);
        link(&mut store, &mut links, sub, "superstate", root);
        let created = links.flush(&mut store).unwrap();
        assert_eq!(created.region, 1);
        assert_eq!(store.object(sub).unwrap().depth, Some(2));

        store.object_mut(sub).unwrap().goal_level = None;
        links.touch(sub);
        let removed = links.flush(&mut store).unwrap();
        assert_eq!(removed.region, 1);
        assert_eq!(removed.collected, vec![sub]);
        assert_eq!(store.object(root).unwrap().depth, Some(1));

        let requeued = links.flush(&mut store).unwrap();
        assert_eq!(requeued.region, 0);
        assert!(requeued.collected.is_empty());
    }

    #[test]
    fn subgoal_objects_go_with_the_subgoal() {
        let (mut store, mut links, root) = setup();
        let sub = store.new_object('S').unwrap();
        store.object_mut(sub).unwrap().goal_level = Some(2);
        links.touch(sub);
        let a = store.new_object('A').unwrap();
        let b = store.new_object('B').unwrap();
        link(&mut store, &mut links, sub, "superstate", root);
        link(&mut store, &mut links, sub, "thing", a);
        link(&mut store, &mut links, a, "part", b);
        links.flush(&mut store).unwrap();
        assert_eq!(store.object(b).unwrap().depth, Some(2));

        store.object_mut(sub).unwrap().goal_level = None;
        links.touch(sub);
        let report = links.flush(&mut store).unwrap();
        assert_eq!(report.collected, vec![sub, a, b]);
        assert_eq!(report.region, 3);
    }
}
