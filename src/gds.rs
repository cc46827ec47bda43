//! Goal dependency sets.
//!
//! A subgoal that produces durable results may have reasoned from facts that
//! belong to its ancestors. Those premises are recorded in the subgoal's
//! dependency set; if any of them goes away, the subgoal's results are no
//! longer justified and the subgoal is queued for removal.
//!
//! Membership is exclusive: a fact belongs to at most one set. When two goals
//! depend on the same fact, the shallower goal keeps it, since removing the
//! shallower goal takes the deeper one with it anyway.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::error::{GdsError, WmResult};
use crate::preference::Support;
use crate::store::{Fact, Store};
use crate::symbol::{FactId, GdsId, IdAllocator, InstantiationId, ObjectId};

/// Ancestor facts one goal's durable results rest on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalDependencySet {
    pub id: GdsId,
    pub goal: ObjectId,
    pub facts: BTreeSet<FactId>,
}

#[derive(Debug, Default)]
pub struct GdsManager {
    ids: IdAllocator,
    sets: HashMap<GdsId, GoalDependencySet>,
    invalidated: BTreeSet<ObjectId>,
    created: u64,
    deleted: u64,
}

impl GdsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the dependency set of `goal` from the conditions of `inst`.
    ///
    /// Returns `None` without creating anything when the firing did not
    /// depend on any ancestor fact: a set always holds at least one fact.
    pub fn create_for_goal(
        &mut self,
        store: &mut Store,
        goal: ObjectId,
        inst: InstantiationId,
    ) -> WmResult<Option<GdsId>> {
        let obj = store
            .object(goal)
            .ok_or(GdsError::NotAGoal { object: goal.get() })?;
        let level = obj.goal_level.ok_or(GdsError::NotAGoal { object: goal.get() })?;
        if obj.gds.is_some_and(|id| self.sets.contains_key(&id)) {
            return Err(GdsError::AlreadyExists { goal: goal.get() }.into());
        }

        let premises = self.trace(store, inst, level);
        if premises.is_empty() {
            return Ok(None);
        }

        let id: GdsId = self.ids.next_id()?;
        self.sets.insert(
            id,
            GoalDependencySet {
                id,
                goal,
                facts: BTreeSet::new(),
            },
        );
        if let Some(obj) = store.object_mut(goal) {
            obj.gds = Some(id);
        }
        self.created += 1;
        for fact in premises {
            self.add_fact_to_set(store, id, fact);
        }
        tracing::debug!(goal = %store.name_of(goal), gds = %id, "dependency set created");
        Ok(Some(id))
    }

    /// Record the premises of a durable result produced in `goal`, creating
    /// the goal's set on first use.
    pub fn elaborate(
        &mut self,
        store: &mut Store,
        goal: ObjectId,
        inst: InstantiationId,
    ) -> WmResult<Option<GdsId>> {
        let obj = store
            .object(goal)
            .ok_or(GdsError::NotAGoal { object: goal.get() })?;
        let level = obj.goal_level.ok_or(GdsError::NotAGoal { object: goal.get() })?;
        let Some(existing) = obj.gds.filter(|id| self.sets.contains_key(id)) else {
            return self.create_for_goal(store, goal, inst);
        };
        for fact in self.trace(store, inst, level) {
            self.add_fact_to_set(store, existing, fact);
        }
        Ok(Some(existing))
    }

    /// Condition facts of `inst` owned by goals shallower than `level`,
    /// following transient local facts back through the firings that
    /// support them.
    fn trace(&self, store: &Store, inst: InstantiationId, level: u32) -> BTreeSet<FactId> {
        let mut premises = BTreeSet::new();
        let mut seen: HashSet<InstantiationId> = HashSet::new();
        let mut stack = vec![inst];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(inst) = store.instantiation(id) else {
                continue;
            };
            for cond in &inst.conditions {
                let Some(fact) = store.fact(*cond) else {
                    continue;
                };
                let Some(depth) = store.object(fact.object).and_then(|o| o.depth) else {
                    continue;
                };
                if depth < level {
                    premises.insert(fact.id);
                } else if !fact.permanent {
                    stack.extend(
                        store
                            .supporting_instantiations(fact.id)
                            .into_iter()
                            .filter(|i| {
                                store
                                    .instantiation(*i)
                                    .is_some_and(|i| i.support == Support::Transient)
                            }),
                    );
                }
            }
        }
        premises
    }

    fn add_fact_to_set(&mut self, store: &mut Store, set: GdsId, fact_id: FactId) {
        let Some(fact) = store.fact(fact_id) else {
            return;
        };
        if let Some(current) = fact.gds {
            if current == set {
                return;
            }
            let current_level = self
                .sets
                .get(&current)
                .and_then(|s| store.object(s.goal))
                .and_then(|o| o.goal_level);
            let new_level = self
                .sets
                .get(&set)
                .and_then(|s| store.object(s.goal))
                .and_then(|o| o.goal_level);
            if let (Some(cur), Some(new)) = (current_level, new_level) {
                if cur <= new {
                    return;
                }
            }
            self.remove_member(store, current, fact_id);
        }
        if let Some(s) = self.sets.get_mut(&set) {
            s.facts.insert(fact_id);
        }
        if let Some(fact) = store.fact_mut(fact_id) {
            fact.gds = Some(set);
        }
    }

    /// Drop a fact from a set, deleting the set once it is empty.
    fn remove_member(&mut self, store: &mut Store, set: GdsId, fact: FactId) {
        let Some(s) = self.sets.get_mut(&set) else {
            return;
        };
        s.facts.remove(&fact);
        if s.facts.is_empty() {
            let goal = s.goal;
            self.sets.remove(&set);
            self.deleted += 1;
            if let Some(obj) = store.object_mut(goal) {
                if obj.gds == Some(set) {
                    obj.gds = None;
                }
            }
            tracing::trace!(gds = %set, "empty dependency set deleted");
        }
    }

    /// A member fact changed: queue its goal for removal.
    pub fn on_fact_mutated(&mut self, fact: &Fact) {
        let Some(goal) = fact.gds.and_then(|id| self.sets.get(&id)).map(|s| s.goal) else {
            return;
        };
        if self.invalidated.insert(goal) {
            tracing::debug!(fact = %fact, "dependency set premise changed");
        }
    }

    /// A fact left working memory: drop it from whatever set held it.
    pub fn on_fact_removed(&mut self, store: &mut Store, fact: &Fact) {
        if let Some(set) = fact.gds {
            self.remove_member(store, set, fact.id);
        }
    }

    /// Delete the set of a goal being removed right away, without waiting
    /// for its members to leave working memory.
    pub fn detach_goal(&mut self, store: &mut Store, goal: ObjectId) {
        self.invalidated.remove(&goal);
        let Some(set_id) = store.object_mut(goal).and_then(|o| o.gds.take()) else {
            return;
        };
        let Some(set) = self.sets.remove(&set_id) else {
            return;
        };
        self.deleted += 1;
        for id in set.facts {
            if let Some(fact) = store.fact_mut(id) {
                if fact.gds == Some(set_id) {
                    fact.gds = None;
                }
            }
        }
    }

    /// Goals queued for removal that are still on the stack, shallowest first.
    pub fn take_invalidated(&mut self, store: &Store) -> Vec<ObjectId> {
        let mut goals: Vec<(u32, ObjectId)> = std::mem::take(&mut self.invalidated)
            .into_iter()
            .filter_map(|g| store.object(g).and_then(|o| o.goal_level).map(|l| (l, g)))
            .collect();
        goals.sort();
        goals.into_iter().map(|(_, g)| g).collect()
    }

    pub fn has_invalidated(&self) -> bool {
        !self.invalidated.is_empty()
    }

    /// Member facts of a goal's set.
    pub fn members(&self, store: &Store, goal: ObjectId) -> Vec<FactId> {
        self.set_of(store, goal)
            .map(|s| s.facts.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn set_of(&self, store: &Store, goal: ObjectId) -> Option<&GoalDependencySet> {
        store
            .object(goal)
            .and_then(|o| o.gds)
            .and_then(|id| self.sets.get(&id))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn deleted(&self) -> u64 {
        self.deleted
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.invalidated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::Ownership;
    use crate::store::{FactSupport, Instantiation, Limits};
    use crate::symbol::Value;

    struct Fixture {
        store: Store,
        links: Ownership,
        top: ObjectId,
        sub: ObjectId,
        premise: FactId,
    }

    fn fixture() -> Fixture {
        let mut store = Store::new(Limits::default(), true);
        let mut links = Ownership::default();
        let top = store.new_object('S').unwrap();
        let sub = store.new_object('S').unwrap();
        store.object_mut(top).unwrap().goal_level = Some(1);
        store.object_mut(sub).unwrap().goal_level = Some(2);
        links.touch(top);
        links.touch(sub);
        let slot = store.find_or_create_slot(top, &Value::sym("color"), false).unwrap();
        let premise = store
            .add_fact(&mut links, slot, Value::sym("red"), FactSupport::Permanent, false)
            .unwrap();
        links.flush(&mut store).unwrap();
        Fixture {
            store,
            links,
            top,
            sub,
            premise,
        }
    }

    fn fire(
        store: &mut Store,
        raw: u64,
        goal: ObjectId,
        level: u32,
        conditions: Vec<FactId>,
    ) -> InstantiationId {
        let id = InstantiationId::new(raw).unwrap();
        store.register_instantiation(Instantiation {
            id,
            rule: format!("r{raw}"),
            match_goal: goal,
            level,
            conditions,
            support: Support::Durable,
            preferences: Vec::new(),
        });
        id
    }

    #[test]
    fn collects_only_ancestor_facts() {
        let mut fx = fixture();
        let local_slot = fx
            .store
            .find_or_create_slot(fx.sub, &Value::sym("local"), false)
            .unwrap();
        let local = fx
            .store
            .add_fact(&mut fx.links, local_slot, Value::sym("x"), FactSupport::Permanent, false)
            .unwrap();
        let inst = fire(&mut fx.store, 100, fx.sub, 2, vec![fx.premise, local]);

        let mut gds = GdsManager::new();
        gds.create_for_goal(&mut fx.store, fx.sub, inst).unwrap();
        assert_eq!(gds.members(&fx.store, fx.sub), vec![fx.premise]);
        assert_eq!(gds.created(), 1);
    }

    #[test]
    fn double_creation_is_rejected() {
        let mut fx = fixture();
        let inst = fire(&mut fx.store, 100, fx.sub, 2, vec![fx.premise]);
        let mut gds = GdsManager::new();
        gds.create_for_goal(&mut fx.store, fx.sub, inst).unwrap();
        let err = gds.create_for_goal(&mut fx.store, fx.sub, inst).unwrap_err();
        assert!(matches!(
            err,
            crate::error::WmError::Gds(GdsError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn no_ancestor_premise_creates_nothing() {
        let mut fx = fixture();
        let inst = fire(&mut fx.store, 100, fx.sub, 2, Vec::new());
        let mut gds = GdsManager::new();
        assert!(gds.create_for_goal(&mut fx.store, fx.sub, inst).unwrap().is_none());
        assert!(gds.is_empty());
    }

    #[test]
    fn mutation_queues_goal_and_removal_deletes_set() {
        let mut fx = fixture();
        let inst = fire(&mut fx.store, 100, fx.sub, 2, vec![fx.premise]);
        let mut gds = GdsManager::new();
        gds.create_for_goal(&mut fx.store, fx.sub, inst).unwrap();

        fx.store
            .retract_permanent_fact(&mut fx.links, fx.top, &Value::sym("color"), &Value::sym("red"))
            .unwrap();
        let removed = fx.store.take_removed_facts();
        assert_eq!(removed.len(), 1);
        gds.on_fact_mutated(&removed[0]);
        gds.on_fact_removed(&mut fx.store, &removed[0]);

        assert_eq!(gds.take_invalidated(&fx.store), vec![fx.sub]);
        assert!(gds.is_empty());
        assert_eq!(gds.deleted(), 1);
        assert!(fx.store.object(fx.sub).unwrap().gds.is_none());
    }

    #[test]
    fn shallower_goal_keeps_shared_premise() {
        let mut fx = fixture();
        let deeper = fx.store.new_object('S').unwrap();
        fx.store.object_mut(deeper).unwrap().goal_level = Some(3);
        fx.links.touch(deeper);
        fx.links.flush(&mut fx.store).unwrap();

        let mut gds = GdsManager::new();
        let deep_inst = fire(&mut fx.store, 100, deeper, 3, vec![fx.premise]);
        gds.create_for_goal(&mut fx.store, deeper, deep_inst).unwrap();
        let sub_inst = fire(&mut fx.store, 101, fx.sub, 2, vec![fx.premise]);
        gds.create_for_goal(&mut fx.store, fx.sub, sub_inst).unwrap();

        assert_eq!(gds.members(&fx.store, fx.sub), vec![fx.premise]);
        // The deeper set lost its only member and was deleted on the spot.
        assert!(gds.set_of(&fx.store, deeper).is_none());
        assert_eq!(gds.len(), 1);
    }
}
