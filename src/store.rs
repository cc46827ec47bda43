//! Fact/preference store: objects, slots, facts, preferences and the
//! instantiations that produced them.
//!
//! Everything lives in identity-indexed maps owned by one [`Store`]. Slots
//! keep ordered id lists instead of intrusive links; the only ordering
//! contracts are the ones resolution relies on (per-type lists by ascending
//! support level then creation order, fact lists by creation order).
//!
//! Link changes implied by a mutation are posted to the [`Ownership`]
//! tracker passed in by the caller. Removed facts are queued and drained by
//! the engine, which routes them to dependency sets and observers.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::{ResourceError, StoreError, WmResult};
use crate::event::PreferenceSpec;
use crate::ownership::Ownership;
use crate::preference::{Preference, PreferenceType, Support};
use crate::symbol::{
    FactId, GdsId, IdAllocator, InstantiationId, ObjectId, PreferenceId, SlotId, Value,
};

/// An object reference: a node that can own slots.
#[derive(Debug, Clone, Serialize)]
pub struct Object {
    pub id: ObjectId,
    /// Printable name, a letter and a number (`S1`, `O4`).
    pub name: String,
    /// Goal-stack level this object is reachable at. `None` until the first
    /// flush after creation, and for objects awaiting collection.
    pub depth: Option<u32>,
    /// Set while the object is a goal on the goal stack; anchors reachability.
    pub goal_level: Option<u32>,
    /// Dependency set owned by this goal.
    pub gds: Option<GdsId>,
    pub slots: Vec<SlotId>,
    #[serde(skip)]
    pub(crate) mark: u64,
}

impl Object {
    pub fn is_goal(&self) -> bool {
        self.goal_level.is_some()
    }
}

/// How a fact is held in working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactSupport {
    /// Asserted directly by the host or the architecture.
    Permanent,
    /// Justified by preferences.
    Preference,
}

/// A working-memory element: an immutable (object, attribute, value) triple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    /// Timetag: identity and creation order.
    pub id: FactId,
    pub object: ObjectId,
    pub attr: Value,
    pub value: Value,
    /// Acceptable-preference fact of a context slot (`(S1 ^operator O1 +)`).
    pub acceptable: bool,
    pub slot: SlotId,
    /// Number of preferences justifying this fact.
    pub support: u32,
    /// Held regardless of preference support.
    pub permanent: bool,
    /// Dependency set this fact belongs to.
    pub gds: Option<GdsId>,
}

impl Fact {
    /// Objects this fact links its object to.
    pub fn link_targets(&self) -> impl Iterator<Item = ObjectId> + '_ {
        link_targets(self.object, [Some(&self.attr), Some(&self.value)])
    }
}

impl std::fmt::Display for Fact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}: {} ^{} {}", self.id, self.object, self.attr, self.value)?;
        if self.acceptable {
            write!(f, " +")?;
        }
        write!(f, ")")
    }
}

/// All facts and preferences for one (object, attribute) pair.
#[derive(Debug, Clone, Serialize)]
pub struct Slot {
    pub id: SlotId,
    pub object: ObjectId,
    pub attr: Value,
    /// Decision-point slot of a goal.
    pub context: bool,
    /// Facts in creation order. For context slots, the committed value.
    pub facts: Vec<FactId>,
    /// Acceptable-preference facts (context slots only).
    pub acceptable_facts: Vec<FactId>,
    /// Every preference, in arrival order.
    pub all_preferences: Vec<PreferenceId>,
    /// Preferences bucketed by [`PreferenceType::bucket`], each ordered by
    /// ascending support level then creation.
    pub by_type: [Vec<PreferenceId>; 10],
    /// Impasse goal hanging off this slot.
    pub impasse: Option<ObjectId>,
    /// Preference set changed since the last decision.
    pub changed: bool,
    /// An acceptable or require preference changed (context slots only).
    pub acceptable_changed: bool,
}

impl Slot {
    fn new(id: SlotId, object: ObjectId, attr: Value, context: bool) -> Self {
        Self {
            id,
            object,
            attr,
            context,
            facts: Vec::new(),
            acceptable_facts: Vec::new(),
            all_preferences: Vec::new(),
            by_type: Default::default(),
            impasse: None,
            changed: false,
            acceptable_changed: false,
        }
    }

    pub fn preferences_of(&self, kind: PreferenceType) -> &[PreferenceId] {
        &self.by_type[kind.bucket()]
    }
}

/// One rule firing, with the matched-condition trace it was tagged with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instantiation {
    pub id: InstantiationId,
    pub rule: String,
    /// Deepest goal among the condition facts' objects.
    pub match_goal: ObjectId,
    pub level: u32,
    pub conditions: Vec<FactId>,
    pub support: Support,
    /// Live preferences this firing produced.
    pub preferences: Vec<PreferenceId>,
}

/// Pool limits. Exceeding one is a resource-exhaustion error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_slots: usize,
    pub max_preferences: usize,
    pub max_facts: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_slots: 1_000_000,
            max_preferences: 1_000_000,
            max_facts: 1_000_000,
        }
    }
}

fn link_targets<'a, const N: usize>(
    from: ObjectId,
    values: [Option<&'a Value>; N],
) -> impl Iterator<Item = ObjectId> + 'a {
    values
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter(move |to| *to != from)
}

/// The agent-scoped fact/preference store.
#[derive(Debug)]
pub struct Store {
    ids: IdAllocator,
    objects: HashMap<ObjectId, Object>,
    names: HashMap<String, ObjectId>,
    name_counters: HashMap<char, u64>,
    slots: HashMap<SlotId, Slot>,
    slot_index: HashMap<(ObjectId, Value), SlotId>,
    facts: HashMap<FactId, Fact>,
    preferences: HashMap<PreferenceId, Preference>,
    instantiations: HashMap<InstantiationId, Instantiation>,
    retired: HashSet<InstantiationId>,
    limits: Limits,
    track_acceptable: bool,
    pending_acceptable: Vec<SlotId>,
    added_facts: Vec<FactId>,
    removed_facts: Vec<Fact>,
    preferences_added: u64,
    preferences_removed: u64,
}

impl Store {
    pub fn new(limits: Limits, track_acceptable: bool) -> Self {
        Self {
            ids: IdAllocator::new(),
            objects: HashMap::new(),
            names: HashMap::new(),
            name_counters: HashMap::new(),
            slots: HashMap::new(),
            slot_index: HashMap::new(),
            facts: HashMap::new(),
            preferences: HashMap::new(),
            instantiations: HashMap::new(),
            retired: HashSet::new(),
            limits,
            track_acceptable,
            pending_acceptable: Vec::new(),
            added_facts: Vec::new(),
            removed_facts: Vec::new(),
            preferences_added: 0,
            preferences_removed: 0,
        }
    }

    pub(crate) fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// Switch acceptable-preference facts on or off. Takes effect at the next
    /// [`Store::sync_acceptable_facts`].
    pub(crate) fn set_track_acceptable(&mut self, on: bool) {
        self.track_acceptable = on;
        for slot in self.slots.values_mut().filter(|s| s.context) {
            if !slot.acceptable_changed {
                slot.acceptable_changed = true;
                self.pending_acceptable.push(slot.id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Create a fresh object named after `letter` (`S`, `O`, ...).
    pub fn new_object(&mut self, letter: char) -> WmResult<ObjectId> {
        let letter = if letter.is_ascii_alphabetic() {
            letter.to_ascii_uppercase()
        } else {
            'I'
        };
        let name = loop {
            let counter = self.name_counters.entry(letter).or_insert(0);
            *counter += 1;
            let candidate = format!("{letter}{counter}");
            if !self.names.contains_key(&candidate) {
                break candidate;
            }
        };
        self.insert_object(name)
    }

    /// Look up an object by name, creating it if absent.
    pub fn named_object(&mut self, name: &str) -> WmResult<ObjectId> {
        match self.names.get(name) {
            Some(&id) => Ok(id),
            None => self.insert_object(name.to_string()),
        }
    }

    fn insert_object(&mut self, name: String) -> WmResult<ObjectId> {
        let id: ObjectId = self.ids.next_id()?;
        self.names.insert(name.clone(), id);
        self.objects.insert(
            id,
            Object {
                id,
                name,
                depth: None,
                goal_level: None,
                gds: None,
                slots: Vec::new(),
                mark: 0,
            },
        );
        Ok(id)
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub(crate) fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn require_object(&self, id: ObjectId) -> WmResult<&Object> {
        self.objects
            .get(&id)
            .ok_or_else(|| StoreError::UnknownObject { object: id.get() }.into())
    }

    pub fn object_by_name(&self, name: &str) -> Option<ObjectId> {
        self.names.get(name).copied()
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Printable name of an object, or its raw id once collected.
    pub fn name_of(&self, id: ObjectId) -> String {
        self.objects
            .get(&id)
            .map(|o| o.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    // -----------------------------------------------------------------------
    // Slots
    // -----------------------------------------------------------------------

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    fn require_slot(&self, id: SlotId) -> WmResult<&Slot> {
        self.slots
            .get(&id)
            .ok_or_else(|| StoreError::UnknownSlot { slot: id.get() }.into())
    }

    pub fn find_slot(&self, object: ObjectId, attr: &Value) -> Option<SlotId> {
        self.slot_index.get(&(object, attr.clone())).copied()
    }

    pub fn find_or_create_slot(
        &mut self,
        object: ObjectId,
        attr: &Value,
        context: bool,
    ) -> WmResult<SlotId> {
        if let Some(id) = self.find_slot(object, attr) {
            return Ok(id);
        }
        self.require_object(object)?;
        if self.slots.len() >= self.limits.max_slots {
            return Err(ResourceError::CapacityExceeded {
                resource: "slot".into(),
                limit: self.limits.max_slots,
            }
            .into());
        }
        let id: SlotId = self.ids.next_id()?;
        self.slots
            .insert(id, Slot::new(id, object, attr.clone(), context));
        self.slot_index.insert((object, attr.clone()), id);
        if let Some(obj) = self.objects.get_mut(&object) {
            obj.slots.push(id);
        }
        Ok(id)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // -----------------------------------------------------------------------
    // Facts
    // -----------------------------------------------------------------------

    pub fn fact(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(&id)
    }

    pub(crate) fn fact_mut(&mut self, id: FactId) -> Option<&mut Fact> {
        self.facts.get_mut(&id)
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Insert a fact into a slot.
    ///
    /// Idempotent on content: if the slot already holds a fact with the same
    /// value (and acceptable flag), that fact absorbs the new support and its
    /// id is returned.
    pub fn add_fact(
        &mut self,
        links: &mut Ownership,
        slot_id: SlotId,
        value: Value,
        support: FactSupport,
        acceptable: bool,
    ) -> WmResult<FactId> {
        let slot = self.require_slot(slot_id)?;
        let list = if acceptable {
            &slot.acceptable_facts
        } else {
            &slot.facts
        };
        let existing = list
            .iter()
            .copied()
            .find(|f| self.facts.get(f).is_some_and(|fact| fact.value == value));
        if let Some(id) = existing {
            if let Some(fact) = self.facts.get_mut(&id) {
                match support {
                    FactSupport::Permanent => fact.permanent = true,
                    FactSupport::Preference => fact.support += 1,
                }
            }
            return Ok(id);
        }

        if self.facts.len() >= self.limits.max_facts {
            return Err(ResourceError::CapacityExceeded {
                resource: "fact".into(),
                limit: self.limits.max_facts,
            }
            .into());
        }
        let (object, attr) = (slot.object, slot.attr.clone());
        let id: FactId = self.ids.next_id()?;
        let fact = Fact {
            id,
            object,
            attr,
            value,
            acceptable,
            slot: slot_id,
            support: u32::from(support == FactSupport::Preference),
            permanent: support == FactSupport::Permanent,
            gds: None,
        };
        for to in fact.link_targets() {
            links.post_link_addition(object, to);
        }
        tracing::trace!(%fact, "fact added");
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            if acceptable {
                slot.acceptable_facts.push(id);
            } else {
                slot.facts.push(id);
            }
        }
        self.facts.insert(id, fact);
        self.added_facts.push(id);
        Ok(id)
    }

    /// Detach a fact from its slot and queue it for destruction.
    pub fn remove_fact(
        &mut self,
        links: &mut Ownership,
        slot_id: SlotId,
        fact_id: FactId,
    ) -> WmResult<()> {
        let not_in_slot = || StoreError::FactNotInSlot {
            fact: fact_id.get(),
            slot: slot_id.get(),
        };
        let acceptable = self.facts.get(&fact_id).ok_or_else(not_in_slot)?.acceptable;
        let slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(StoreError::UnknownSlot { slot: slot_id.get() })?;
        let list = if acceptable {
            &mut slot.acceptable_facts
        } else {
            &mut slot.facts
        };
        let pos = list
            .iter()
            .position(|f| *f == fact_id)
            .ok_or_else(not_in_slot)?;
        list.remove(pos);

        let fact = self.facts.remove(&fact_id).ok_or_else(not_in_slot)?;
        for to in fact.link_targets() {
            links.post_link_removal(fact.object, to);
        }
        tracing::trace!(%fact, "fact removed");
        self.removed_facts.push(fact);
        Ok(())
    }

    /// Find the (non-acceptable) fact with the given content.
    pub fn find_fact(&self, object: ObjectId, attr: &Value, value: &Value) -> Option<FactId> {
        let slot = self.slots.get(&self.find_slot(object, attr)?)?;
        slot.facts
            .iter()
            .copied()
            .find(|f| self.facts.get(f).is_some_and(|fact| &fact.value == value))
    }

    /// Withdraw the permanent support of a directly asserted fact.
    pub fn retract_permanent_fact(
        &mut self,
        links: &mut Ownership,
        object: ObjectId,
        attr: &Value,
        value: &Value,
    ) -> WmResult<()> {
        let not_found = || StoreError::FactNotFound {
            object: object.get(),
            attr: attr.to_string(),
            value: value.to_string(),
        };
        let id = self
            .find_fact(object, attr, value)
            .filter(|f| self.facts.get(f).is_some_and(|fact| fact.permanent))
            .ok_or_else(not_found)?;
        let fact = self.facts.get_mut(&id).ok_or_else(not_found)?;
        if fact.support > 0 {
            fact.permanent = false;
            return Ok(());
        }
        let slot = fact.slot;
        self.remove_fact(links, slot, id)
    }

    /// Facts held by an object's slots, in creation order.
    pub fn facts_of(&self, object: ObjectId) -> Vec<&Fact> {
        let Some(obj) = self.objects.get(&object) else {
            return Vec::new();
        };
        let mut facts: Vec<&Fact> = obj
            .slots
            .iter()
            .filter_map(|s| self.slots.get(s))
            .flat_map(|s| s.facts.iter().chain(s.acceptable_facts.iter()))
            .filter_map(|f| self.facts.get(f))
            .collect();
        facts.sort_by_key(|f| f.id);
        facts
    }

    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.facts.values()
    }

    pub(crate) fn take_added_facts(&mut self) -> Vec<FactId> {
        std::mem::take(&mut self.added_facts)
    }

    pub(crate) fn take_removed_facts(&mut self) -> Vec<Fact> {
        std::mem::take(&mut self.removed_facts)
    }

    // -----------------------------------------------------------------------
    // Preferences
    // -----------------------------------------------------------------------

    pub fn preference(&self, id: PreferenceId) -> Option<&Preference> {
        self.preferences.get(&id)
    }

    pub fn preference_count(&self) -> usize {
        self.preferences.len()
    }

    /// Cumulative (added, removed) preference counts.
    pub fn preference_churn(&self) -> (u64, u64) {
        (self.preferences_added, self.preferences_removed)
    }

    /// Preferences of a slot, in arrival order.
    pub fn slot_preferences(&self, slot: SlotId) -> Vec<&Preference> {
        self.slots
            .get(&slot)
            .map(|s| {
                s.all_preferences
                    .iter()
                    .filter_map(|p| self.preferences.get(p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert a preference into its slot.
    ///
    /// The per-type list stays ordered by ascending support level, then
    /// creation. Marks the slot changed; for context slots, acceptable and
    /// require preferences also flag the slot's acceptable facts for refresh.
    pub fn add_preference(
        &mut self,
        links: &mut Ownership,
        spec: &PreferenceSpec,
        slot_id: SlotId,
        level: u32,
        support: Support,
        instantiation: InstantiationId,
    ) -> WmResult<PreferenceId> {
        if spec.kind.is_binary() && spec.referent.is_none() {
            return Err(StoreError::MissingReferent {
                kind: spec.kind.to_string(),
            }
            .into());
        }
        if self.preferences.len() >= self.limits.max_preferences {
            return Err(ResourceError::CapacityExceeded {
                resource: "preference".into(),
                limit: self.limits.max_preferences,
            }
            .into());
        }
        self.require_slot(slot_id)?;
        let id: PreferenceId = self.ids.next_id()?;
        let pref = Preference {
            id,
            kind: spec.kind,
            object: spec.object,
            attr: spec.attr.clone(),
            value: spec.value.clone(),
            referent: spec.referent.clone(),
            slot: slot_id,
            level,
            support,
            instantiation,
        };

        let key = pref.order_key();
        let Some(slot) = self.slots.get_mut(&slot_id) else {
            return Err(StoreError::UnknownSlot { slot: slot_id.get() }.into());
        };
        slot.all_preferences.push(id);
        let bucket = &mut slot.by_type[pref.kind.bucket()];
        let pos = bucket.partition_point(|other| {
            self.preferences
                .get(other)
                .is_some_and(|p| p.order_key() <= key)
        });
        bucket.insert(pos, id);
        slot.changed = true;
        let context = slot.context;
        if context && pref.kind.affects_candidacy() && !slot.acceptable_changed {
            slot.acceptable_changed = true;
            self.pending_acceptable.push(slot_id);
        }

        for to in link_targets(pref.object, [Some(&pref.value), pref.referent.as_ref()]) {
            links.post_link_addition(pref.object, to);
        }
        if let Some(inst) = self.instantiations.get_mut(&instantiation) {
            inst.preferences.push(id);
        }
        let value = pref.value.clone();
        tracing::trace!(pref = %id, kind = %pref.kind, value = %value, "preference added");
        self.preferences.insert(id, pref);
        self.preferences_added += 1;

        if !context {
            self.sync_supported_fact(links, slot_id, &value)?;
        }
        Ok(id)
    }

    /// Remove a preference from its slot.
    pub fn remove_preference(
        &mut self,
        links: &mut Ownership,
        id: PreferenceId,
    ) -> WmResult<Preference> {
        let slot_id = self
            .preferences
            .get(&id)
            .ok_or(StoreError::UnknownPreference { preference: id.get() })?
            .slot;
        let not_in_slot = StoreError::PreferenceNotInSlot {
            preference: id.get(),
            slot: slot_id.get(),
        };
        let slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(StoreError::UnknownSlot { slot: slot_id.get() })?;
        let Some(pos) = slot.all_preferences.iter().position(|p| *p == id) else {
            return Err(not_in_slot.into());
        };
        slot.all_preferences.remove(pos);
        let Some(pref) = self.preferences.remove(&id) else {
            return Err(not_in_slot.into());
        };
        slot.by_type[pref.kind.bucket()].retain(|p| *p != id);
        slot.changed = true;
        let context = slot.context;
        if context && pref.kind.affects_candidacy() && !slot.acceptable_changed {
            slot.acceptable_changed = true;
            self.pending_acceptable.push(slot_id);
        }

        for to in link_targets(pref.object, [Some(&pref.value), pref.referent.as_ref()]) {
            links.post_link_removal(pref.object, to);
        }
        if let Some(inst) = self.instantiations.get_mut(&pref.instantiation) {
            inst.preferences.retain(|p| *p != id);
        }
        tracing::trace!(pref = %id, kind = %pref.kind, "preference removed");
        self.preferences_removed += 1;

        if !context {
            self.sync_supported_fact(links, slot_id, &pref.value)?;
        }
        Ok(pref)
    }

    /// Durable reject: drop every durable acceptable preference for `value`
    /// in a non-context slot. Returns how many were removed.
    pub fn remove_durable_acceptables(
        &mut self,
        links: &mut Ownership,
        slot_id: SlotId,
        value: &Value,
    ) -> WmResult<usize> {
        let targets: Vec<PreferenceId> = self
            .require_slot(slot_id)?
            .preferences_of(PreferenceType::Acceptable)
            .iter()
            .copied()
            .filter(|p| {
                self.preferences
                    .get(p)
                    .is_some_and(|p| p.support == Support::Durable && &p.value == value)
            })
            .collect();
        for id in &targets {
            self.remove_preference(links, *id)?;
        }
        Ok(targets.len())
    }

    /// Bring a non-context slot's fact for `value` in line with its
    /// preferences: present with support N while N acceptable or require
    /// preferences back it and nothing vetoes it, absent otherwise.
    fn sync_supported_fact(
        &mut self,
        links: &mut Ownership,
        slot_id: SlotId,
        value: &Value,
    ) -> WmResult<()> {
        let slot = self.require_slot(slot_id)?;
        let mut desired = 0u32;
        let mut vetoed = false;
        for pref in slot
            .all_preferences
            .iter()
            .filter_map(|p| self.preferences.get(p))
            .filter(|p| &p.value == value)
        {
            match pref.kind {
                PreferenceType::Acceptable | PreferenceType::Require => desired += 1,
                PreferenceType::Reject | PreferenceType::Prohibit => vetoed = true,
                _ => {}
            }
        }
        let existing = slot
            .facts
            .iter()
            .copied()
            .find(|f| self.facts.get(f).is_some_and(|fact| &fact.value == value));
        let wanted = desired > 0 && !vetoed;

        match existing {
            Some(id) => {
                let Some(fact) = self.facts.get_mut(&id) else {
                    return Ok(());
                };
                fact.support = if wanted { desired } else { 0 };
                if !wanted && !fact.permanent {
                    self.remove_fact(links, slot_id, id)?;
                }
            }
            None if wanted => {
                let id =
                    self.add_fact(links, slot_id, value.clone(), FactSupport::Preference, false)?;
                if let Some(fact) = self.facts.get_mut(&id) {
                    fact.support = desired;
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Refresh acceptable-preference facts of every context slot whose
    /// acceptable or require preferences changed since the last refresh.
    pub fn sync_acceptable_facts(&mut self, links: &mut Ownership) -> WmResult<()> {
        for slot_id in std::mem::take(&mut self.pending_acceptable) {
            let Some(slot) = self.slots.get_mut(&slot_id) else {
                continue;
            };
            slot.acceptable_changed = false;

            let mut desired: Vec<(Value, u32)> = Vec::new();
            if self.track_acceptable {
                for pref in slot
                    .all_preferences
                    .iter()
                    .filter_map(|p| self.preferences.get(p))
                    .filter(|p| p.kind.affects_candidacy())
                {
                    match desired.iter_mut().find(|(v, _)| *v == pref.value) {
                        Some((_, n)) => *n += 1,
                        None => desired.push((pref.value.clone(), 1)),
                    }
                }
            }

            let current: Vec<FactId> = slot.acceptable_facts.clone();
            for id in current {
                let Some(fact) = self.facts.get_mut(&id) else {
                    continue;
                };
                match desired.iter().position(|(v, _)| *v == fact.value) {
                    Some(i) => {
                        fact.support = desired[i].1;
                        desired.remove(i);
                    }
                    None => self.remove_fact(links, slot_id, id)?,
                }
            }
            for (value, support) in desired {
                let id = self.add_fact(links, slot_id, value, FactSupport::Preference, true)?;
                if let Some(fact) = self.facts.get_mut(&id) {
                    fact.support = support;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Instantiations
    // -----------------------------------------------------------------------

    pub fn instantiation(&self, id: InstantiationId) -> Option<&Instantiation> {
        self.instantiations.get(&id)
    }

    pub fn instantiation_count(&self) -> usize {
        self.instantiations.len()
    }

    pub fn is_retired(&self, id: InstantiationId) -> bool {
        self.retired.contains(&id)
    }

    /// Record a new firing. Returns false if it is already known.
    pub fn register_instantiation(&mut self, inst: Instantiation) -> bool {
        if self.instantiations.contains_key(&inst.id) {
            return false;
        }
        self.instantiations.insert(inst.id, inst);
        true
    }

    /// Retract a firing: its transient preferences go, durable ones stay.
    ///
    /// Retracting a firing the engine already retracted (through goal
    /// removal) is a no-op returning `None`.
    pub fn retract_instantiation(
        &mut self,
        links: &mut Ownership,
        id: InstantiationId,
    ) -> WmResult<Option<Instantiation>> {
        if self.retired.contains(&id) {
            tracing::debug!(inst = %id, "instantiation already retracted");
            return Ok(None);
        }
        let inst = self
            .instantiations
            .remove(&id)
            .ok_or(StoreError::UnknownInstantiation { instantiation: id.get() })?;
        self.retired.insert(id);
        for pref in &inst.preferences {
            let transient = self
                .preferences
                .get(pref)
                .is_some_and(|p| p.support == Support::Transient);
            if transient {
                self.remove_preference(links, *pref)?;
            }
        }
        Ok(Some(inst))
    }

    /// Live firings that matched at `level` or deeper.
    pub fn instantiations_at_or_below(&self, level: u32) -> Vec<InstantiationId> {
        let mut ids: Vec<InstantiationId> = self
            .instantiations
            .values()
            .filter(|i| i.level >= level)
            .map(|i| i.id)
            .collect();
        ids.sort();
        ids
    }

    /// Firings whose preferences justify a preference-supported fact.
    pub fn supporting_instantiations(&self, fact_id: FactId) -> Vec<InstantiationId> {
        let Some(fact) = self.facts.get(&fact_id) else {
            return Vec::new();
        };
        let Some(slot) = self.slots.get(&fact.slot) else {
            return Vec::new();
        };
        slot.all_preferences
            .iter()
            .filter_map(|p| self.preferences.get(p))
            .filter(|p| p.kind.affects_candidacy() && p.value == fact.value)
            .map(|p| p.instantiation)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Destruction
    // -----------------------------------------------------------------------

    /// Release an unreachable object: its slots, their preferences and facts.
    ///
    /// Link removals implied by the released facts are posted to `links`
    /// and processed by the next flush.
    pub fn destroy_object(&mut self, links: &mut Ownership, id: ObjectId) -> WmResult<Object> {
        let slot_ids = self.require_object(id)?.slots.clone();
        for slot_id in slot_ids {
            let prefs = self
                .slots
                .get(&slot_id)
                .map(|s| s.all_preferences.clone())
                .unwrap_or_default();
            for pref in prefs {
                self.remove_preference(links, pref)?;
            }
            let facts: Vec<FactId> = self
                .slots
                .get(&slot_id)
                .map(|s| s.facts.iter().chain(s.acceptable_facts.iter()).copied().collect())
                .unwrap_or_default();
            for fact in facts {
                self.remove_fact(links, slot_id, fact)?;
            }
            if let Some(slot) = self.slots.remove(&slot_id) {
                self.slot_index.remove(&(slot.object, slot.attr));
            }
            self.pending_acceptable.retain(|s| *s != slot_id);
        }
        let object = self
            .objects
            .remove(&id)
            .ok_or(StoreError::UnknownObject { object: id.get() })?;
        self.names.remove(&object.name);
        tracing::trace!(object = %object.name, "object destroyed");
        Ok(object)
    }
}
