//! Decision phase: the goal stack, impasses and the decision procedure.
//!
//! Every goal owns one decision slot (`(goal ^operator)`). The procedure
//! walks the goal stack from the top down and stops at the first level whose
//! state changes, because a change at a shallow level invalidates every goal
//! below it.
//!
//! When resolution fails an impasse goal is created one level down, carrying
//! architecture facts that describe the impasse:
//!
//! ```text
//! (S2 ^type state) (S2 ^superstate S1) (S2 ^impasse tie)
//! (S2 ^attribute operator) (S2 ^choices multiple) (S2 ^item O1) (S2 ^item O2)
//! (S2 ^quiescence t)
//! ```

use serde::Serialize;

use crate::engine::Engine;
use crate::error::{StoreError, WmResult};
use crate::resolve::{ImpasseKind, Resolution, is_justified, resolve};
use crate::run::Phase;
use crate::store::FactSupport;
use crate::symbol::{FactId, ObjectId, SlotId, Value};

/// What an impasse is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpasseAttribute {
    /// The goal's decision slot has no candidates at all.
    State,
    /// The candidates could not be narrowed to one, or the committed
    /// operator made no progress.
    Operator,
}

impl ImpasseAttribute {
    pub fn as_str(self) -> &'static str {
        match self {
            ImpasseAttribute::State => "state",
            ImpasseAttribute::Operator => "operator",
        }
    }
}

/// Why an impasse goal exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpasseInfo {
    pub kind: ImpasseKind,
    pub attribute: ImpasseAttribute,
    pub items: Vec<Value>,
}

impl ImpasseInfo {
    fn choices(&self) -> &'static str {
        match self.kind {
            ImpasseKind::Tie | ImpasseKind::Conflict => "multiple",
            ImpasseKind::ConstraintFailure => "constraint-failure",
            ImpasseKind::NoChange => "none",
        }
    }
}

/// One level of the goal stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalFrame {
    pub goal: ObjectId,
    /// 1 for the top goal.
    pub level: u32,
    pub operator_slot: SlotId,
    /// `None` for the top goal.
    pub impasse: Option<ImpasseInfo>,
}

/// Result of one decision cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// A value was committed to a goal's decision slot.
    Committed { goal: ObjectId, value: Value },
    /// An impasse goal was created below `goal`.
    ImpasseCreated {
        goal: ObjectId,
        subgoal: ObjectId,
        kind: ImpasseKind,
        attribute: ImpasseAttribute,
    },
    /// Nothing changed on the goal stack.
    Unchanged,
    /// An impasse would have exceeded the configured goal depth.
    GoalDepthExceeded,
}

/// A decision outcome with printable context, as delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub cycle: u64,
    /// Goal level the decision was made at; 0 when nothing changed.
    pub level: u32,
    pub outcome: DecisionOutcome,
    pub summary: String,
}

impl std::fmt::Display for DecisionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>5}: ", self.cycle)?;
        for _ in 1..self.level {
            write!(f, "   ")?;
        }
        write!(f, "{}", self.summary)
    }
}

impl Engine {
    // -----------------------------------------------------------------------
    // Goals
    // -----------------------------------------------------------------------

    pub(crate) fn create_top_goal(&mut self) -> WmResult<ObjectId> {
        self.create_goal(None, None)
    }

    /// Push a goal one level below the current bottom of the stack.
    fn create_goal(
        &mut self,
        superstate: Option<ObjectId>,
        impasse: Option<ImpasseInfo>,
    ) -> WmResult<ObjectId> {
        let level = self.goals.len() as u32 + 1;
        let goal = self.store.new_object('S')?;
        if let Some(obj) = self.store.object_mut(goal) {
            obj.goal_level = Some(level);
        }
        self.ownership.touch(goal);
        let operator_attr = Value::sym(self.config.operator_attribute.clone());
        let operator_slot = self.store.find_or_create_slot(goal, &operator_attr, true)?;

        let mut arch: Vec<(&str, Value)> = vec![
            ("type", Value::sym("state")),
            ("superstate", superstate.map(Value::from).unwrap_or_else(|| Value::sym("nil"))),
        ];
        if let Some(info) = &impasse {
            arch.push(("impasse", Value::sym(info.kind.as_str())));
            arch.push(("attribute", Value::sym(info.attribute.as_str())));
            arch.push(("choices", Value::sym(info.choices())));
            arch.extend(info.items.iter().map(|v| ("item", v.clone())));
            arch.push(("quiescence", Value::sym("t")));
        }
        for (attr, value) in arch {
            self.add_arch_fact(goal, attr, value)?;
        }

        self.counters.goals_created += 1;
        tracing::debug!(goal = %self.store.name_of(goal), level, "goal created");
        self.goals.push(GoalFrame {
            goal,
            level,
            operator_slot,
            impasse,
        });
        Ok(goal)
    }

    fn add_arch_fact(&mut self, goal: ObjectId, attr: &str, value: Value) -> WmResult<FactId> {
        let slot = self.store.find_or_create_slot(goal, &Value::sym(attr), false)?;
        self.store
            .add_fact(&mut self.ownership, slot, value, FactSupport::Permanent, false)
    }

    /// Remove the bottom goal: retract the firings that matched in it, drop
    /// its committed value and its anchor. The goal object itself is
    /// collected by the next flush unless something still links to it.
    fn remove_bottom_goal(&mut self) -> WmResult<()> {
        if self.goals.len() <= 1 {
            return Ok(());
        }
        let Some(frame) = self.goals.pop() else {
            return Ok(());
        };

        for inst in self.store.instantiations_at_or_below(frame.level) {
            self.retract_instantiation(inst)?;
        }
        if let Some((fact, _)) = self.committed(&frame) {
            self.store
                .remove_fact(&mut self.ownership, frame.operator_slot, fact)?;
        }
        if let Some(obj) = self.store.object_mut(frame.goal) {
            obj.goal_level = None;
        }
        self.ownership.touch(frame.goal);
        self.gds.detach_goal(&mut self.store, frame.goal);
        if let Some(parent) = self.goals.last() {
            let slot = parent.operator_slot;
            if let Some(slot) = self.store.slot_mut(slot) {
                slot.impasse = None;
            }
        }
        self.counters.goals_removed += 1;
        tracing::debug!(
            goal = %self.store.name_of(frame.goal),
            level = frame.level,
            "goal removed"
        );
        Ok(())
    }

    /// Remove every goal strictly below stack index `idx`.
    fn remove_goals_below(&mut self, idx: usize) -> WmResult<usize> {
        let mut removed = 0;
        while self.goals.len() > idx + 1 {
            self.remove_bottom_goal()?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove goals whose dependency sets were invalidated, each together
    /// with everything below it.
    pub(crate) fn remove_invalidated_goals(&mut self) -> WmResult<()> {
        while self.gds.has_invalidated() {
            for goal in self.gds.take_invalidated(&self.store) {
                let Some(idx) = self.goals.iter().position(|f| f.goal == goal) else {
                    continue;
                };
                if idx == 0 {
                    continue;
                }
                let name = self.store.name_of(goal);
                let removed = self.remove_goals_below(idx - 1)?;
                self.counters.goals_removed_by_gds += removed as u64;
                tracing::debug!(goal = %name, removed, "goal removed by dependency set");
            }
            self.process_fact_changes();
        }
        Ok(())
    }

    /// The committed value of a goal's decision slot.
    fn committed(&self, frame: &GoalFrame) -> Option<(FactId, Value)> {
        let slot = self.store.slot(frame.operator_slot)?;
        let fact = self.store.fact(*slot.facts.first()?)?;
        Some((fact.id, fact.value.clone()))
    }

    fn still_justified(&self, frame: &GoalFrame, value: &Value) -> bool {
        let prefs = self.store.slot_preferences(frame.operator_slot);
        is_justified(&prefs, value)
    }

    /// Withdraw the committed value at stack index `idx`, removing the goals
    /// below it first.
    fn retract_committed(&mut self, idx: usize) -> WmResult<()> {
        self.remove_goals_below(idx)?;
        let Some(frame) = self.goals.get(idx).cloned() else {
            return Ok(());
        };
        if let Some((fact, value)) = self.committed(&frame) {
            tracing::debug!(
                goal = %self.store.name_of(frame.goal),
                value = %self.render(&value),
                "committed value retracted"
            );
            self.store
                .remove_fact(&mut self.ownership, frame.operator_slot, fact)?;
        }
        Ok(())
    }

    /// Retract the shallowest committed value that is no longer justified.
    pub(crate) fn check_consistency(&mut self) -> WmResult<()> {
        for idx in 0..self.goals.len() {
            let frame = self.goals[idx].clone();
            let Some((_, value)) = self.committed(&frame) else {
                continue;
            };
            if !self.still_justified(&frame, &value) {
                self.retract_committed(idx)?;
                self.counters.consistency_retractions += 1;
                self.process_fact_changes();
                break;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Decision phase
    // -----------------------------------------------------------------------

    /// Run one decision phase and notify decision observers.
    pub fn decide(&mut self) -> WmResult<DecisionOutcome> {
        self.ensure_running()?;
        let result = self.decide_inner();
        let (level, outcome) = self.check(result)?;

        self.counters.decision_cycles += 1;
        self.reset_elaborations();
        self.set_phase(Phase::Output);

        let record = DecisionRecord {
            cycle: self.counters.decision_cycles,
            level,
            summary: self.summarize(&outcome),
            outcome: outcome.clone(),
        };
        tracing::debug!(cycle = record.cycle, summary = %record.summary, "decision");
        for obs in &self.decision_observers {
            obs.decision_made(&record);
        }
        Ok(outcome)
    }

    fn decide_inner(&mut self) -> WmResult<(u32, DecisionOutcome)> {
        self.store.sync_acceptable_facts(&mut self.ownership)?;
        self.process_fact_changes();
        self.remove_invalidated_goals()?;
        self.flush_ownership()?;
        self.remove_invalidated_goals()?;

        let decided = self.decision_procedure()?;

        self.store.sync_acceptable_facts(&mut self.ownership)?;
        self.process_fact_changes();
        self.flush_ownership()?;
        Ok(decided)
    }

    /// Walk the goal stack top-down and change the first level that needs it.
    fn decision_procedure(&mut self) -> WmResult<(u32, DecisionOutcome)> {
        let mut idx = 0;
        while let Some(frame) = self.goals.get(idx).cloned() {
            let has_subgoal = idx + 1 < self.goals.len();

            if let Some((_, value)) = self.committed(&frame) {
                if self.still_justified(&frame, &value) {
                    if has_subgoal {
                        idx += 1;
                        continue;
                    }
                    let outcome = self.impasse(
                        idx,
                        ImpasseKind::NoChange,
                        ImpasseAttribute::Operator,
                        vec![value],
                    )?;
                    return Ok((frame.level, outcome));
                }
                self.retract_committed(idx)?;
            } else {
                let changed = self
                    .store
                    .slot(frame.operator_slot)
                    .is_some_and(|s| s.changed);
                if !changed && has_subgoal {
                    idx += 1;
                    continue;
                }
            }

            let resolution = {
                let prefs = self.store.slot_preferences(frame.operator_slot);
                resolve(&prefs)
            };
            if let Some(slot) = self.store.slot_mut(frame.operator_slot) {
                slot.changed = false;
            }

            match resolution {
                Resolution::Selected { value, .. } => {
                    self.remove_goals_below(idx)?;
                    let slot = frame.operator_slot;
                    self.store
                        .add_fact(
                            &mut self.ownership,
                            slot,
                            value.clone(),
                            FactSupport::Permanent,
                            false,
                        )?;
                    if let Some(slot) = self.store.slot_mut(slot) {
                        slot.impasse = None;
                    }
                    return Ok((
                        frame.level,
                        DecisionOutcome::Committed {
                            goal: frame.goal,
                            value,
                        },
                    ));
                }
                Resolution::Impasse { kind, items } => {
                    let attribute = if kind == ImpasseKind::NoChange {
                        ImpasseAttribute::State
                    } else {
                        ImpasseAttribute::Operator
                    };
                    let same = self
                        .goals
                        .get(idx + 1)
                        .and_then(|sub| sub.impasse.as_ref())
                        .is_some_and(|info| info.kind == kind && info.attribute == attribute);
                    if same {
                        self.update_impasse_items(idx + 1, items)?;
                        idx += 1;
                        continue;
                    }
                    let outcome = self.impasse(idx, kind, attribute, items)?;
                    return Ok((frame.level, outcome));
                }
            }
        }
        Ok((0, DecisionOutcome::Unchanged))
    }

    /// Replace whatever hangs below stack index `idx` with a new impasse goal.
    fn impasse(
        &mut self,
        idx: usize,
        kind: ImpasseKind,
        attribute: ImpasseAttribute,
        items: Vec<Value>,
    ) -> WmResult<DecisionOutcome> {
        self.remove_goals_below(idx)?;
        let Some(parent) = self.goals.get(idx).cloned() else {
            return Ok(DecisionOutcome::Unchanged);
        };
        if parent.level >= self.config.max_goal_depth {
            tracing::warn!(
                depth = self.config.max_goal_depth,
                goal = %self.store.name_of(parent.goal),
                "goal stack depth exceeded"
            );
            return Ok(DecisionOutcome::GoalDepthExceeded);
        }
        let info = ImpasseInfo {
            kind,
            attribute,
            items,
        };
        let subgoal = self.create_goal(Some(parent.goal), Some(info))?;
        if let Some(slot) = self.store.slot_mut(parent.operator_slot) {
            slot.impasse = Some(subgoal);
        }
        self.counters.record_impasse(kind);
        Ok(DecisionOutcome::ImpasseCreated {
            goal: parent.goal,
            subgoal,
            kind,
            attribute,
        })
    }

    /// Bring an existing impasse goal's `^item` facts in line with `items`.
    fn update_impasse_items(&mut self, sub_idx: usize, items: Vec<Value>) -> WmResult<()> {
        let Some(frame) = self.goals.get(sub_idx).cloned() else {
            return Ok(());
        };
        let Some(old) = frame.impasse.as_ref().map(|i| i.items.clone()) else {
            return Ok(());
        };
        if old == items {
            return Ok(());
        }
        let item = Value::sym("item");
        for gone in old.iter().filter(|v| !items.contains(v)) {
            self.store
                .retract_permanent_fact(&mut self.ownership, frame.goal, &item, gone)?;
        }
        for new in items.iter().filter(|v| !old.contains(v)) {
            self.add_arch_fact(frame.goal, "item", new.clone())?;
        }
        match self.goals.get_mut(sub_idx).and_then(|f| f.impasse.as_mut()) {
            Some(info) => info.items = items,
            None => {
                return Err(StoreError::UnknownObject {
                    object: frame.goal.get(),
                }
                .into());
            }
        }
        self.process_fact_changes();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The impasse goal hanging below `goal`, with what it is about.
    pub fn current_impasse(&self, goal: ObjectId) -> Option<(ObjectId, &ImpasseInfo)> {
        let idx = self.goals.iter().position(|f| f.goal == goal)?;
        let sub = self.goals.get(idx + 1)?;
        sub.impasse.as_ref().map(|info| (sub.goal, info))
    }

    fn summarize(&self, outcome: &DecisionOutcome) -> String {
        match outcome {
            DecisionOutcome::Committed { goal, value } => {
                format!("O: {} ({})", self.render(value), self.store.name_of(*goal))
            }
            DecisionOutcome::ImpasseCreated {
                subgoal,
                kind,
                attribute,
                ..
            } => format!(
                "==>S: {} ({} {})",
                self.store.name_of(*subgoal),
                attribute.as_str(),
                kind
            ),
            DecisionOutcome::Unchanged => "no change".to_string(),
            DecisionOutcome::GoalDepthExceeded => "goal stack depth exceeded".to_string(),
        }
    }
}
