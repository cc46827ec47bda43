//! Engine facade: top-level API for the decision engine.
//!
//! The `Engine` owns one agent's entire working memory: the fact/preference
//! store, the ownership tracker, the dependency-set manager and the goal
//! stack. All mutation goes through it on one thread; nothing here is shared
//! between engines.

use std::sync::Arc;

use crate::decide::GoalFrame;
use crate::error::{RunError, StoreError, WmResult};
use crate::event::{InstantiationTag, PreferenceSpec, WmEvent};
use crate::gds::GdsManager;
use crate::observer::{DecisionObserver, FactObserver, RetractionListener};
use crate::ownership::{FlushReport, Ownership};
use crate::preference::{Preference, PreferenceType, Support};
use crate::run::Phase;
use crate::stats::{Counters, Statistics};
use crate::store::{Fact, Instantiation, Store};
use crate::symbol::{FactId, InstantiationId, ObjectId, Value};

pub use crate::config::EngineConfig;
use crate::config::PROTECTED_PARAMS;

/// One agent's working-memory consistency and decision engine.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Store,
    pub(crate) ownership: Ownership,
    pub(crate) gds: GdsManager,
    pub(crate) goals: Vec<GoalFrame>,
    pub(crate) counters: Counters,
    pub(crate) top: ObjectId,
    pub(crate) fact_observers: Vec<Arc<dyn FactObserver>>,
    pub(crate) storage: Vec<Arc<dyn FactObserver>>,
    pub(crate) retraction_listeners: Vec<Arc<dyn RetractionListener>>,
    pub(crate) decision_observers: Vec<Arc<dyn DecisionObserver>>,
    phase: Phase,
    elaborations_this_cycle: u32,
    halted: Option<String>,
}

impl Engine {
    /// Create an engine with an empty working memory and a top goal.
    pub fn new(config: EngineConfig) -> WmResult<Self> {
        config.validate()?;
        tracing::info!(
            max_elaborations = config.max_elaborations,
            max_goal_depth = config.max_goal_depth,
            operator_attribute = %config.operator_attribute,
            "initializing decision engine"
        );
        let store = Store::new(config.limits(), config.track_acceptable_facts);
        let mut engine = Self {
            config,
            store,
            ownership: Ownership::default(),
            gds: GdsManager::new(),
            goals: Vec::new(),
            counters: Counters::default(),
            // Replaced by the real top goal below.
            top: ObjectId::from(std::num::NonZeroU64::MIN),
            fact_observers: Vec::new(),
            storage: Vec::new(),
            retraction_listeners: Vec::new(),
            decision_observers: Vec::new(),
            phase: Phase::Input,
            elaborations_this_cycle: 0,
            halted: None,
        };
        engine.top = engine.create_top_goal()?;
        engine.flush_ownership()?;
        Ok(engine)
    }

    /// Discard all working memory and start over with a fresh top goal.
    ///
    /// Configuration and subscribers survive; counters do not. Clears a halt.
    pub fn reinitialize(&mut self) -> WmResult<()> {
        tracing::info!("reinitializing decision engine");
        self.store = Store::new(self.config.limits(), self.config.track_acceptable_facts);
        self.ownership.clear();
        self.gds = GdsManager::new();
        self.goals.clear();
        self.counters = Counters::default();
        self.phase = Phase::Input;
        self.elaborations_this_cycle = 0;
        self.halted = None;
        let result = self
            .create_top_goal()
            .and_then(|top| self.flush_ownership().map(|_| top));
        self.top = self.check(result)?;
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The phase the next [`Engine::run`] step will execute.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn elaborations_this_cycle(&self) -> u32 {
        self.elaborations_this_cycle
    }

    pub(crate) fn reset_elaborations(&mut self) {
        self.elaborations_this_cycle = 0;
    }

    /// Why the engine halted, if a fatal error stopped it.
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub(crate) fn ensure_running(&self) -> WmResult<()> {
        match &self.halted {
            Some(reason) => Err(RunError::Halted {
                reason: reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Record a fatal error as a halt before handing it back.
    pub(crate) fn check<T>(&mut self, result: WmResult<T>) -> WmResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!(error = %e, "fatal engine error, halting");
                self.halted = Some(e.to_string());
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Create a fresh object. It is collected at the next flush unless
    /// something links to it by then.
    pub fn new_object(&mut self, letter: char) -> WmResult<ObjectId> {
        self.ensure_running()?;
        let result = self.store.new_object(letter);
        let id = self.check(result)?;
        self.ownership.touch(id);
        Ok(id)
    }

    /// Look up an object by name, creating it if it does not exist.
    pub fn object_named(&mut self, name: &str) -> WmResult<ObjectId> {
        self.ensure_running()?;
        if let Some(id) = self.store.object_by_name(name) {
            return Ok(id);
        }
        let result = self.store.named_object(name);
        let id = self.check(result)?;
        self.ownership.touch(id);
        Ok(id)
    }

    pub fn object_by_name(&self, name: &str) -> Option<ObjectId> {
        self.store.object_by_name(name)
    }

    /// Printable name of an object.
    pub fn object_name(&self, id: ObjectId) -> String {
        self.store.name_of(id)
    }

    /// Printable form of a value, with object references by name.
    pub fn render(&self, value: &Value) -> String {
        match value {
            Value::Object(id) => self.store.name_of(*id),
            other => other.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Apply one matcher event. Link changes stay buffered until the end of
    /// the elaboration cycle.
    pub fn apply(&mut self, event: WmEvent) -> WmResult<()> {
        self.ensure_running()?;
        self.phase = Phase::Elaboration;
        let result = self.apply_event(event);
        self.check(result)
    }

    pub(crate) fn apply_all(&mut self, events: Vec<WmEvent>) -> WmResult<()> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Run one elaboration cycle: apply `events`, then close the cycle.
    pub fn elaborate(&mut self, events: Vec<WmEvent>) -> WmResult<FlushReport> {
        self.ensure_running()?;
        let count = events.len();
        self.apply_all(events)?;
        let report = self.end_elaboration()?;
        self.elaborations_this_cycle += 1;
        self.counters.elaboration_cycles += 1;
        tracing::debug!(
            events = count,
            cycle = self.counters.elaboration_cycles,
            "elaboration cycle"
        );
        Ok(report)
    }

    /// Close an elaboration cycle: refresh acceptable-preference facts, run
    /// the consistency check, remove goals whose dependency sets changed and
    /// flush buffered link changes.
    pub fn end_elaboration(&mut self) -> WmResult<FlushReport> {
        self.ensure_running()?;
        let result = self.end_elaboration_inner();
        self.check(result)
    }

    fn end_elaboration_inner(&mut self) -> WmResult<FlushReport> {
        self.store.sync_acceptable_facts(&mut self.ownership)?;
        self.process_fact_changes();
        if self.config.consistency_check {
            self.check_consistency()?;
        }
        self.remove_invalidated_goals()?;
        self.flush_ownership()
    }

    fn apply_event(&mut self, event: WmEvent) -> WmResult<()> {
        match event {
            WmEvent::AssertFact {
                object,
                attr,
                value,
            } => {
                self.store.require_object(object)?;
                let slot = self.store.find_or_create_slot(object, &attr, false)?;
                self.store.add_fact(
                    &mut self.ownership,
                    slot,
                    value,
                    crate::store::FactSupport::Permanent,
                    false,
                )?;
            }
            WmEvent::RetractFact {
                object,
                attr,
                value,
            } => {
                self.store
                    .retract_permanent_fact(&mut self.ownership, object, &attr, &value)?;
            }
            WmEvent::AssertPreference {
                instantiation,
                preference,
            } => self.assert_preference(instantiation, preference)?,
            WmEvent::RetractPreference {
                instantiation,
                preference,
            } => self.retract_preference(instantiation, &preference)?,
            WmEvent::RetractInstantiation { instantiation } => {
                self.retract_instantiation(instantiation)?;
            }
        }
        self.process_fact_changes();
        Ok(())
    }

    /// Goal level an instantiation matched at: the deepest object among its
    /// condition facts, else the preference's own object.
    fn match_level(&self, tag: &InstantiationTag, spec: &PreferenceSpec) -> (u32, ObjectId) {
        let depth_of = |id: ObjectId| self.store.object(id).and_then(|o| o.depth);
        let level = tag
            .conditions
            .iter()
            .filter_map(|f| self.store.fact(*f))
            .filter_map(|f| depth_of(f.object))
            .max()
            .or_else(|| depth_of(spec.object))
            .unwrap_or(1)
            .clamp(1, self.goals.len().max(1) as u32);
        let goal = self
            .goals
            .get(level as usize - 1)
            .map(|f| f.goal)
            .unwrap_or(self.top);
        (level, goal)
    }

    fn assert_preference(&mut self, tag: InstantiationTag, spec: PreferenceSpec) -> WmResult<()> {
        self.store.require_object(spec.object)?;
        if self.store.is_retired(tag.id) {
            return Err(StoreError::UnknownInstantiation {
                instantiation: tag.id.get(),
            }
            .into());
        }
        let (level, match_goal, support) = match self.store.instantiation(tag.id) {
            Some(inst) => (inst.level, inst.match_goal, inst.support),
            None => {
                let (level, goal) = self.match_level(&tag, &spec);
                self.store.register_instantiation(Instantiation {
                    id: tag.id,
                    rule: tag.rule.clone(),
                    match_goal: goal,
                    level,
                    conditions: tag.conditions.clone(),
                    support: tag.support,
                    preferences: Vec::new(),
                });
                (level, goal, tag.support)
            }
        };

        let slot = self
            .store
            .find_or_create_slot(spec.object, &spec.attr, false)?;
        let context = self.store.slot(slot).is_some_and(|s| s.context);

        if spec.kind == PreferenceType::Reject && support == Support::Durable && !context {
            let removed = self
                .store
                .remove_durable_acceptables(&mut self.ownership, slot, &spec.value)?;
            tracing::debug!(
                rule = %tag.rule,
                value = %self.render(&spec.value),
                removed,
                "durable reject"
            );
            return Ok(());
        }

        self.store
            .add_preference(&mut self.ownership, &spec, slot, level, support, tag.id)?;

        let local = self
            .store
            .object(spec.object)
            .is_some_and(|o| o.depth.is_none_or(|d| d == level));
        if support == Support::Durable && level > 1 && local {
            self.gds.elaborate(&mut self.store, match_goal, tag.id)?;
        }
        Ok(())
    }

    fn retract_preference(&mut self, inst: InstantiationId, spec: &PreferenceSpec) -> WmResult<()> {
        if self.store.is_retired(inst) {
            tracing::debug!(inst = %inst, "preference of retracted instantiation");
            return Ok(());
        }
        let owned = self
            .store
            .instantiation(inst)
            .ok_or(StoreError::UnknownInstantiation {
                instantiation: inst.get(),
            })?;
        let target = owned
            .preferences
            .iter()
            .copied()
            .find(|p| self.store.preference(*p).is_some_and(|p| matches_spec(p, spec)))
            .ok_or(StoreError::PreferenceNotFound {
                instantiation: inst.get(),
            })?;
        self.store.remove_preference(&mut self.ownership, target)?;
        Ok(())
    }

    pub(crate) fn retract_instantiation(&mut self, id: InstantiationId) -> WmResult<()> {
        if let Some(inst) = self.store.retract_instantiation(&mut self.ownership, id)? {
            tracing::trace!(rule = %inst.rule, inst = %id, "instantiation retracted");
            for listener in &self.retraction_listeners {
                listener.instantiation_retracted(&inst);
            }
        }
        Ok(())
    }

    /// Route fact churn to counters, dependency sets and subscribers.
    pub(crate) fn process_fact_changes(&mut self) {
        let added = self.store.take_added_facts();
        let removed = self.store.take_removed_facts();
        for id in added {
            self.counters.facts_added += 1;
            let fact = self
                .store
                .fact(id)
                .or_else(|| removed.iter().find(|f| f.id == id));
            if let Some(fact) = fact {
                for obs in self.fact_observers.iter().chain(&self.storage) {
                    obs.fact_added(fact);
                }
            }
        }
        for fact in &removed {
            self.counters.facts_removed += 1;
            self.gds.on_fact_mutated(fact);
            self.gds.on_fact_removed(&mut self.store, fact);
            for obs in self.fact_observers.iter().chain(&self.storage) {
                obs.fact_removed(fact);
            }
        }
    }

    /// Flush buffered link changes and account for what was collected.
    pub(crate) fn flush_ownership(&mut self) -> WmResult<FlushReport> {
        let report = self.ownership.flush(&mut self.store)?;
        if !report.is_noop() {
            self.counters.flushes += 1;
            self.counters.objects_collected += report.collected.len() as u64;
        }
        self.process_fact_changes();
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Change a parameter by name. Rejected changes leave the previous value
    /// in place and never halt the engine.
    pub fn set_param(&mut self, name: &str, value: &str) -> WmResult<()> {
        if self.storage_connected() && PROTECTED_PARAMS.contains(&name) {
            tracing::warn!(param = name, "protected parameter change rejected");
            return Err(crate::error::ConfigError::Protected {
                name: name.to_string(),
            }
            .into());
        }
        self.config.set(name, value)?;
        self.store.set_limits(self.config.limits());
        if name == "track_acceptable_facts" {
            self.store
                .set_track_acceptable(self.config.track_acceptable_facts);
        }
        tracing::info!(param = name, value, "parameter set");
        Ok(())
    }

    pub fn param(&self, name: &str) -> WmResult<String> {
        Ok(self.config.get(name)?)
    }

    // -----------------------------------------------------------------------
    // Subscribers
    // -----------------------------------------------------------------------

    pub fn add_fact_observer(&mut self, observer: Arc<dyn FactObserver>) {
        self.fact_observers.push(observer);
    }

    pub fn add_retraction_listener(&mut self, listener: Arc<dyn RetractionListener>) {
        self.retraction_listeners.push(listener);
    }

    pub fn add_decision_observer(&mut self, observer: Arc<dyn DecisionObserver>) {
        self.decision_observers.push(observer);
    }

    /// Connect a downstream storage subscriber. While one is connected,
    /// parameters that change which facts exist are protected.
    pub fn connect_storage(&mut self, storage: Arc<dyn FactObserver>) {
        tracing::info!("storage connected");
        self.storage.push(storage);
    }

    pub fn disconnect_storage(&mut self) {
        if !self.storage.is_empty() {
            tracing::info!(count = self.storage.len(), "storage disconnected");
        }
        self.storage.clear();
    }

    pub fn storage_connected(&self) -> bool {
        !self.storage.is_empty()
    }

    // -----------------------------------------------------------------------
    // Queries (read-only)
    // -----------------------------------------------------------------------

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn top_goal(&self) -> ObjectId {
        self.top
    }

    /// Goals from the top down.
    pub fn goal_stack(&self) -> Vec<ObjectId> {
        self.goals.iter().map(|f| f.goal).collect()
    }

    pub fn bottom_goal(&self) -> ObjectId {
        self.goals.last().map(|f| f.goal).unwrap_or(self.top)
    }

    /// First value held by a slot; for a decision slot, the committed value.
    pub fn slot_value(&self, object: ObjectId, attr: &Value) -> Option<Value> {
        self.slot_values(object, attr).into_iter().next()
    }

    pub fn slot_values(&self, object: ObjectId, attr: &Value) -> Vec<Value> {
        let Some(slot) = self.store.find_slot(object, attr).and_then(|s| self.store.slot(s)) else {
            return Vec::new();
        };
        slot.facts
            .iter()
            .filter_map(|f| self.store.fact(*f))
            .map(|f| f.value.clone())
            .collect()
    }

    pub fn preferences_for(&self, object: ObjectId, attr: &Value) -> Vec<&Preference> {
        self.store
            .find_slot(object, attr)
            .map(|s| self.store.slot_preferences(s))
            .unwrap_or_default()
    }

    pub fn find_fact(&self, object: ObjectId, attr: &Value, value: &Value) -> Option<&Fact> {
        self.store
            .find_fact(object, attr, value)
            .and_then(|id| self.store.fact(id))
    }

    pub fn facts_of(&self, object: ObjectId) -> Vec<&Fact> {
        self.store.facts_of(object)
    }

    pub fn object_depth(&self, id: ObjectId) -> Option<u32> {
        self.store.object(id).and_then(|o| o.depth)
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.store.object(id).is_some()
    }

    /// Facts in a goal's dependency set.
    pub fn gds_of(&self, goal: ObjectId) -> Vec<&Fact> {
        self.gds
            .members(&self.store, goal)
            .into_iter()
            .filter_map(|f| self.store.fact(f))
            .collect()
    }

    /// Matched-condition trace of a live instantiation.
    pub fn instantiation_trace(&self, id: InstantiationId) -> Option<&[FactId]> {
        self.store.instantiation(id).map(|i| i.conditions.as_slice())
    }

    pub fn statistics(&self) -> Statistics {
        let (preferences_added, preferences_removed) = self.store.preference_churn();
        Statistics {
            counters: self.counters.clone(),
            preferences_added,
            preferences_removed,
            gds_created: self.gds.created(),
            gds_deleted: self.gds.deleted(),
            live_facts: self.store.fact_count(),
            live_preferences: self.store.preference_count(),
            live_slots: self.store.slot_count(),
            live_objects: self.store.object_count(),
            live_instantiations: self.store.instantiation_count(),
            live_gds: self.gds.len(),
            goal_depth: self.goals.len(),
        }
    }
}

fn matches_spec(pref: &Preference, spec: &PreferenceSpec) -> bool {
    pref.kind == spec.kind
        && pref.object == spec.object
        && pref.attr == spec.attr
        && pref.value == spec.value
        && pref.referent == spec.referent
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("goals", &self.goal_stack())
            .field("facts", &self.store.fact_count())
            .field("halted", &self.halted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, WmError};
    use crate::observer::EventLog;

    fn inst(raw: u64, rule: &str) -> InstantiationTag {
        InstantiationTag::new(InstantiationId::new(raw).unwrap(), rule)
    }

    #[test]
    fn new_engine_has_top_goal() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let top = engine.top_goal();
        assert_eq!(engine.goal_stack(), vec![top]);
        assert_eq!(engine.object_name(top), "S1");
        assert_eq!(engine.object_depth(top), Some(1));
        assert_eq!(
            engine.slot_value(top, &Value::sym("type")),
            Some(Value::sym("state"))
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Engine::new(EngineConfig {
            max_goal_depth: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, WmError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn unsupported_object_is_collected_at_end_of_elaboration() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let top = engine.top_goal();
        let block = engine.new_object('B').unwrap();
        let stray = engine.new_object('X').unwrap();
        engine
            .elaborate(vec![WmEvent::prefer(
                inst(1, "add-block"),
                PreferenceSpec::acceptable(top, "block", block),
            )])
            .unwrap();
        assert!(engine.is_live(block));
        assert!(!engine.is_live(stray));
        assert_eq!(engine.object_depth(block), Some(1));
    }

    #[test]
    fn retraction_notifies_listeners_once() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let log = Arc::new(EventLog::new());
        engine.add_retraction_listener(log.clone());
        let top = engine.top_goal();
        engine
            .apply(WmEvent::prefer(
                inst(1, "mark"),
                PreferenceSpec::acceptable(top, "mark", "on"),
            ))
            .unwrap();
        let id = InstantiationId::new(1).unwrap();
        assert!(engine.instantiation_trace(id).is_some());
        engine
            .apply(WmEvent::RetractInstantiation { instantiation: id })
            .unwrap();
        engine
            .apply(WmEvent::RetractInstantiation { instantiation: id })
            .unwrap();
        assert_eq!(log.len(), 1);
        assert!(engine.slot_value(top, &Value::sym("mark")).is_none());
        assert!(engine.instantiation_trace(id).is_none());
    }

    #[test]
    fn protected_parameter_while_storage_connected() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.connect_storage(Arc::new(EventLog::new()));
        let err = engine.set_param("track_acceptable_facts", "off").unwrap_err();
        assert!(matches!(err, WmError::Config(ConfigError::Protected { .. })));
        assert_eq!(engine.param("track_acceptable_facts").unwrap(), "true");
        assert!(engine.halted().is_none());

        engine.set_param("max_elaborations", "5").unwrap();
        engine.disconnect_storage();
        engine.set_param("track_acceptable_facts", "off").unwrap();
        assert!(!engine.config().track_acceptable_facts);
    }

    #[test]
    fn contract_violation_halts_engine() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let top = engine.top_goal();
        let err = engine
            .apply(WmEvent::retract_fact(top, "color", "blue"))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(engine.halted().is_some());
        assert!(matches!(
            engine.apply(WmEvent::assert_fact(top, "color", "red")),
            Err(WmError::Run(RunError::Halted { .. }))
        ));

        engine.reinitialize().unwrap();
        assert!(engine.halted().is_none());
        let top = engine.top_goal();
        engine
            .apply(WmEvent::assert_fact(top, "color", "red"))
            .unwrap();
    }

    #[test]
    fn durable_reject_removes_durable_value() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let top = engine.top_goal();
        engine
            .elaborate(vec![WmEvent::prefer(
                inst(1, "count").durable(),
                PreferenceSpec::acceptable(top, "count", 1i64),
            )])
            .unwrap();
        engine
            .apply(WmEvent::RetractInstantiation {
                instantiation: InstantiationId::new(1).unwrap(),
            })
            .unwrap();
        assert_eq!(engine.slot_value(top, &Value::sym("count")), Some(Value::Int(1)));

        engine
            .elaborate(vec![WmEvent::prefer(
                inst(2, "reset").durable(),
                PreferenceSpec::new(PreferenceType::Reject, top, "count", 1i64),
            )])
            .unwrap();
        assert!(engine.slot_value(top, &Value::sym("count")).is_none());
    }
}
