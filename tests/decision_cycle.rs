//! End-to-end tests for the decision cycle.
//!
//! These drive the engine through its public API only: matcher events in,
//! decisions and working-memory queries out.

use std::sync::Arc;

use wm_decider::decide::{DecisionOutcome, ImpasseAttribute};
use wm_decider::engine::{Engine, EngineConfig};
use wm_decider::event::{InstantiationTag, PreferenceSpec, WmEvent};
use wm_decider::observer::EventLog;
use wm_decider::preference::PreferenceType;
use wm_decider::resolve::ImpasseKind;
use wm_decider::symbol::{InstantiationId, ObjectId, Value};

fn test_engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

fn tag(raw: u64, rule: &str) -> InstantiationTag {
    InstantiationTag::new(InstantiationId::new(raw).unwrap(), rule)
}

fn inst(raw: u64) -> InstantiationId {
    InstantiationId::new(raw).unwrap()
}

fn propose(raw: u64, goal: ObjectId, op: ObjectId) -> WmEvent {
    WmEvent::prefer(
        tag(raw, &format!("propose-{raw}")),
        PreferenceSpec::acceptable(goal, "operator", op),
    )
}

fn operator() -> Value {
    Value::sym("operator")
}

/// Every live object has a depth after a flush, and nothing else exists.
fn assert_reachability(engine: &Engine) {
    for obj in engine.store().objects() {
        assert!(
            obj.depth.is_some(),
            "live object {} has no depth after flush",
            obj.name
        );
    }
}

#[test]
fn two_acceptable_operators_tie() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let a = engine.new_object('O').unwrap();
    let b = engine.new_object('O').unwrap();
    engine
        .elaborate(vec![propose(1, top, a), propose(2, top, b)])
        .unwrap();

    let outcome = engine.decide().unwrap();
    let DecisionOutcome::ImpasseCreated {
        goal,
        subgoal,
        kind,
        attribute,
    } = outcome
    else {
        panic!("expected a tie, got {outcome:?}");
    };
    assert_eq!(goal, top);
    assert_eq!(kind, ImpasseKind::Tie);
    assert_eq!(attribute, ImpasseAttribute::Operator);
    assert_eq!(
        engine.slot_value(subgoal, &Value::sym("impasse")),
        Some(Value::sym("tie"))
    );
    assert_eq!(
        engine.slot_value(subgoal, &Value::sym("choices")),
        Some(Value::sym("multiple"))
    );
    assert_eq!(engine.statistics().counters.impasses_of(ImpasseKind::Tie), 1);
    assert_reachability(&engine);
}

#[test]
fn prohibited_only_candidate_is_a_constraint_failure() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let a = engine.new_object('O').unwrap();
    engine
        .elaborate(vec![
            propose(1, top, a),
            WmEvent::prefer(
                tag(2, "forbid"),
                PreferenceSpec::new(PreferenceType::Prohibit, top, "operator", a),
            ),
        ])
        .unwrap();

    let outcome = engine.decide().unwrap();
    let DecisionOutcome::ImpasseCreated { subgoal, kind, .. } = outcome else {
        panic!("expected an impasse, got {outcome:?}");
    };
    assert_eq!(kind, ImpasseKind::ConstraintFailure);
    assert_eq!(
        engine.slot_values(subgoal, &Value::sym("item")),
        vec![Value::from(a)]
    );
    assert!(engine.slot_value(top, &operator()).is_none());
}

#[test]
fn better_preference_breaks_tie() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let a = engine.new_object('O').unwrap();
    let b = engine.new_object('O').unwrap();
    engine
        .elaborate(vec![
            propose(1, top, a),
            propose(2, top, b),
            WmEvent::prefer(
                tag(3, "prefer-b"),
                PreferenceSpec::new(PreferenceType::Better, top, "operator", b).with_referent(a),
            ),
        ])
        .unwrap();

    assert_eq!(
        engine.decide().unwrap(),
        DecisionOutcome::Committed {
            goal: top,
            value: Value::from(b)
        }
    );
}

#[test]
fn cyclic_better_preferences_conflict() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let a = engine.new_object('O').unwrap();
    let b = engine.new_object('O').unwrap();
    engine
        .elaborate(vec![
            propose(1, top, a),
            propose(2, top, b),
            WmEvent::prefer(
                tag(3, "a-over-b"),
                PreferenceSpec::new(PreferenceType::Better, top, "operator", a).with_referent(b),
            ),
            WmEvent::prefer(
                tag(4, "b-over-a"),
                PreferenceSpec::new(PreferenceType::Better, top, "operator", b).with_referent(a),
            ),
        ])
        .unwrap();

    let outcome = engine.decide().unwrap();
    assert!(matches!(
        outcome,
        DecisionOutcome::ImpasseCreated {
            kind: ImpasseKind::Conflict,
            ..
        }
    ));
}

#[test]
fn ancestor_premise_removal_removes_subgoal() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    engine
        .elaborate(vec![WmEvent::assert_fact(top, "color", "red")])
        .unwrap();

    // Nothing proposed: a state no-change subgoal.
    let DecisionOutcome::ImpasseCreated { subgoal, .. } = engine.decide().unwrap() else {
        panic!("expected a subgoal");
    };
    assert_eq!(engine.goal_stack(), vec![top, subgoal]);

    // A durable result in the subgoal that read a fact of the top goal.
    let premise = engine
        .find_fact(top, &Value::sym("color"), &Value::sym("red"))
        .unwrap()
        .id;
    let link = engine
        .find_fact(subgoal, &Value::sym("superstate"), &Value::from(top))
        .unwrap()
        .id;
    let widget = engine.new_object('W').unwrap();
    engine
        .elaborate(vec![
            WmEvent::prefer(
                tag(1, "make-widget")
                    .with_conditions(vec![premise, link])
                    .durable(),
                PreferenceSpec::acceptable(subgoal, "result", widget),
            ),
            WmEvent::assert_fact(widget, "name", "gizmo"),
        ])
        .unwrap();
    assert_eq!(engine.object_depth(widget), Some(2));
    let members: Vec<_> = engine.gds_of(subgoal).iter().map(|f| f.id).collect();
    assert_eq!(members, vec![premise]);

    // Changing the premise invalidates the subgoal and everything it built.
    engine
        .elaborate(vec![WmEvent::retract_fact(top, "color", "red")])
        .unwrap();
    engine.elaborate(Vec::new()).unwrap();

    assert_eq!(engine.goal_stack(), vec![top]);
    assert!(!engine.is_live(subgoal));
    assert!(!engine.is_live(widget));
    let stats = engine.statistics();
    assert_eq!(stats.counters.goals_removed_by_gds, 1);
    assert_eq!(stats.live_gds, 0);
    assert_reachability(&engine);
}

#[test]
fn ancestor_premise_removal_takes_every_goal_below() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    engine
        .elaborate(vec![WmEvent::assert_fact(top, "color", "red")])
        .unwrap();
    let DecisionOutcome::ImpasseCreated { subgoal: middle, .. } = engine.decide().unwrap() else {
        panic!("expected a subgoal");
    };

    // The middle goal's dependency set holds the top goal's color.
    let premise = engine
        .find_fact(top, &Value::sym("color"), &Value::sym("red"))
        .unwrap()
        .id;
    let middle_link = engine
        .find_fact(middle, &Value::sym("superstate"), &Value::from(top))
        .unwrap()
        .id;
    let widget = engine.new_object('W').unwrap();
    engine
        .elaborate(vec![WmEvent::prefer(
            tag(1, "make-widget")
                .with_conditions(vec![premise, middle_link])
                .durable(),
            PreferenceSpec::acceptable(middle, "result", widget),
        )])
        .unwrap();

    // Nothing proposed in the middle goal either: a third level.
    let DecisionOutcome::ImpasseCreated {
        goal,
        subgoal: bottom,
        kind: ImpasseKind::NoChange,
        ..
    } = engine.decide().unwrap()
    else {
        panic!("expected a no-change below the middle goal");
    };
    assert_eq!(goal, middle);
    assert_eq!(engine.goal_stack(), vec![top, middle, bottom]);

    let bottom_link = engine
        .find_fact(bottom, &Value::sym("superstate"), &Value::from(middle))
        .unwrap()
        .id;
    let gadget = engine.new_object('G').unwrap();
    engine
        .elaborate(vec![
            WmEvent::prefer(
                tag(2, "make-gadget").with_conditions(vec![bottom_link]),
                PreferenceSpec::acceptable(bottom, "part", gadget),
            ),
            WmEvent::assert_fact(gadget, "name", "sprocket"),
        ])
        .unwrap();
    assert_eq!(engine.object_depth(gadget), Some(3));
    assert_eq!(engine.object_depth(widget), Some(2));

    engine
        .elaborate(vec![WmEvent::retract_fact(top, "color", "red")])
        .unwrap();
    engine.elaborate(Vec::new()).unwrap();

    assert_eq!(engine.goal_stack(), vec![top]);
    for dead in [middle, bottom, widget, gadget] {
        assert!(!engine.is_live(dead));
    }
    let stats = engine.statistics();
    assert_eq!(stats.counters.goals_removed_by_gds, 2);
    assert_eq!(stats.counters.decision_cycles, 2);
    assert_eq!(stats.live_gds, 0);
    assert_reachability(&engine);
}

#[test]
fn mutual_cycle_is_collected_once_detached() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let a = engine.new_object('A').unwrap();
    let b = engine.new_object('B').unwrap();
    engine
        .elaborate(vec![
            WmEvent::assert_fact(top, "link", a),
            WmEvent::assert_fact(a, "next", b),
            WmEvent::assert_fact(b, "next", a),
        ])
        .unwrap();
    assert!(engine.is_live(a) && engine.is_live(b));
    assert_eq!(engine.object_depth(b), Some(1));

    engine
        .elaborate(vec![WmEvent::retract_fact(top, "link", a)])
        .unwrap();
    engine.elaborate(Vec::new()).unwrap();

    assert!(!engine.is_live(a));
    assert!(!engine.is_live(b));
    assert!(engine.facts_of(a).is_empty());
    assert_reachability(&engine);
}

#[test]
fn second_path_keeps_object_alive() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let a = engine.new_object('A').unwrap();
    let b = engine.new_object('B').unwrap();
    engine
        .elaborate(vec![
            WmEvent::assert_fact(top, "link", a),
            WmEvent::assert_fact(top, "other", b),
            WmEvent::assert_fact(b, "also", a),
        ])
        .unwrap();
    engine
        .elaborate(vec![WmEvent::retract_fact(top, "link", a)])
        .unwrap();

    assert!(engine.is_live(a));
    assert_eq!(engine.object_depth(a), Some(1));
}

#[test]
fn supported_fact_lives_until_last_support_goes() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let color = Value::sym("color");
    let red = Value::sym("red");
    engine
        .elaborate(vec![
            WmEvent::prefer(tag(1, "paint"), PreferenceSpec::acceptable(top, "color", "red")),
            WmEvent::prefer(tag(2, "repaint"), PreferenceSpec::acceptable(top, "color", "red")),
        ])
        .unwrap();
    let fact = engine.find_fact(top, &color, &red).unwrap();
    let id = fact.id;
    assert_eq!(fact.support, 2);

    engine
        .elaborate(vec![WmEvent::RetractInstantiation { instantiation: inst(1) }])
        .unwrap();
    let fact = engine.find_fact(top, &color, &red).unwrap();
    assert_eq!(fact.id, id);
    assert_eq!(fact.support, 1);

    engine
        .elaborate(vec![WmEvent::RetractInstantiation { instantiation: inst(2) }])
        .unwrap();
    assert!(engine.find_fact(top, &color, &red).is_none());
}

#[test]
fn unsupported_commitment_is_withdrawn_and_replaced() {
    let mut engine = test_engine();
    let top = engine.top_goal();
    let a = engine.new_object('O').unwrap();
    let b = engine.new_object('O').unwrap();
    engine.elaborate(vec![propose(1, top, a)]).unwrap();
    engine.decide().unwrap();
    assert_eq!(engine.slot_value(top, &operator()), Some(Value::from(a)));

    engine
        .elaborate(vec![
            WmEvent::RetractInstantiation { instantiation: inst(1) },
            propose(2, top, b),
        ])
        .unwrap();
    assert!(engine.slot_value(top, &operator()).is_none());

    assert_eq!(
        engine.decide().unwrap(),
        DecisionOutcome::Committed {
            goal: top,
            value: Value::from(b)
        }
    );
}

#[test]
fn same_events_give_same_decisions() {
    fn trace() -> Vec<String> {
        let mut engine = test_engine();
        let log = Arc::new(EventLog::new());
        engine.add_decision_observer(log.clone());
        let top = engine.top_goal();
        let ops: Vec<ObjectId> = (0..4).map(|_| engine.new_object('O').unwrap()).collect();
        engine
            .elaborate(ops.iter().enumerate().map(|(i, op)| propose(i as u64 + 1, top, *op)).collect())
            .unwrap();
        engine.decide().unwrap();
        engine
            .elaborate(vec![WmEvent::prefer(
                tag(10, "indifferent"),
                PreferenceSpec::new(PreferenceType::UnaryIndifferent, top, "operator", ops[2]),
            )])
            .unwrap();
        engine.decide().unwrap();
        engine.decide().unwrap();
        log.decisions().into_iter().map(|d| d.to_string()).collect()
    }

    let first = trace();
    assert_eq!(first.len(), 3);
    assert_eq!(first, trace());
}

#[test]
fn goal_depth_limit_is_reported_not_exceeded() {
    let mut engine = Engine::new(EngineConfig {
        max_goal_depth: 2,
        ..Default::default()
    })
    .unwrap();
    engine.decide().unwrap();
    assert_eq!(engine.decide().unwrap(), DecisionOutcome::GoalDepthExceeded);
    assert_eq!(engine.goal_stack().len(), 2);
    assert!(engine.halted().is_none());
}

#[test]
fn fact_observers_see_adds_and_removes() {
    let mut engine = test_engine();
    let log = Arc::new(EventLog::new());
    engine.add_fact_observer(log.clone());
    let top = engine.top_goal();
    engine
        .elaborate(vec![WmEvent::assert_fact(top, "color", "red")])
        .unwrap();
    engine
        .elaborate(vec![WmEvent::retract_fact(top, "color", "red")])
        .unwrap();

    use wm_decider::observer::ObservedEvent;
    let events = log.events();
    assert!(matches!(&events[0], ObservedEvent::FactAdded(f) if f.value == Value::sym("red")));
    assert!(matches!(&events[1], ObservedEvent::FactRemoved(f) if f.value == Value::sym("red")));
    assert_eq!(events.len(), 2);
}
