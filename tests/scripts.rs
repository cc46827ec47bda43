//! Scripted runs: JSON event scripts loaded from disk and driven through
//! `Engine::run`.

use std::io::Write;
use std::sync::Arc;

use wm_decider::engine::{Engine, EngineConfig};
use wm_decider::error::{ScriptError, WmError};
use wm_decider::observer::EventLog;
use wm_decider::run::{RunLength, StopHandle, StopReason};
use wm_decider::script::{Script, ScriptRunner};
use wm_decider::symbol::Value;

const TIE_THEN_BEST: &str = r#"{
  "cycles": [
    [
      [
        { "op": "assert", "id": "@S1", "attr": "name", "value": "blocks" },
        { "op": "prefer", "rule": "propose-a", "id": "@S1", "attr": "operator", "value": "@A" },
        { "op": "prefer", "rule": "propose-b", "id": "@S1", "attr": "operator", "value": "@B" }
      ]
    ],
    [
      [
        { "op": "prefer", "rule": "prefer-a", "id": "@S1", "attr": "operator", "value": "@A",
          "kind": "best", "conditions": [ { "id": "@S1", "attr": "name", "value": "blocks" } ] }
      ]
    ]
  ]
}"#;

fn write_script(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn script_from_disk_runs_to_quiescence() {
    let file = write_script(TIE_THEN_BEST);
    let script = Script::load(file.path()).unwrap();
    assert_eq!(script.decision_cycles(), 2);

    let mut engine = Engine::new(EngineConfig::default()).unwrap();
    let log = Arc::new(EventLog::new());
    engine.add_decision_observer(log.clone());
    let mut runner = ScriptRunner::new(script);
    let report = engine
        .run(&mut runner, RunLength::Forever, &StopHandle::new())
        .unwrap();

    assert_eq!(report.reason, StopReason::Quiescent);
    assert_eq!(report.decisions, 2);
    assert_eq!(report.elaborations, 2);

    let top = engine.top_goal();
    let a = engine.object_by_name("A").unwrap();
    assert_eq!(
        engine.slot_value(top, &Value::sym("operator")),
        Some(Value::Object(a))
    );
    assert_eq!(engine.goal_stack(), vec![top]);

    let lines: Vec<String> = log.decisions().iter().map(|d| d.to_string()).collect();
    assert_eq!(lines, vec!["    1: ==>S: S2 (operator tie)", "    2: O: A (S1)"]);
}

#[test]
fn decision_budget_stops_a_script_early() {
    let file = write_script(TIE_THEN_BEST);
    let mut engine = Engine::new(EngineConfig::default()).unwrap();
    let mut runner = ScriptRunner::new(Script::load(file.path()).unwrap());
    let report = engine
        .run(&mut runner, RunLength::Decisions(1), &StopHandle::new())
        .unwrap();
    assert_eq!(report.reason, StopReason::CountReached);
    assert_eq!(engine.goal_stack().len(), 2);

    // Picking up where it stopped finishes the script.
    let report = engine
        .run(&mut runner, RunLength::Forever, &StopHandle::new())
        .unwrap();
    assert_eq!(report.decisions, 1);
    assert_eq!(engine.goal_stack().len(), 1);
}

#[test]
fn retracting_a_rule_withdraws_its_preferences() {
    let script = Script::parse(
        r#"{"cycles": [
            [[ {"op": "prefer", "rule": "mark", "id": "@S1", "attr": "flag", "value": "on"},
               {"op": "prefer", "rule": "mark", "id": "@S1", "attr": "size", "value": 3} ]],
            [[ {"op": "unprefer", "rule": "mark", "id": "@S1", "attr": "size", "value": 3} ]],
            [[ {"op": "retract_rule", "rule": "mark"} ]]
        ]}"#,
    )
    .unwrap();
    let mut engine = Engine::new(EngineConfig::default()).unwrap();
    let mut runner = ScriptRunner::new(script);
    let top = engine.top_goal();

    engine
        .run(&mut runner, RunLength::Decisions(1), &StopHandle::new())
        .unwrap();
    assert_eq!(engine.slot_value(top, &Value::sym("flag")), Some(Value::sym("on")));
    assert_eq!(engine.slot_value(top, &Value::sym("size")), Some(Value::Int(3)));
    assert!(runner.instantiation_of("mark").is_some());

    engine
        .run(&mut runner, RunLength::Decisions(1), &StopHandle::new())
        .unwrap();
    assert!(engine.slot_value(top, &Value::sym("size")).is_none());
    assert!(engine.slot_value(top, &Value::sym("flag")).is_some());

    engine
        .run(&mut runner, RunLength::Decisions(1), &StopHandle::new())
        .unwrap();
    assert!(engine.slot_value(top, &Value::sym("flag")).is_none());
    assert!(runner.instantiation_of("mark").is_none());
}

#[test]
fn unmatched_condition_is_reported_without_halting() {
    let script = Script::parse(
        r#"{"cycles": [[[
            {"op": "prefer", "rule": "r", "id": "@S1", "attr": "x", "value": 1,
             "conditions": [{"id": "@S1", "attr": "missing", "value": "fact"}]}
        ]]]}"#,
    )
    .unwrap();
    let mut engine = Engine::new(EngineConfig::default()).unwrap();
    let err = engine
        .run(&mut ScriptRunner::new(script), RunLength::Forever, &StopHandle::new())
        .unwrap_err();
    assert!(matches!(
        err,
        WmError::Script(ScriptError::UnknownCondition { .. })
    ));
    assert!(!err.is_fatal());
    assert!(engine.halted().is_none());
}

#[test]
fn missing_script_file_is_a_read_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let err = Script::load(&dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ScriptError::Read { .. }));
}
