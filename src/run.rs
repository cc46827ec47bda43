//! Run control: the outer INPUT → ELABORATION → DECISION → OUTPUT loop.
//!
//! The engine does not match rules itself. A [`MatchSource`] stands in for
//! the matching network: it supplies input events, then one batch of
//! elaboration events at a time until it has nothing more to fire.
//!
//! Stop requests are only honored between phases (or between elaboration
//! cycles), never inside a flush or a resolution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::decide::DecisionOutcome;
use crate::engine::Engine;
use crate::error::WmResult;
use crate::event::WmEvent;

/// Where the engine is in the decision cycle. Names the next phase to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Input,
    Elaboration,
    Decision,
    Output,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Input => "input",
            Phase::Elaboration => "elaboration",
            Phase::Decision => "decision",
            Phase::Output => "output",
        };
        write!(f, "{s}")
    }
}

/// How far a call to [`Engine::run`] should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLength {
    Elaborations(u64),
    Phases(u64),
    Decisions(u64),
    /// Until the output phase reports output.
    UntilOutput,
    Forever,
}

/// Cooperative stop flag, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    CountReached,
    StopRequested,
    /// The match source has nothing left to offer.
    Quiescent,
    GoalDepthExceeded,
    OutputProduced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub elaborations: u64,
    pub decisions: u64,
    pub phases: u64,
    pub reason: StopReason,
}

/// Supplies matcher events to [`Engine::run`].
pub trait MatchSource {
    /// Events for the input phase.
    fn input(&mut self, _engine: &mut Engine) -> WmResult<Vec<WmEvent>> {
        Ok(Vec::new())
    }

    /// One elaboration cycle's worth of events. Empty means quiescence.
    fn elaborate(&mut self, engine: &mut Engine) -> WmResult<Vec<WmEvent>>;

    /// Output phase. Returns true if the agent produced output.
    fn output(&mut self, _engine: &Engine) -> bool {
        false
    }

    /// True once the source will never produce another event.
    fn exhausted(&self) -> bool {
        false
    }
}

impl Engine {
    /// Drive the decision cycle with events from `source`.
    pub fn run(
        &mut self,
        source: &mut dyn MatchSource,
        length: RunLength,
        stop: &StopHandle,
    ) -> WmResult<RunReport> {
        self.ensure_running()?;
        let mut elaborations = 0u64;
        let mut decisions = 0u64;
        let mut phases = 0u64;
        tracing::debug!(?length, phase = %self.phase(), "run started");

        let reason = loop {
            if stop.is_requested() {
                break StopReason::StopRequested;
            }
            let mut stop_after: Option<StopReason> = None;
            match self.phase() {
                Phase::Input => {
                    if source.exhausted() {
                        break StopReason::Quiescent;
                    }
                    let events = source.input(self)?;
                    if !events.is_empty() {
                        self.apply_all(events)?;
                        self.end_elaboration()?;
                    }
                    self.set_phase(Phase::Elaboration);
                }
                Phase::Elaboration => {
                    // The limit is checked before pulling, so a batch the
                    // source has handed over is always applied.
                    if self.elaborations_this_cycle() >= self.config().max_elaborations {
                        tracing::warn!(
                            limit = self.config().max_elaborations,
                            "max elaborations reached, proceeding to decision"
                        );
                        self.set_phase(Phase::Decision);
                    } else {
                        let events = source.elaborate(self)?;
                        if events.is_empty() {
                            self.set_phase(Phase::Decision);
                        } else {
                            self.elaborate(events)?;
                            elaborations += 1;
                            if matches!(length, RunLength::Elaborations(n) if elaborations >= n) {
                                break StopReason::CountReached;
                            }
                            continue;
                        }
                    }
                }
                Phase::Decision => {
                    let outcome = self.decide()?;
                    decisions += 1;
                    if outcome == DecisionOutcome::GoalDepthExceeded {
                        stop_after = Some(StopReason::GoalDepthExceeded);
                    } else if matches!(length, RunLength::Decisions(n) if decisions >= n) {
                        stop_after = Some(StopReason::CountReached);
                    }
                }
                Phase::Output => {
                    let produced = source.output(self);
                    self.set_phase(Phase::Input);
                    if produced && length == RunLength::UntilOutput {
                        stop_after = Some(StopReason::OutputProduced);
                    }
                }
            }
            phases += 1;
            if let Some(reason) = stop_after {
                break reason;
            }
            if matches!(length, RunLength::Phases(n) if phases >= n) {
                break StopReason::CountReached;
            }
        };

        let report = RunReport {
            elaborations,
            decisions,
            phases,
            reason,
        };
        tracing::info!(
            decisions = report.decisions,
            elaborations = report.elaborations,
            reason = ?report.reason,
            "run stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::event::{InstantiationTag, PreferenceSpec};
    use crate::symbol::{InstantiationId, Value};

    /// Proposes one operator on the top goal during the first elaboration.
    struct ProposeOnce {
        fired: bool,
    }

    impl MatchSource for ProposeOnce {
        fn elaborate(&mut self, engine: &mut Engine) -> WmResult<Vec<WmEvent>> {
            if self.fired {
                return Ok(Vec::new());
            }
            self.fired = true;
            let top = engine.top_goal();
            let op = engine.new_object('O')?;
            Ok(vec![WmEvent::prefer(
                InstantiationTag::new(InstantiationId::new(1).unwrap(), "propose"),
                PreferenceSpec::acceptable(top, "operator", op),
            )])
        }
    }

    #[test]
    fn runs_requested_number_of_decisions() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let mut source = ProposeOnce { fired: false };
        let report = engine
            .run(&mut source, RunLength::Decisions(1), &StopHandle::new())
            .unwrap();
        assert_eq!(report.decisions, 1);
        assert_eq!(report.elaborations, 1);
        assert_eq!(report.reason, StopReason::CountReached);
        let top = engine.top_goal();
        assert!(engine.slot_value(top, &Value::sym("operator")).is_some());
    }

    #[test]
    fn stop_request_is_honored_at_boundary() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let stop = StopHandle::new();
        stop.request_stop();
        let report = engine
            .run(&mut ProposeOnce { fired: false }, RunLength::Forever, &stop)
            .unwrap();
        assert_eq!(report.reason, StopReason::StopRequested);
        assert_eq!(report.phases, 0);
        assert_eq!(engine.phase(), Phase::Input);
    }

    #[test]
    fn goal_depth_limit_ends_run() {
        let mut engine = Engine::new(EngineConfig {
            max_goal_depth: 3,
            ..Default::default()
        })
        .unwrap();
        struct Idle;
        impl MatchSource for Idle {
            fn elaborate(&mut self, _: &mut Engine) -> WmResult<Vec<WmEvent>> {
                Ok(Vec::new())
            }
        }
        let report = engine
            .run(&mut Idle, RunLength::Forever, &StopHandle::new())
            .unwrap();
        assert_eq!(report.reason, StopReason::GoalDepthExceeded);
        assert_eq!(engine.goal_stack().len(), 3);
    }

    #[test]
    fn phases_count_whole_phases() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let report = engine
            .run(&mut ProposeOnce { fired: false }, RunLength::Phases(2), &StopHandle::new())
            .unwrap();
        assert_eq!(report.phases, 2);
        assert_eq!(report.decisions, 0);
        assert_eq!(engine.phase(), Phase::Decision);
    }

    /// Yields one flag fact per elaboration, one batch at a time.
    struct Flags {
        values: Vec<&'static str>,
    }

    impl MatchSource for Flags {
        fn elaborate(&mut self, engine: &mut Engine) -> WmResult<Vec<WmEvent>> {
            if self.values.is_empty() {
                return Ok(Vec::new());
            }
            let value = self.values.remove(0);
            Ok(vec![WmEvent::assert_fact(engine.top_goal(), "flag", value)])
        }

        fn exhausted(&self) -> bool {
            self.values.is_empty()
        }
    }

    #[test]
    fn elaboration_limit_defers_the_next_batch() {
        let mut engine = Engine::new(EngineConfig {
            max_elaborations: 1,
            ..Default::default()
        })
        .unwrap();
        let mut source = Flags {
            values: vec!["v1", "v2"],
        };
        let report = engine
            .run(&mut source, RunLength::Decisions(3), &StopHandle::new())
            .unwrap();
        assert_eq!(report.elaborations, 2);
        let top = engine.top_goal();
        assert_eq!(
            engine.slot_values(top, &Value::sym("flag")),
            vec![Value::sym("v1"), Value::sym("v2")]
        );
    }
}
