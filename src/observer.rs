//! Passive subscribers to engine events.
//!
//! Storage subsystems watch fact churn, the learning subsystem watches
//! instantiation retractions, and tracing front ends watch decisions.
//! Observers are called after the engine has finished the mutation that
//! produced the event, never mid-flush.

use std::sync::Mutex;

use crate::decide::DecisionRecord;
use crate::store::{Fact, Instantiation};

// ── Observer traits ─────────────────────────────────────────────────────

/// Receives fact additions and removals.
pub trait FactObserver: Send + Sync {
    fn fact_added(&self, fact: &Fact);

    fn fact_removed(&self, fact: &Fact);
}

/// Receives retraction notices for instantiations.
pub trait RetractionListener: Send + Sync {
    fn instantiation_retracted(&self, inst: &Instantiation);
}

/// Receives one record per decision cycle.
pub trait DecisionObserver: Send + Sync {
    fn decision_made(&self, record: &DecisionRecord);
}

// ── DecisionPrinter ─────────────────────────────────────────────────────

/// Prints decisions to stdout, one line per cycle.
pub struct DecisionPrinter;

impl DecisionObserver for DecisionPrinter {
    fn decision_made(&self, record: &DecisionRecord) {
        println!("{record}");
    }
}

// ── EventLog ────────────────────────────────────────────────────────────

/// One event captured by an [`EventLog`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    FactAdded(Fact),
    FactRemoved(Fact),
    Retracted { rule: String },
    Decision(DecisionRecord),
}

/// Records every event it sees. Useful for testing and for hosts that
/// replay engine activity.
pub struct EventLog {
    events: Mutex<Vec<ObservedEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, event: ObservedEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded decisions, oldest first.
    pub fn decisions(&self) -> Vec<DecisionRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Decision(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FactObserver for EventLog {
    fn fact_added(&self, fact: &Fact) {
        self.push(ObservedEvent::FactAdded(fact.clone()));
    }

    fn fact_removed(&self, fact: &Fact) {
        self.push(ObservedEvent::FactRemoved(fact.clone()));
    }
}

impl RetractionListener for EventLog {
    fn instantiation_retracted(&self, inst: &Instantiation) {
        self.push(ObservedEvent::Retracted {
            rule: inst.rule.clone(),
        });
    }
}

impl DecisionObserver for EventLog {
    fn decision_made(&self, record: &DecisionRecord) {
        self.push(ObservedEvent::Decision(record.clone()));
    }
}
