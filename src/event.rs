//! Events consumed from the pattern-matching network.
//!
//! The matcher emits an ordered stream of events per elaboration cycle. Every
//! preference event carries the producing instantiation and its matched
//! condition trace, which the engine keeps for dependency-set construction
//! and exposes to the learning subsystem.

use serde::{Deserialize, Serialize};

use crate::preference::{PreferenceType, Support};
use crate::symbol::{FactId, InstantiationId, ObjectId, Value};

/// Identity and provenance of one rule firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantiationTag {
    pub id: InstantiationId,
    /// Name of the rule that fired.
    pub rule: String,
    /// Facts matched by the rule's conditions, in condition order.
    pub conditions: Vec<FactId>,
    #[serde(default)]
    pub support: Support,
}

impl InstantiationTag {
    pub fn new(id: InstantiationId, rule: impl Into<String>) -> Self {
        Self {
            id,
            rule: rule.into(),
            conditions: Vec::new(),
            support: Support::Transient,
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<FactId>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn durable(mut self) -> Self {
        self.support = Support::Durable;
        self
    }
}

/// Content of a preference, independent of its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceSpec {
    pub object: ObjectId,
    pub attr: Value,
    pub value: Value,
    pub kind: PreferenceType,
    #[serde(default)]
    pub referent: Option<Value>,
}

impl PreferenceSpec {
    pub fn new(
        kind: PreferenceType,
        object: ObjectId,
        attr: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            object,
            attr: attr.into(),
            value: value.into(),
            kind,
            referent: None,
        }
    }

    pub fn acceptable(object: ObjectId, attr: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self::new(PreferenceType::Acceptable, object, attr, value)
    }

    /// Set the compared value of a binary preference.
    pub fn with_referent(mut self, referent: impl Into<Value>) -> Self {
        self.referent = Some(referent.into());
        self
    }
}

/// One working-memory event from the matcher or the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WmEvent {
    /// Assert a fact with permanent support (input or architecture).
    AssertFact {
        object: ObjectId,
        attr: Value,
        value: Value,
    },
    /// Retract a fact previously asserted with [`WmEvent::AssertFact`].
    RetractFact {
        object: ObjectId,
        attr: Value,
        value: Value,
    },
    /// A rule firing asserts a preference.
    AssertPreference {
        instantiation: InstantiationTag,
        preference: PreferenceSpec,
    },
    /// A rule firing withdraws one of its preferences.
    RetractPreference {
        instantiation: InstantiationId,
        preference: PreferenceSpec,
    },
    /// A rule firing no longer matches; its transient preferences go away.
    RetractInstantiation { instantiation: InstantiationId },
}

impl WmEvent {
    pub fn assert_fact(object: ObjectId, attr: impl Into<Value>, value: impl Into<Value>) -> Self {
        WmEvent::AssertFact {
            object,
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn retract_fact(object: ObjectId, attr: impl Into<Value>, value: impl Into<Value>) -> Self {
        WmEvent::RetractFact {
            object,
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn prefer(instantiation: InstantiationTag, preference: PreferenceSpec) -> Self {
        WmEvent::AssertPreference {
            instantiation,
            preference,
        }
    }
}
