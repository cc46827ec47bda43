//! Scripted matcher: replays canned event batches through [`Engine::run`].
//!
//! A script is JSON. Each entry of `cycles` is one decision cycle, given as a
//! list of elaboration batches:
//!
//! ```json
//! {
//!   "cycles": [
//!     [
//!       [ { "op": "prefer", "rule": "propose-a", "id": "@S1", "attr": "operator", "value": "@A" },
//!         { "op": "prefer", "rule": "propose-b", "id": "@S1", "attr": "operator", "value": "@B" } ]
//!     ],
//!     [
//!       [ { "op": "prefer", "rule": "prefer-a", "id": "@S1", "attr": "operator",
//!           "value": "@A", "kind": "best" } ]
//!     ]
//!   ]
//! }
//! ```
//!
//! Strings starting with `@` name objects (created on first mention), other
//! strings are symbols and integers stay integers. A rule name stands for one
//! live instantiation until `retract_rule` withdraws it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{ScriptError, WmResult};
use crate::event::{InstantiationTag, PreferenceSpec, WmEvent};
use crate::preference::{PreferenceType, Support};
use crate::run::MatchSource;
use crate::symbol::{FactId, InstantiationId, ObjectId, Value};

/// A value as written in a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptValue {
    Int(i64),
    Text(String),
}

/// A condition a rule matched, identified by content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptCondition {
    pub id: String,
    pub attr: ScriptValue,
    pub value: ScriptValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptEvent {
    Assert {
        id: String,
        attr: ScriptValue,
        value: ScriptValue,
    },
    Retract {
        id: String,
        attr: ScriptValue,
        value: ScriptValue,
    },
    Prefer {
        rule: String,
        id: String,
        attr: ScriptValue,
        value: ScriptValue,
        #[serde(default = "default_kind")]
        kind: String,
        #[serde(default)]
        referent: Option<ScriptValue>,
        #[serde(default)]
        durable: bool,
        #[serde(default)]
        conditions: Vec<ScriptCondition>,
    },
    Unprefer {
        rule: String,
        id: String,
        attr: ScriptValue,
        value: ScriptValue,
        #[serde(default = "default_kind")]
        kind: String,
        #[serde(default)]
        referent: Option<ScriptValue>,
    },
    RetractRule {
        rule: String,
    },
}

fn default_kind() -> String {
    "acceptable".into()
}

/// A parsed script: decision cycles of elaboration batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub cycles: Vec<Vec<Vec<ScriptEvent>>>,
}

impl Script {
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        serde_json::from_str(text).map_err(|e| ScriptError::Parse {
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|e| ScriptError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&text)
    }

    pub fn decision_cycles(&self) -> usize {
        self.cycles.len()
    }
}

/// Feeds a [`Script`] to the engine, one batch per elaboration cycle.
#[derive(Debug)]
pub struct ScriptRunner {
    script: Script,
    cycle: usize,
    batch: usize,
    rules: HashMap<String, InstantiationId>,
    next_instantiation: u64,
}

impl ScriptRunner {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            cycle: 0,
            batch: 0,
            rules: HashMap::new(),
            next_instantiation: 1,
        }
    }

    /// Live instantiation currently standing for `rule`.
    pub fn instantiation_of(&self, rule: &str) -> Option<InstantiationId> {
        self.rules.get(rule).copied()
    }

    fn object(engine: &mut Engine, name: &str) -> WmResult<ObjectId> {
        engine.object_named(name.trim_start_matches('@'))
    }

    fn value(engine: &mut Engine, v: &ScriptValue) -> WmResult<Value> {
        Ok(match v {
            ScriptValue::Int(n) => Value::Int(*n),
            ScriptValue::Text(s) if s.starts_with('@') => Value::Object(Self::object(engine, s)?),
            ScriptValue::Text(s) => Value::sym(s.as_str()),
        })
    }

    fn kind(name: &str) -> Result<PreferenceType, ScriptError> {
        PreferenceType::from_name(name).ok_or_else(|| ScriptError::UnknownPreferenceKind {
            kind: name.to_string(),
        })
    }

    fn condition(engine: &mut Engine, cond: &ScriptCondition) -> WmResult<FactId> {
        let object = Self::object(engine, &cond.id)?;
        let attr = Self::value(engine, &cond.attr)?;
        let value = Self::value(engine, &cond.value)?;
        engine
            .find_fact(object, &attr, &value)
            .map(|f| f.id)
            .ok_or_else(|| {
                ScriptError::UnknownCondition {
                    object: cond.id.clone(),
                    attr: attr.to_string(),
                    value: engine.render(&value),
                }
                .into()
            })
    }

    fn spec(
        engine: &mut Engine,
        kind: &str,
        id: &str,
        attr: &ScriptValue,
        value: &ScriptValue,
        referent: Option<&ScriptValue>,
    ) -> WmResult<PreferenceSpec> {
        let kind = match Self::kind(kind)? {
            PreferenceType::UnaryIndifferent if referent.is_some() => {
                PreferenceType::BinaryIndifferent
            }
            other => other,
        };
        let object = Self::object(engine, id)?;
        let attr = Self::value(engine, attr)?;
        let value = Self::value(engine, value)?;
        let mut spec = PreferenceSpec::new(kind, object, attr, value);
        if let Some(r) = referent {
            spec = spec.with_referent(Self::value(engine, r)?);
        }
        Ok(spec)
    }

    fn translate(&mut self, engine: &mut Engine, event: &ScriptEvent) -> WmResult<WmEvent> {
        Ok(match event {
            ScriptEvent::Assert { id, attr, value } => WmEvent::AssertFact {
                object: Self::object(engine, id)?,
                attr: Self::value(engine, attr)?,
                value: Self::value(engine, value)?,
            },
            ScriptEvent::Retract { id, attr, value } => WmEvent::RetractFact {
                object: Self::object(engine, id)?,
                attr: Self::value(engine, attr)?,
                value: Self::value(engine, value)?,
            },
            ScriptEvent::Prefer {
                rule,
                id,
                attr,
                value,
                kind,
                referent,
                durable,
                conditions,
            } => {
                let preference = Self::spec(engine, kind, id, attr, value, referent.as_ref())?;
                let conditions = conditions
                    .iter()
                    .map(|c| Self::condition(engine, c))
                    .collect::<WmResult<Vec<_>>>()?;
                let inst = self.instantiation_for(rule)?;
                let mut tag = InstantiationTag::new(inst, rule.clone()).with_conditions(conditions);
                if *durable {
                    tag.support = Support::Durable;
                }
                WmEvent::AssertPreference {
                    instantiation: tag,
                    preference,
                }
            }
            ScriptEvent::Unprefer {
                rule,
                id,
                attr,
                value,
                kind,
                referent,
            } => {
                let preference = Self::spec(engine, kind, id, attr, value, referent.as_ref())?;
                let inst = self.instantiation_for(rule)?;
                WmEvent::RetractPreference {
                    instantiation: inst,
                    preference,
                }
            }
            ScriptEvent::RetractRule { rule } => {
                let inst = self.instantiation_for(rule)?;
                self.rules.remove(rule);
                WmEvent::RetractInstantiation { instantiation: inst }
            }
        })
    }

    fn instantiation_for(&mut self, rule: &str) -> WmResult<InstantiationId> {
        if let Some(id) = self.rules.get(rule) {
            return Ok(*id);
        }
        let id = InstantiationId::new(self.next_instantiation).ok_or(
            crate::error::ResourceError::AllocatorExhausted,
        )?;
        self.next_instantiation += 1;
        self.rules.insert(rule.to_string(), id);
        Ok(id)
    }
}

impl MatchSource for ScriptRunner {
    fn elaborate(&mut self, engine: &mut Engine) -> WmResult<Vec<WmEvent>> {
        let Some(batches) = self.script.cycles.get(self.cycle) else {
            return Ok(Vec::new());
        };
        let Some(batch) = batches.get(self.batch).cloned() else {
            self.cycle += 1;
            self.batch = 0;
            return Ok(Vec::new());
        };
        self.batch += 1;
        let mut events = Vec::with_capacity(batch.len());
        for event in &batch {
            events.push(self.translate(engine, event)?);
        }
        tracing::trace!(
            cycle = self.cycle,
            batch = self.batch,
            events = events.len(),
            "script batch"
        );
        Ok(events)
    }

    fn exhausted(&self) -> bool {
        self.cycle >= self.script.cycles.len()
    }
}
