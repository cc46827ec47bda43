// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # wm-decider
//!
//! Working-memory consistency and decision engine for a production-rule
//! cognitive architecture.
//!
//! ## Architecture
//!
//! - **Store** (`store`): objects, slots, facts, preferences and instantiations
//! - **Resolution** (`resolve`): turns a slot's preferences into a winner or an impasse
//! - **Ownership** (`ownership`): link counts, goal depth and reachability collection
//! - **Dependency sets** (`gds`): invalidates subgoals when their premises change
//! - **Decision cycle** (`decide`, `run`): the goal stack and the phase state machine
//!
//! The engine does not match rules. A matcher (or a [`script::ScriptRunner`])
//! feeds it [`event::WmEvent`]s and the engine keeps working memory consistent.
//!
//! ## Library usage
//!
//! ```no_run
//! use wm_decider::engine::{Engine, EngineConfig};
//! use wm_decider::event::{InstantiationTag, PreferenceSpec, WmEvent};
//! use wm_decider::symbol::{InstantiationId, Value};
//!
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! let top = engine.top_goal();
//! let op = engine.new_object('O').unwrap();
//! let tag = InstantiationTag::new(InstantiationId::new(1).unwrap(), "propose");
//! engine
//!     .elaborate(vec![WmEvent::prefer(tag, PreferenceSpec::acceptable(top, "operator", op))])
//!     .unwrap();
//! engine.decide().unwrap();
//! assert_eq!(engine.slot_value(top, &Value::sym("operator")), Some(Value::Object(op)));
//! ```

pub mod config;
pub mod decide;
pub mod engine;
pub mod error;
pub mod event;
pub mod gds;
pub mod observer;
pub mod ownership;
pub mod preference;
pub mod resolve;
pub mod run;
pub mod script;
pub mod stats;
pub mod store;
pub mod symbol;

pub use engine::{Engine, EngineConfig};
pub use error::{WmError, WmResult};
pub use event::WmEvent;
