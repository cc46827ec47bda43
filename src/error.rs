//! Rich diagnostic error types for the decision engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Impasses are not errors: they are
//! ordinary decision outcomes and never appear here.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the host.
#[derive(Debug, Error, Diagnostic)]
pub enum WmError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gds(#[from] GdsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Script(#[from] ScriptError),
}

impl WmError {
    /// True for errors that leave the engine's bookkeeping in an unknown state.
    ///
    /// Contract violations and resource exhaustion are fatal for the run;
    /// configuration and script errors are not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WmError::Store(_) | WmError::Gds(_) | WmError::Resource(_))
    }
}

// ---------------------------------------------------------------------------
// Store errors (contract violations)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("unknown object {object}")]
    #[diagnostic(
        code(wm::store::unknown_object),
        help(
            "The object was never created or has already been collected. \
             The caller is holding a stale reference."
        )
    )]
    UnknownObject { object: u64 },

    #[error("unknown slot {slot}")]
    #[diagnostic(
        code(wm::store::unknown_slot),
        help("The slot's object has been collected. The caller is holding a stale reference.")
    )]
    UnknownSlot { slot: u64 },

    #[error("unknown preference {preference}")]
    #[diagnostic(
        code(wm::store::unknown_preference),
        help("The preference was already removed. Check the retraction event stream.")
    )]
    UnknownPreference { preference: u64 },

    #[error("fact t{fact} is not present in slot {slot}")]
    #[diagnostic(
        code(wm::store::fact_not_in_slot),
        help(
            "Removing a fact that is not in the slot indicates inconsistent \
             bookkeeping upstream. Check the retraction event stream."
        )
    )]
    FactNotInSlot { fact: u64, slot: u64 },

    #[error("no fact ({object} ^{attr} {value}) to retract")]
    #[diagnostic(
        code(wm::store::fact_not_found),
        help("Only facts that were asserted directly can be retracted directly.")
    )]
    FactNotFound {
        object: u64,
        attr: String,
        value: String,
    },

    #[error("preference {preference} is not present in slot {slot}")]
    #[diagnostic(
        code(wm::store::preference_not_in_slot),
        help(
            "Removing a preference that is not in the slot indicates inconsistent \
             bookkeeping upstream. Check the retraction event stream."
        )
    )]
    PreferenceNotInSlot { preference: u64, slot: u64 },

    #[error("instantiation {instantiation} has no matching preference to retract")]
    #[diagnostic(
        code(wm::store::preference_not_found),
        help("The retracted preference must match one the instantiation asserted.")
    )]
    PreferenceNotFound { instantiation: u64 },

    #[error("unknown instantiation {instantiation}")]
    #[diagnostic(
        code(wm::store::unknown_instantiation),
        help("The instantiation never asserted anything, or it has already been retracted.")
    )]
    UnknownInstantiation { instantiation: u64 },

    #[error("binary preference {kind} requires a referent value")]
    #[diagnostic(
        code(wm::store::missing_referent),
        help("Better, worse and binary indifferent preferences compare two values.")
    )]
    MissingReferent { kind: String },
}

// ---------------------------------------------------------------------------
// Goal dependency set errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GdsError {
    #[error("goal {goal} already has a dependency set")]
    #[diagnostic(
        code(wm::gds::already_exists),
        help("A goal owns at most one dependency set. Extend the existing one instead.")
    )]
    AlreadyExists { goal: u64 },

    #[error("object {object} is not a goal on the goal stack")]
    #[diagnostic(
        code(wm::gds::not_a_goal),
        help("Dependency sets can only be attached to live goals.")
    )]
    NotAGoal { object: u64 },
}

// ---------------------------------------------------------------------------
// Resource errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ResourceError {
    #[error("identifier allocator exhausted")]
    #[diagnostic(
        code(wm::resource::exhausted),
        help("The identifier space is exhausted. Reinitialize the engine.")
    )]
    AllocatorExhausted,

    #[error("{resource} pool exhausted: limit is {limit}")]
    #[diagnostic(
        code(wm::resource::capacity),
        help(
            "The run cannot continue without dropping consistency guarantees. \
             Raise the corresponding `max_*` limit in the engine configuration."
        )
    )]
    CapacityExceeded { resource: String, limit: usize },
}

// ---------------------------------------------------------------------------
// Configuration errors (recoverable)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("unknown parameter \"{name}\"")]
    #[diagnostic(
        code(wm::config::unknown),
        help(
            "Known parameters: max_elaborations, max_goal_depth, consistency_check, \
             track_acceptable_facts, operator_attribute, max_slots, max_preferences, max_facts."
        )
    )]
    UnknownParameter { name: String },

    #[error("invalid value \"{value}\" for parameter \"{name}\": {message}")]
    #[diagnostic(
        code(wm::config::invalid_value),
        help("The previous value has been kept.")
    )]
    InvalidValue {
        name: String,
        value: String,
        message: String,
    },

    #[error("parameter \"{name}\" is protected while storage is connected")]
    #[diagnostic(
        code(wm::config::protected),
        help("Disconnect storage observers before changing this parameter. The previous value has been kept.")
    )]
    Protected { name: String },

    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(wm::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(wm::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(wm::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Run errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error("engine halted: {reason}")]
    #[diagnostic(
        code(wm::run::halted),
        help("A fatal error stopped the run. Call `reinitialize()` to start over.")
    )]
    Halted { reason: String },
}

// ---------------------------------------------------------------------------
// Script errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ScriptError {
    #[error("failed to read script: {path}")]
    #[diagnostic(code(wm::script::read), help("Ensure the script file exists."))]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse script: {message}")]
    #[diagnostic(
        code(wm::script::parse),
        help("Scripts are JSON: {{\"cycles\": [[[event, ...], ...], ...]}}.")
    )]
    Parse { message: String },

    #[error("unknown preference kind \"{kind}\"")]
    #[diagnostic(
        code(wm::script::preference_kind),
        help(
            "Use one of: acceptable, require, reject, prohibit, best, worst, \
             better, worse, indifferent, binary_indifferent."
        )
    )]
    UnknownPreferenceKind { kind: String },

    #[error("condition ({object} ^{attr} {value}) does not match any fact")]
    #[diagnostic(
        code(wm::script::condition),
        help("Conditions must name facts present in working memory when the rule fires.")
    )]
    UnknownCondition {
        object: String,
        attr: String,
        value: String,
    },
}

/// Convenience alias for functions returning engine results.
pub type WmResult<T> = std::result::Result<T, WmError>;
