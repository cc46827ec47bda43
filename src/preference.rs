//! Preferences: typed votes proposing or vetoing a value for a slot.
//!
//! Preference classes form a closed set ([`PreferenceType`]); resolution
//! matches on it exhaustively, so adding a class forces every consumer to
//! decide what it means.

use serde::{Deserialize, Serialize};

use crate::symbol::{InstantiationId, ObjectId, PreferenceId, SlotId, Value};

/// The class of a preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceType {
    /// `+`: the value is a candidate.
    Acceptable,
    /// `!`: the value must be selected.
    Require,
    /// `-`: the value is not a candidate.
    Reject,
    /// `~`: the value must not be selected.
    Prohibit,
    /// `>` (unary): promote above unranked candidates.
    Best,
    /// `<` (unary): demote below unranked candidates.
    Worst,
    /// `>` (binary): the value is better than the referent.
    Better,
    /// `<` (binary): the value is worse than the referent.
    Worse,
    /// `=` (unary): indifferent to every other candidate.
    UnaryIndifferent,
    /// `=` (binary): indifferent to the referent.
    BinaryIndifferent,
}

impl PreferenceType {
    /// Every preference class, in slot bucket order.
    pub const ALL: [PreferenceType; 10] = [
        PreferenceType::Acceptable,
        PreferenceType::Require,
        PreferenceType::Reject,
        PreferenceType::Prohibit,
        PreferenceType::Best,
        PreferenceType::Worst,
        PreferenceType::Better,
        PreferenceType::Worse,
        PreferenceType::UnaryIndifferent,
        PreferenceType::BinaryIndifferent,
    ];

    /// Binary preferences compare the value against a referent.
    pub fn is_binary(self) -> bool {
        match self {
            PreferenceType::Better | PreferenceType::Worse | PreferenceType::BinaryIndifferent => {
                true
            }
            PreferenceType::Acceptable
            | PreferenceType::Require
            | PreferenceType::Reject
            | PreferenceType::Prohibit
            | PreferenceType::Best
            | PreferenceType::Worst
            | PreferenceType::UnaryIndifferent => false,
        }
    }

    /// Changes to these classes can change the candidate set of a context
    /// slot and so trigger re-decision mid-phase.
    pub fn affects_candidacy(self) -> bool {
        matches!(self, PreferenceType::Acceptable | PreferenceType::Require)
    }

    /// Index into a slot's per-type buckets.
    pub fn bucket(self) -> usize {
        self as usize
    }

    /// Parse the textual name used in scripts and traces.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "acceptable" | "+" => PreferenceType::Acceptable,
            "require" | "!" => PreferenceType::Require,
            "reject" | "-" => PreferenceType::Reject,
            "prohibit" | "~" => PreferenceType::Prohibit,
            "best" => PreferenceType::Best,
            "worst" => PreferenceType::Worst,
            "better" | ">" => PreferenceType::Better,
            "worse" | "<" => PreferenceType::Worse,
            "indifferent" | "unary_indifferent" => PreferenceType::UnaryIndifferent,
            "binary_indifferent" | "=" => PreferenceType::BinaryIndifferent,
            _ => return None,
        })
    }
}

impl std::fmt::Display for PreferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PreferenceType::Acceptable => "acceptable",
            PreferenceType::Require => "require",
            PreferenceType::Reject => "reject",
            PreferenceType::Prohibit => "prohibit",
            PreferenceType::Best => "best",
            PreferenceType::Worst => "worst",
            PreferenceType::Better => "better",
            PreferenceType::Worse => "worse",
            PreferenceType::UnaryIndifferent => "indifferent",
            PreferenceType::BinaryIndifferent => "binary-indifferent",
        };
        write!(f, "{s}")
    }
}

/// How long a preference outlives the instantiation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Support {
    /// Removed as soon as the producing instantiation retracts.
    #[default]
    Transient,
    /// Survives retraction; removed only by a durable reject or by collection.
    Durable,
}

/// A live preference held by a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    /// Identity and creation order.
    pub id: PreferenceId,
    pub kind: PreferenceType,
    pub object: ObjectId,
    pub attr: Value,
    pub value: Value,
    /// The compared value, for binary preferences.
    pub referent: Option<Value>,
    /// The slot holding this preference.
    pub slot: SlotId,
    /// Goal-stack level at which the producing instantiation matched.
    pub level: u32,
    pub support: Support,
    /// The producing instantiation.
    pub instantiation: InstantiationId,
}

impl Preference {
    /// Ordering key within a per-type list: shallowest support first, then
    /// creation order.
    pub fn order_key(&self) -> (u32, PreferenceId) {
        (self.level, self.id)
    }
}
