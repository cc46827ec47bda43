//! Engine configuration.
//!
//! Loaded from and saved to TOML. Individual parameters can also be read and
//! set by name at runtime, which is how a command layer drives the engine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::Limits;

/// Parameters that cannot change while a storage subscriber is connected:
/// they alter which facts exist, and the subscriber would silently diverge.
pub const PROTECTED_PARAMS: [&str; 2] = ["track_acceptable_facts", "operator_attribute"];

/// Every parameter name [`EngineConfig::set`] accepts.
pub const PARAM_NAMES: [&str; 8] = [
    "max_elaborations",
    "max_goal_depth",
    "consistency_check",
    "track_acceptable_facts",
    "operator_attribute",
    "max_slots",
    "max_preferences",
    "max_facts",
];

/// Configuration for the decision engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Elaboration cycles allowed per decision cycle before the run forces
    /// the decision phase (default: 100).
    pub max_elaborations: u32,
    /// Deepest goal level the engine will create (default: 100).
    pub max_goal_depth: u32,
    /// Re-check committed values at the end of every elaboration cycle and
    /// retract the ones no longer justified.
    pub consistency_check: bool,
    /// Maintain acceptable-preference facts for context slots.
    pub track_acceptable_facts: bool,
    /// Attribute naming a goal's decision slot. Takes effect for goals
    /// created after the change.
    pub operator_attribute: String,
    pub max_slots: usize,
    pub max_preferences: usize,
    pub max_facts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_elaborations: 100,
            max_goal_depth: 100,
            consistency_check: true,
            track_acceptable_facts: true,
            operator_attribute: "operator".into(),
            max_slots: 1_000_000,
            max_preferences: 1_000_000,
            max_facts: 1_000_000,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_elaborations", self.max_elaborations as usize),
            ("max_goal_depth", self.max_goal_depth as usize),
            ("max_slots", self.max_slots),
            ("max_preferences", self.max_preferences),
            ("max_facts", self.max_facts),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(invalid(name, "0", "must be at least 1"));
            }
        }
        if self.operator_attribute.trim().is_empty() {
            return Err(invalid("operator_attribute", "", "must not be empty"));
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_slots: self.max_slots,
            max_preferences: self.max_preferences,
            max_facts: self.max_facts,
        }
    }

    /// Current value of a parameter, rendered as text.
    pub fn get(&self, name: &str) -> Result<String, ConfigError> {
        Ok(match name {
            "max_elaborations" => self.max_elaborations.to_string(),
            "max_goal_depth" => self.max_goal_depth.to_string(),
            "consistency_check" => self.consistency_check.to_string(),
            "track_acceptable_facts" => self.track_acceptable_facts.to_string(),
            "operator_attribute" => self.operator_attribute.clone(),
            "max_slots" => self.max_slots.to_string(),
            "max_preferences" => self.max_preferences.to_string(),
            "max_facts" => self.max_facts.to_string(),
            _ => {
                return Err(ConfigError::UnknownParameter {
                    name: name.to_string(),
                });
            }
        })
    }

    /// Set a parameter from text. On error the configuration is unchanged.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        match name {
            "max_elaborations" => next.max_elaborations = parse(name, value)?,
            "max_goal_depth" => next.max_goal_depth = parse(name, value)?,
            "consistency_check" => next.consistency_check = parse_flag(name, value)?,
            "track_acceptable_facts" => next.track_acceptable_facts = parse_flag(name, value)?,
            "operator_attribute" => next.operator_attribute = value.trim().to_string(),
            "max_slots" => next.max_slots = parse(name, value)?,
            "max_preferences" => next.max_preferences = parse(name, value)?,
            "max_facts" => next.max_facts = parse(name, value)?,
            _ => {
                return Err(ConfigError::UnknownParameter {
                    name: name.to_string(),
                });
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for name in PARAM_NAMES {
            let value = self.get(name).map_err(|_| std::fmt::Error)?;
            writeln!(f, "  {name:<24}{value}")?;
        }
        Ok(())
    }
}

fn invalid(name: &str, value: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        message: message.to_string(),
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(name, value, &e.to_string()))
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(invalid(name, value, "expected on or off")),
    }
}
