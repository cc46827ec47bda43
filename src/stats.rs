//! Run counters and the read-only statistics snapshot.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::resolve::ImpasseKind;

/// Counters the engine bumps as it runs. Reset by reinitialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub decision_cycles: u64,
    pub elaboration_cycles: u64,
    pub facts_added: u64,
    pub facts_removed: u64,
    pub goals_created: u64,
    pub goals_removed: u64,
    /// Goals removed because a dependency-set premise changed.
    pub goals_removed_by_gds: u64,
    pub objects_collected: u64,
    pub flushes: u64,
    /// Committed values retracted by the consistency check.
    pub consistency_retractions: u64,
    pub impasses: BTreeMap<ImpasseKind, u64>,
}

impl Counters {
    pub fn record_impasse(&mut self, kind: ImpasseKind) {
        *self.impasses.entry(kind).or_insert(0) += 1;
    }

    pub fn impasses_of(&self, kind: ImpasseKind) -> u64 {
        self.impasses.get(&kind).copied().unwrap_or(0)
    }
}

/// Point-in-time statistics: counters plus live sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    #[serde(flatten)]
    pub counters: Counters,
    pub preferences_added: u64,
    pub preferences_removed: u64,
    pub gds_created: u64,
    pub gds_deleted: u64,
    pub live_facts: usize,
    pub live_preferences: usize,
    pub live_slots: usize,
    pub live_objects: usize,
    pub live_instantiations: usize,
    pub live_gds: usize,
    pub goal_depth: usize,
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = &self.counters;
        writeln!(f, "engine statistics")?;
        writeln!(f, "  decisions:        {}", c.decision_cycles)?;
        writeln!(f, "  elaborations:     {}", c.elaboration_cycles)?;
        writeln!(
            f,
            "  facts:            {} live ({} added, {} removed)",
            self.live_facts, c.facts_added, c.facts_removed
        )?;
        writeln!(
            f,
            "  preferences:      {} live ({} added, {} removed)",
            self.live_preferences, self.preferences_added, self.preferences_removed
        )?;
        writeln!(f, "  slots:            {}", self.live_slots)?;
        writeln!(
            f,
            "  objects:          {} live ({} collected)",
            self.live_objects, c.objects_collected
        )?;
        writeln!(f, "  goal depth:       {}", self.goal_depth)?;
        writeln!(
            f,
            "  goals:            {} created, {} removed ({} by dependency sets)",
            c.goals_created, c.goals_removed, c.goals_removed_by_gds
        )?;
        writeln!(
            f,
            "  dependency sets:  {} live ({} created, {} deleted)",
            self.live_gds, self.gds_created, self.gds_deleted
        )?;
        for kind in [
            ImpasseKind::Tie,
            ImpasseKind::Conflict,
            ImpasseKind::ConstraintFailure,
            ImpasseKind::NoChange,
        ] {
            writeln!(f, "  {:<18}{}", format!("{kind}:"), c.impasses_of(kind))?;
        }
        writeln!(f, "  retractions:      {} by consistency check", c.consistency_retractions)?;
        Ok(())
    }
}
