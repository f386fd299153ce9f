//! Fault-injection scenarios for the simulated cluster.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// FC-001: free-running primary, secondaries converge on its world
    FreeRun,

    /// FC-002: lock-step clock only advances on tick-cues
    LockStep,

    /// FC-003: many secondaries, heavy traffic, every one keeps up
    FanOut,

    /// FC-004: end and restart the episode mid-run
    EpisodeReset,

    /// FC-005: one secondary partitioned, the rest unaffected
    PartitionIsolation,

    /// FC-006: corrupted delta rejected, stream recovers
    CorruptDelta,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::FreeRun,
            ScenarioId::LockStep,
            ScenarioId::FanOut,
            ScenarioId::EpisodeReset,
            ScenarioId::PartitionIsolation,
            ScenarioId::CorruptDelta,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::FreeRun => "free_run",
            ScenarioId::LockStep => "lock_step",
            ScenarioId::FanOut => "fan_out",
            ScenarioId::EpisodeReset => "episode_reset",
            ScenarioId::PartitionIsolation => "partition_isolation",
            ScenarioId::CorruptDelta => "corrupt_delta",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::FreeRun => "Asynchronous primary with moving traffic, secondaries must match",
            ScenarioId::LockStep => "Synchronous mode, frames advance only on tick-cues",
            ScenarioId::FanOut => "8 secondaries and 64 actors, no secondary falls behind",
            ScenarioId::EpisodeReset => "Episode restarted mid-run, frames and worlds start over",
            ScenarioId::PartitionIsolation => "One secondary cut off, others keep receiving deltas",
            ScenarioId::CorruptDelta => "Garbled delta rejected, later frames still applied",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free_run" | "freerun" | "fc-001" => Ok(ScenarioId::FreeRun),
            "lock_step" | "lockstep" | "fc-002" => Ok(ScenarioId::LockStep),
            "fan_out" | "fanout" | "fc-003" => Ok(ScenarioId::FanOut),
            "episode_reset" | "episodereset" | "fc-004" => Ok(ScenarioId::EpisodeReset),
            "partition_isolation" | "partition" | "fc-005" => Ok(ScenarioId::PartitionIsolation),
            "corrupt_delta" | "corruptdelta" | "fc-006" => Ok(ScenarioId::CorruptDelta),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
        }
        assert_eq!("FC-005".parse::<ScenarioId>(), Ok(ScenarioId::PartitionIsolation));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
