//! Replay scenarios for deterministic simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: Play a session end to end with a healthy source
    LinearPlayback,

    /// SIM-002: Large time steps, the cursor outruns the loader
    FastForward,

    /// SIM-003: Random seeks every tick while fetches are slow
    RapidSeek,

    /// SIM-004: Source fails a share of fetches at random
    FlakySource,

    /// SIM-005: Every fetch spans many ticks
    SlowSource,

    /// SIM-006: Play forward, jump back to the start, play again
    Rewind,

    /// SIM-007: Three-hour session at high speed
    LongHaul,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::LinearPlayback,
            ScenarioId::FastForward,
            ScenarioId::RapidSeek,
            ScenarioId::FlakySource,
            ScenarioId::SlowSource,
            ScenarioId::Rewind,
            ScenarioId::LongHaul,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::LinearPlayback => "linear_playback",
            ScenarioId::FastForward => "fast_forward",
            ScenarioId::RapidSeek => "rapid_seek",
            ScenarioId::FlakySource => "flaky_source",
            ScenarioId::SlowSource => "slow_source",
            ScenarioId::Rewind => "rewind",
            ScenarioId::LongHaul => "long_haul",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::LinearPlayback => "20-minute session at 1s steps; every window fetched exactly once",
            ScenarioId::FastForward => "20s steps with slow fetches; cursor never waits for data",
            ScenarioId::RapidSeek => "Random seek per tick; stale in-flight results are discarded",
            ScenarioId::FlakySource => "30% fetch failures; notices surface, retries recover",
            ScenarioId::SlowSource => "Fetches take 40 scheduler turns; playback keeps advancing",
            ScenarioId::Rewind => "Seek back after playing; far-ahead windows yield to near ones",
            ScenarioId::LongHaul => "3-hour session at 10s steps; residency stays within budget",
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
            "linear_playback" | "linear" | "sim-001" => Ok(ScenarioId::LinearPlayback),
            "fast_forward" | "fastforward" | "sim-002" => Ok(ScenarioId::FastForward),
            "rapid_seek" | "rapidseek" | "sim-003" => Ok(ScenarioId::RapidSeek),
            "flaky_source" | "flaky" | "sim-004" => Ok(ScenarioId::FlakySource),
            "slow_source" | "slow" | "sim-005" => Ok(ScenarioId::SlowSource),
            "rewind" | "sim-006" => Ok(ScenarioId::Rewind),
            "long_haul" | "longhaul" | "sim-007" => Ok(ScenarioId::LongHaul),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
