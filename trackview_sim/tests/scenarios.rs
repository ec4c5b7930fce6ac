//! End-to-end replay scenarios against the real engine.

use proptest::prelude::*;
use trackview_core::EngineConfig;
use trackview_sim::{ScenarioId, ScenarioRunner};

fn assert_passes(seed: u64, scenario: ScenarioId) -> trackview_sim::ScenarioResult {
    let result = ScenarioRunner::new(seed).run(scenario);
    assert!(
        result.passed,
        "{} (seed={}) failed: {}",
        scenario,
        seed,
        result.failure_reason.as_deref().unwrap_or("unknown")
    );
    result
}

#[test]
fn test_all_scenarios_pass() {
    for scenario in ScenarioId::all() {
        assert_passes(42, scenario);
    }
}

#[test]
fn test_runs_are_reproducible() {
    let a = ScenarioRunner::new(99).run(ScenarioId::RapidSeek);
    let b = ScenarioRunner::new(99).run(ScenarioId::RapidSeek);

    assert!(a.passed && b.passed);
    assert_eq!(a.metrics, b.metrics);
    assert_eq!(a.final_cursor_ms, b.final_cursor_ms);
}

#[test]
fn test_linear_playback_fetches_each_window_once() {
    let result = assert_passes(5, ScenarioId::LinearPlayback);

    // 20 minutes in 80 second windows
    assert_eq!(result.metrics.fetches, 15);
    assert_eq!(result.metrics.windows_inserted, 15);
    assert_eq!(result.metrics.source_calls, 15);
    assert_eq!(result.total_ticks, 1200);
}

#[test]
fn test_flaky_source_surfaces_failures() {
    let result = assert_passes(8, ScenarioId::FlakySource);
    assert!(result.metrics.failures > 0);
    assert!(result.metrics.unavailable_notices > 0);
}

#[test]
fn test_rapid_seek_issues_every_seek() {
    let result = assert_passes(21, ScenarioId::RapidSeek);
    assert_eq!(result.metrics.seeks, 200);
    assert_eq!(
        result.metrics.fetches,
        result.metrics.windows_inserted + result.metrics.stale_discards + result.metrics.failures
    );
}

#[test]
fn test_long_haul_stays_within_budget() {
    let result = assert_passes(13, ScenarioId::LongHaul);
    assert!(result.metrics.peak_loaded_windows <= EngineConfig::default().max_loaded_windows);
    assert!(result.metrics.windows_evicted > 0);
}

#[test]
fn test_custom_window_size() {
    let config = EngineConfig {
        window_duration_secs: 30,
        lookahead_windows: 3,
        max_loaded_windows: 6,
        ..EngineConfig::default()
    };
    let result = ScenarioRunner::new(2)
        .with_entities(4)
        .with_config(config)
        .run(ScenarioId::LinearPlayback);

    assert!(result.passed, "{:?}", result.failure_reason);
    assert_eq!(result.metrics.fetches, 40);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    #[test]
    fn prop_rapid_seek_holds_for_any_seed(seed in any::<u64>()) {
        let result = ScenarioRunner::new(seed).with_entities(3).run(ScenarioId::RapidSeek);
        prop_assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
    }
}
