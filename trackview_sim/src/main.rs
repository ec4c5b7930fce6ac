//! TrackView DST Simulator CLI
//!
//! Run deterministic replay scenarios against the real engine.

use clap::Parser;
use std::process::ExitCode;
use trackview_core::EngineConfig;
use trackview_sim::{ScenarioId, ScenarioResult, ScenarioRunner};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// TrackView Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "trackview-sim")]
#[command(about = "Run deterministic replay simulations for TrackView", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of simulated entities
    #[arg(short, long, default_value = "10")]
    entities: u32,

    /// Scenario to run (linear_playback, fast_forward, rapid_seek, flaky_source,
    /// slow_source, rewind, long_haul, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Engine configuration JSON file
    #[arg(short, long)]
    config: Option<String>,

    /// Override window duration in seconds
    #[arg(long)]
    window_secs: Option<u32>,

    /// Override windows prefetched ahead of the cursor
    #[arg(long)]
    lookahead: Option<usize>,

    /// Override the resident window budget
    #[arg(long)]
    max_loaded: Option<usize>,

    /// Override fetch attempts per window
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export sampled frames of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Ticks between exported frames
    #[arg(long, default_value = "10")]
    export_interval: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the verbosity flag
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("TrackView DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                return ExitCode::FAILURE;
            }
        }
    };

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Handle --export mode for visualization
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            return ExitCode::FAILURE;
        }
        return run_with_export(&args, config, base_seed, scenarios[0], export_path);
    }

    // Run simulations
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_entities(args.entities)
            .with_config(config.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "cursor_ms": r.final_cursor_ms,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Config file (or defaults) with command-line overrides applied.
fn build_config(args: &Args) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path, e))?;
            EngineConfig::from_json(&json).map_err(|e| format!("{}: {}", path, e))?
        }
        None => EngineConfig::default(),
    };

    if let Some(secs) = args.window_secs {
        config.window_duration_secs = secs;
    }
    if let Some(lookahead) = args.lookahead {
        config.lookahead_windows = lookahead;
    }
    if let Some(max_loaded) = args.max_loaded {
        config.max_loaded_windows = max_loaded;
    }
    if args.max_attempts.is_some() {
        config.max_fetch_attempts = args.max_attempts;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Run one scenario, writing sampled frames to `export_path`.
fn run_with_export(
    args: &Args,
    config: EngineConfig,
    seed: u64,
    scenario: ScenarioId,
    export_path: &str,
) -> ExitCode {
    info!("Running with export to: {}", export_path);

    let (result, export) = ScenarioRunner::new(seed)
        .with_entities(args.entities)
        .with_config(config)
        .with_export(args.export_interval)
        .run_with_export(scenario);

    match export {
        Some(export) => match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path),
            Err(e) => error!("Failed to write export: {:?}", e),
        },
        None => warn!("No frames recorded"),
    }

    report(&result);
    if result.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED - {} ticks, {} fetches, {} stale",
            result.scenario.name(),
            result.seed,
            result.total_ticks,
            result.metrics.fetches,
            result.metrics.stale_discards
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}
