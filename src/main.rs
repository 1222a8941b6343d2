// src/main.rs
//
// Runtime harness: serve the learned Q-tables against the synthetic
// simulator, or run the fixed-time baseline for comparison.
//
// Run examples:
//   cargo run --release --bin qsignal -- --duration 1800
//   cargo run --release --bin qsignal -- --baseline --duration 1800
//
// Precedence: CLI flag > QSIGNAL_* environment > Config::default().

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use qsignal::shutdown::stop_on_ctrl_c;
use qsignal::{Config, ControlSession, PolicyArtifact, SyntheticSimulator, TelemetrySink};

#[derive(Parser, Debug)]
#[command(name = "qsignal", about = "Run Q-learning traffic-signal control")]
struct Cli {
    /// Simulated seconds to run.
    #[arg(long)]
    duration: Option<f64>,

    /// Request the simulator GUI (the synthetic simulator has none).
    #[arg(long)]
    gui: bool,

    /// Policy artifact to serve.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Run the fixed-time programs with no agents.
    #[arg(long)]
    baseline: bool,

    /// Seed for the simulator and the runtime fallback draws.
    #[arg(long)]
    seed: Option<u64>,

    /// More diagnostics on stderr (-v: per-tick debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only errors on stderr.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn build_config(cli: &Cli) -> Config {
    let mut cfg = Config::from_env();
    if let Some(duration) = cli.duration {
        cfg.control.duration = duration;
    }
    if let Some(model) = &cli.model {
        cfg.artifact_path = model.clone();
    }
    if let Some(seed) = cli.seed {
        cfg.control.seed = seed;
        cfg.synthetic.seed = seed;
    }
    cfg.verbosity = if cli.quiet {
        0
    } else {
        (cfg.verbosity + cli.verbose).min(2)
    };
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = build_config(&cli);
    cfg.log_startup("qsignal");
    if cli.gui {
        eprintln!("[sim] GUI requested; the synthetic simulator runs headless");
    }

    let stop = stop_on_ctrl_c("control");
    let baseline = cli.baseline;

    let summary = tokio::task::spawn_blocking(move || {
        let sim = SyntheticSimulator::new(cfg.synthetic.clone());
        let session = if baseline {
            ControlSession::baseline(sim, &cfg)
        } else {
            let artifact = PolicyArtifact::load_or_empty(&cfg.artifact_path);
            ControlSession::new(sim, &cfg, &artifact)
        }?;
        session
            .with_telemetry(TelemetrySink::from_env())
            .with_stop_flag(stop)
            .run()
    })
    .await
    .context("control task panicked")?
    .context("control session failed")?;

    println!(
        "mode={} steps={} mean_queue={:.2} mean_waiting={:.1} phase_changes={} skipped_ticks={} sim_errors={}",
        if baseline { "baseline" } else { "learned" },
        summary.steps,
        summary.mean_total_queue,
        summary.mean_total_waiting,
        summary.phase_changes,
        summary.skipped_ticks,
        summary.sim_errors
    );
    Ok(())
}
