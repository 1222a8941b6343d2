// src/bin/train.rs
//
// Offline training harness: learn one Q-table per intersection against the
// synthetic simulator and write the policy artifact.
//
// Run examples:
//   cargo run --release --bin qsignal-train -- --episodes 600
//   QSIGNAL_TELEMETRY_MODE=jsonl QSIGNAL_TELEMETRY_PATH=runs/train.jsonl \
//     cargo run --release --bin qsignal-train -- --episodes 100 --seed 7
//
// Precedence: CLI flag > QSIGNAL_* environment > Config::default().

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use qsignal::shutdown::stop_on_ctrl_c;
use qsignal::{Config, SyntheticSimulator, TelemetrySink, Trainer};

#[derive(Parser, Debug)]
#[command(name = "qsignal-train", about = "Train per-intersection Q-tables")]
struct Cli {
    /// Number of training episodes.
    #[arg(long)]
    episodes: Option<u32>,

    /// Step cap per episode.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Seed for exploration and the synthetic simulator.
    #[arg(long)]
    seed: Option<u64>,

    /// Output path of the policy artifact.
    #[arg(long)]
    out: Option<PathBuf>,

    /// More diagnostics on stderr (-v: per-step debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only errors on stderr.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn build_config(cli: &Cli) -> Config {
    let mut cfg = Config::from_env();
    if let Some(episodes) = cli.episodes {
        cfg.training.episodes = episodes;
    }
    if let Some(max_steps) = cli.max_steps {
        cfg.training.max_steps = max_steps;
    }
    if let Some(seed) = cli.seed {
        cfg.training.seed = seed;
        cfg.synthetic.seed = seed;
    }
    if let Some(out) = &cli.out {
        cfg.artifact_path = out.clone();
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
    cfg.log_startup("qsignal-train");

    let stop = stop_on_ctrl_c("train");
    let path = cfg.artifact_path.clone();

    let (summary, saved) = tokio::task::spawn_blocking(move || {
        let sim = SyntheticSimulator::new(cfg.synthetic.clone());
        let mut trainer = Trainer::new(sim, &cfg)
            .with_telemetry(TelemetrySink::from_env())
            .with_stop_flag(stop);
        let summary = trainer.run()?;
        // Partial tables from an interrupted run are still worth keeping.
        let saved = trainer.save(&cfg.artifact_path);
        Ok::<_, qsignal::rl::TrainingError>((summary, saved))
    })
    .await
    .context("training task panicked")??;

    saved.with_context(|| format!("writing {}", path.display()))?;

    println!(
        "episodes={} final_avg_reward={:.2} final_epsilon={:.4} states={} interrupted={}",
        summary.episodes_completed(),
        summary.final_average(),
        summary.final_epsilon,
        summary.total_states,
        summary.interrupted
    );
    Ok(())
}
