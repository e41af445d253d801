mod extract;
mod fetch;
mod runner;
mod stage1;
mod stage2;
mod stage3;
mod state;
mod table;

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use crate::fetch::HttpFetcher;
use crate::state::StateManager;

#[derive(Parser)]
#[command(name = "drom_scraper", about = "Drom multi-stage catalog scraper")]
struct Cli {
    /// Stage to run
    #[arg(value_enum)]
    stage: StageArg,

    /// Path to the entry points file (one URL per line)
    #[arg(long, default_value = "entry-points.txt")]
    entry_points: PathBuf,

    /// Directory where intermediate results and state are stored
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Optional HTTP endpoint for the LLM extraction service
    #[arg(long)]
    llm_endpoint: Option<String>,

    /// Optional API key for the LLM extraction service
    #[arg(long)]
    llm_api_key: Option<String>,

    /// Optional model identifier for the LLM extraction service
    #[arg(long)]
    llm_model: Option<String>,

    /// Clear the selected stage's checkpoint before running
    #[arg(long)]
    reset: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, ValueEnum)]
enum StageArg {
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
    #[value(name = "3")]
    Three,
    All,
}

impl StageArg {
    fn runs(self, stage: StageArg) -> bool {
        self == StageArg::All || self == stage
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let t0 = Instant::now();

    fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("failed to create data dir {}", cli.data_dir.display()))?;
    let state = StateManager::new(cli.data_dir.join("state.json"));

    if cli.reset {
        for (arg, key) in [
            (StageArg::One, stage1::STAGE1_STATE_KEY),
            (StageArg::Two, stage2::STAGE2_STATE_KEY),
            (StageArg::Three, stage3::STAGE3_STATE_KEY),
        ] {
            if cli.stage.runs(arg) {
                state.reset(key)?;
            }
        }
    }

    let extractor = extract::build_extractor(cli.llm_endpoint, cli.llm_api_key, cli.llm_model)?;
    let fetcher = HttpFetcher::new()?;

    if cli.stage.runs(StageArg::One) {
        let stats = stage1::run_stage1(
            &cli.entry_points,
            &cli.data_dir,
            &state,
            &fetcher,
            extractor.as_ref(),
        )?;
        stats.log_summary("stage1");
    }
    if cli.stage.runs(StageArg::Two) {
        let stats = stage2::run_stage2(&cli.data_dir, &state, &fetcher)?;
        stats.log_summary("stage2");
    }
    if cli.stage.runs(StageArg::Three) {
        let stats = stage3::run_stage3(&cli.data_dir, &state, &fetcher, extractor.as_ref())?;
        stats.log_summary("stage3");
    }

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }
    Ok(())
}
