use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use amm_atlas_engine::archive::{ArchiveSink, JsonlSink, MemorySink};
use amm_atlas_engine::engine::Engine;
use amm_atlas_engine::runner::run_parallel_regimes;
use amm_atlas_engine::types::{EngineConfig, EngineState, Regime};

#[derive(Parser)]
#[command(name = "amm-atlas", about = "CLI for the AMM discovery engine")]
struct Cli {
    /// Engine state snapshot file.
    #[arg(long, global = true, default_value = "atlas_state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise a fresh state file with bootstrapped populations.
    Bootstrap {
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Advance the engine by a number of generations.
    Generate {
        /// Restrict the run to one regime instead of the full cycle.
        #[arg(long)]
        regime: Option<String>,
        #[arg(long, default_value_t = 1)]
        ticks: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Summarize the stored engine state.
    Status,
    /// Run every regime in parallel, streaming promotions to the archive.
    Run {
        #[arg(long, default_value_t = 30)]
        ticks: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Comma-separated regime list; defaults to the standard cycle.
        #[arg(long)]
        regimes: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        println!("{}", json!({ "error": format!("{e:#}") }));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Bootstrap { seed } => bootstrap_cmd(&cli.state, seed),
        Commands::Generate {
            regime,
            ticks,
            seed,
        } => generate_cmd(&cli.state, regime.as_deref(), ticks, seed),
        Commands::Status => status_cmd(&cli.state),
        Commands::Run {
            ticks,
            seed,
            regimes,
        } => run_cmd(&cli.state, ticks, seed, regimes.as_deref()),
    }
}

fn bootstrap_cmd(state_path: &Path, seed: u64) -> Result<()> {
    let config = EngineConfig::default();
    let cycle_len = config.cycle.len();
    let mut engine = Engine::new(config, seed);

    // One tick per regime bootstraps every population in the cycle.
    engine.run_ticks(cycle_len);
    save_state(state_path, &engine.get_state())?;

    println!("{}", summary_json(engine.state(), state_path));
    Ok(())
}

fn generate_cmd(
    state_path: &Path,
    regime: Option<&str>,
    ticks: usize,
    seed: u64,
) -> Result<()> {
    if ticks == 0 {
        bail!("--ticks must be at least 1");
    }

    let mut config = EngineConfig::default();
    if let Some(name) = regime {
        let regime = Regime::from_str(name)
            .with_context(|| format!("unusable --regime '{name}'"))?;
        config.cycle = vec![regime];
    }

    let mut engine = Engine::new(config, seed);
    if let Some(state) = load_state(state_path)? {
        engine.set_state(state);
    } else {
        info!(path = %state_path.display(), "no state file, starting fresh");
    }

    let promoted = engine.run_ticks(ticks);
    save_state(state_path, &engine.get_state())?;

    let mut body: serde_json::Value =
        serde_json::from_str(&summary_json(engine.state(), state_path))?;
    body["ticks_run"] = json!(ticks);
    body["promoted"] = json!(promoted.len());
    println!("{body}");
    Ok(())
}

fn status_cmd(state_path: &Path) -> Result<()> {
    let state = load_state(state_path)?.with_context(|| {
        format!(
            "no engine state at {}; run `amm-atlas bootstrap` first",
            state_path.display()
        )
    })?;
    println!("{}", summary_json(&state, state_path));
    Ok(())
}

fn run_cmd(
    state_path: &Path,
    ticks: usize,
    seed: u64,
    regimes: Option<&str>,
) -> Result<()> {
    let config = EngineConfig::default();
    let regimes: Vec<Regime> = match regimes {
        Some(list) => list
            .split(',')
            .map(|s| Regime::from_str(s.trim()))
            .collect::<Result<_, _>>()
            .context("unusable --regimes list")?,
        None => config.cycle.clone(),
    };
    if regimes.is_empty() {
        bail!("--regimes resolved to an empty list");
    }

    let sink = open_archive_sink()?;
    let summaries =
        run_parallel_regimes(&regimes, &config, ticks, seed, Arc::clone(&sink))
            .context("parallel regime run failed")?;

    let archived = sink
        .lock()
        .map(|s| s.len())
        .unwrap_or(0);

    println!(
        "{}",
        json!({
            "ticks": ticks,
            "archived": archived,
            "regimes": summaries.iter().map(|s| json!({
                "regime": s.regime.as_str(),
                "final_champion_score": s.final_champion_score,
                "mean_champion_score": s.mean_champion_score,
                "std_champion_score": s.std_champion_score,
                "promoted": s.promoted,
            })).collect::<Vec<_>>(),
        })
    );

    // `run` owns no cross-invocation population state; leave any existing
    // snapshot alone unless this is the only state we have.
    if !state_path.exists() {
        info!(path = %state_path.display(), "no snapshot written by run; use generate for stateful evolution");
    }
    Ok(())
}

/// Resolve the promotion sink from the environment. `ARCHIVE_URL` supports
/// `file:` paths (and bare paths); anything else falls back to the default
/// JSONL file with a warning, keeping the engine usable in memory-only mode.
fn open_archive_sink() -> Result<Arc<Mutex<dyn ArchiveSink>>> {
    let url = std::env::var("ARCHIVE_URL").ok();
    if std::env::var("ARCHIVE_KEY").is_ok() {
        info!("ARCHIVE_KEY present; passed through to the archive backend");
    }

    let sink: Arc<Mutex<dyn ArchiveSink>> = match url.as_deref() {
        None => Arc::new(Mutex::new(JsonlSink::new("atlas_archive.jsonl")?)),
        Some(url) => {
            if let Some(path) = url.strip_prefix("file:") {
                Arc::new(Mutex::new(JsonlSink::new(path)?))
            } else if !url.contains(':') {
                Arc::new(Mutex::new(JsonlSink::new(url)?))
            } else {
                warn!(
                    url,
                    "unsupported ARCHIVE_URL scheme; promotions stay in memory for this run"
                );
                Arc::new(Mutex::new(MemorySink::new()))
            }
        }
    };
    Ok(sink)
}

fn load_state(path: &Path) -> Result<Option<EngineState>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let state: EngineState = serde_json::from_str(&content)
                .with_context(|| format!("corrupt state file {}", path.display()))?;
            Ok(Some(state))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
    }
}

fn save_state(path: &Path, state: &EngineState) -> Result<()> {
    let body = serde_json::to_vec(state).context("serialize engine state")?;
    fs::write(path, body).with_context(|| format!("cannot write {}", path.display()))
}

fn summary_json(state: &EngineState, state_path: &Path) -> String {
    json!({
        "state_file": state_path.display().to_string(),
        "running": state.running,
        "total_generations": state.total_generations,
        "archive_len": state.archive.len(),
        "map_elites_coverage": state.map_elites.coverage(),
        "populations": state.populations.iter().map(|(regime, pop)| json!({
            "regime": regime.as_str(),
            "generation": pop.generation,
            "size": pop.candidates.len(),
            "evaluations": pop.evaluations,
            "champion_score": pop.champion.as_ref().map(|c| c.score),
            "champion_family": pop.champion.as_ref().map(|c| c.family_id.as_str()),
        })).collect::<Vec<_>>(),
        "recent_events": state.events.iter().rev().take(10).map(|e| json!({
            "kind": e.kind,
            "regime": e.regime.as_str(),
            "generation": e.generation,
            "detail": e.detail,
        })).collect::<Vec<_>>(),
    })
    .to_string()
}
