//! Engine runners.
//!
//! `EngineWorker` hosts one engine on a dedicated thread behind a command
//! channel: ticks run only while the engine is started, commands apply
//! between ticks (never mid-evaluation), and every tick publishes a full
//! state snapshot. `run_parallel_regimes` runs one engine per regime on the
//! rayon pool, each with its own RNG and state, merging archive promotions
//! through a shared mutex-guarded sink.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use rayon::prelude::*;
use tracing::warn;

use crate::archive::ArchiveSink;
use crate::engine::Engine;
use crate::types::{
    Candidate, EngineConfig, EngineError, EngineResult, EngineState, Regime,
    PERSISTENT_ARCHIVE_CAP,
};

/// Snapshot cap on the update channel; the engine never blocks on slow
/// observers, it drops intermediate snapshots instead.
const UPDATE_BUFFER: usize = 32;

pub enum Command {
    Start,
    Stop,
    SetState(Box<EngineState>),
    GetState(Sender<Box<EngineState>>),
    Shutdown,
}

/// Published after every tick.
pub struct EngineUpdate {
    pub state: Box<EngineState>,
    pub promoted: Vec<Candidate>,
}

pub struct EngineWorker {
    commands: Sender<Command>,
    updates: Receiver<EngineUpdate>,
    handle: Option<JoinHandle<Engine>>,
}

impl EngineWorker {
    /// Spawn an engine on its own thread, initially stopped.
    pub fn spawn(config: EngineConfig, seed: u64) -> Self {
        let (cmd_tx, cmd_rx) = unbounded::<Command>();
        let (update_tx, update_rx) = bounded::<EngineUpdate>(UPDATE_BUFFER);

        let handle = thread::spawn(move || {
            let mut engine = Engine::new(config, seed);
            let mut shutdown = false;

            while !shutdown {
                if engine.running() {
                    // Apply everything already queued, then tick.
                    loop {
                        match cmd_rx.try_recv() {
                            Ok(cmd) => {
                                if apply(&mut engine, cmd) {
                                    shutdown = true;
                                }
                            }
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => {
                                shutdown = true;
                                break;
                            }
                        }
                    }
                    if shutdown || !engine.running() {
                        continue;
                    }
                    let promoted = engine.tick();
                    let update = EngineUpdate {
                        state: Box::new(engine.get_state()),
                        promoted,
                    };
                    // A full buffer drops this snapshot; the latest state
                    // stays reachable through GetState.
                    let _ = update_tx.try_send(update);
                } else {
                    match cmd_rx.recv() {
                        Ok(cmd) => {
                            if apply(&mut engine, cmd) {
                                shutdown = true;
                            }
                        }
                        Err(_) => shutdown = true,
                    }
                }
            }

            engine
        });

        Self {
            commands: cmd_tx,
            updates: update_rx,
            handle: Some(handle),
        }
    }

    pub fn start(&self) -> EngineResult<()> {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> EngineResult<()> {
        self.send(Command::Stop)
    }

    pub fn set_state(&self, state: EngineState) -> EngineResult<()> {
        self.send(Command::SetState(Box::new(state)))
    }

    /// Fetch a deep snapshot from the worker.
    pub fn get_state(&self) -> EngineResult<EngineState> {
        let (tx, rx) = bounded(1);
        self.send(Command::GetState(tx))?;
        rx.recv()
            .map(|boxed| *boxed)
            .map_err(|e| EngineError::Channel(format!("state reply lost: {e}")))
    }

    /// Stream of post-tick snapshots.
    pub fn updates(&self) -> &Receiver<EngineUpdate> {
        &self.updates
    }

    /// Stop scheduling, finish the current tick, and reclaim the engine.
    pub fn shutdown(mut self) -> EngineResult<Engine> {
        let _ = self.send(Command::Shutdown);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| EngineError::Channel("worker already joined".to_string()))?;
        handle
            .join()
            .map_err(|_| EngineError::Channel("engine thread panicked".to_string()))
    }

    fn send(&self, cmd: Command) -> EngineResult<()> {
        self.commands
            .send(cmd)
            .map_err(|e| EngineError::Channel(format!("worker gone: {e}")))
    }
}

/// Returns true when the worker should shut down.
fn apply(engine: &mut Engine, cmd: Command) -> bool {
    match cmd {
        Command::Start => engine.start(),
        Command::Stop => engine.stop(),
        Command::SetState(state) => engine.set_state(*state),
        Command::GetState(reply) => {
            if reply.send(Box::new(engine.get_state())).is_err() {
                warn!("state requester went away before the reply");
            }
        }
        Command::Shutdown => return true,
    }
    false
}

// ─── Parallel multi-regime runner ─────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct RegimeRunSummary {
    pub regime: Regime,
    pub ticks: usize,
    pub final_champion_score: Option<f64>,
    pub mean_champion_score: f64,
    pub std_champion_score: f64,
    pub promoted: usize,
}

/// Run one engine per regime in parallel. Each engine owns its RNG and its
/// state; the only shared resource is the promotion sink, serialized by the
/// mutex.
pub fn run_parallel_regimes(
    regimes: &[Regime],
    config: &EngineConfig,
    ticks: usize,
    seed_start: u64,
    sink: Arc<Mutex<dyn ArchiveSink>>,
) -> EngineResult<Vec<RegimeRunSummary>> {
    regimes
        .par_iter()
        .enumerate()
        .map(|(idx, &regime)| {
            let mut cfg = config.clone();
            cfg.cycle = vec![regime];
            let mut engine = Engine::new(cfg, seed_start + idx as u64);
            engine.start();

            let mut champion_scores = Vec::with_capacity(ticks);
            let mut promoted_total = 0;

            for _ in 0..ticks {
                let promoted = engine.tick();
                if !promoted.is_empty() {
                    promoted_total += promoted.len();
                    let mut sink = sink
                        .lock()
                        .map_err(|_| EngineError::Archive("promotion sink poisoned".into()))?;
                    sink.insert(&promoted)?;
                    sink.evict_beyond(PERSISTENT_ARCHIVE_CAP)?;
                }
                if let Some(pop) = engine.state().populations.get(&regime) {
                    if let Some(champion) = &pop.champion {
                        champion_scores.push(champion.score);
                    }
                }
            }

            let n = champion_scores.len().max(1) as f64;
            let mean = champion_scores.iter().sum::<f64>() / n;
            let var = champion_scores
                .iter()
                .map(|s| (s - mean).powi(2))
                .sum::<f64>()
                / n;

            Ok(RegimeRunSummary {
                regime,
                ticks,
                final_champion_score: champion_scores.last().copied(),
                mean_champion_score: mean,
                std_champion_score: var.sqrt(),
                promoted: promoted_total,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemorySink;

    fn tiny_cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.population_size = 8;
        cfg.train_paths = 1;
        cfg.eval_paths = 1;
        cfg.path_steps = 24;
        cfg
    }

    #[test]
    fn worker_ticks_while_started_and_stops_cleanly() {
        let worker = EngineWorker::spawn(tiny_cfg(), 42);
        worker.start().unwrap();

        let first = worker
            .updates()
            .recv_timeout(std::time::Duration::from_secs(30))
            .expect("first update");
        assert!(first.state.total_generations >= 1);

        worker.stop().unwrap();
        let state = worker.get_state().unwrap();
        assert!(!state.running);
        assert!(state.total_generations >= 1);

        let engine = worker.shutdown().unwrap();
        assert!(!engine.running());
    }

    #[test]
    fn worker_honors_set_state() {
        let worker = EngineWorker::spawn(tiny_cfg(), 7);
        let mut snapshot = EngineState::new();
        snapshot.total_generations = 99;
        worker.set_state(snapshot).unwrap();
        let state = worker.get_state().unwrap();
        assert_eq!(state.total_generations, 99);
        worker.shutdown().unwrap();
    }

    #[test]
    fn parallel_regimes_share_one_sink() {
        let sink: Arc<Mutex<dyn ArchiveSink>> = Arc::new(Mutex::new(MemorySink::new()));
        let regimes = [Regime::LowVol, Regime::JumpDiffusion];
        let summaries =
            run_parallel_regimes(&regimes, &tiny_cfg(), 5, 42, Arc::clone(&sink)).unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].regime, Regime::LowVol);
        assert_eq!(summaries[1].regime, Regime::JumpDiffusion);
        for s in &summaries {
            assert_eq!(s.ticks, 5);
            assert!(s.final_champion_score.is_some());
        }
    }
}
