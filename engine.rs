//! Engine loop.
//!
//! The engine rotates through its regime cycle, runs one evolution step per
//! tick, folds the results into the MAP-Elites grid and per-regime state,
//! and every few generations promotes buffered candidates into the global
//! archive. A tick is an atomic transformation of `EngineState`: evaluate →
//! score → sort → champions → MAP-Elites → archive selection → events.

use tracing::{debug, info};

use crate::archive::{passes_archive_threshold, select_promotions};
use crate::evolution::evolve_generation;
use crate::paths::RegimeConfig;
use crate::rng::EngineRng;
use crate::scoring::recommend;
use crate::types::{
    Candidate, EngineConfig, EngineEvent, EngineState, EventKind, PopulationState, Regime,
    EVENT_LOG_CAP,
};

pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    rng: EngineRng,
}

impl Engine {
    pub fn new(config: EngineConfig, seed: u64) -> Self {
        Self::from_parts(config, EngineState::new(), EngineRng::seed_from_u64(seed))
    }

    /// Assemble an engine from an explicit snapshot and RNG, for replay and
    /// determinism tests.
    pub fn from_parts(config: EngineConfig, state: EngineState, rng: EngineRng) -> Self {
        Self { config, state, rng }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Deep snapshot for observers; bins are plain numeric vectors.
    pub fn get_state(&self) -> EngineState {
        self.state.clone()
    }

    /// Replace the engine state wholesale.
    pub fn set_state(&mut self, snapshot: EngineState) {
        self.state = snapshot;
    }

    /// Clone of the RNG at its current position.
    pub fn rng_snapshot(&self) -> EngineRng {
        self.rng.clone()
    }

    pub fn start(&mut self) {
        self.state.running = true;
    }

    pub fn stop(&mut self) {
        self.state.running = false;
    }

    pub fn running(&self) -> bool {
        self.state.running
    }

    /// Regime the next tick will work on.
    pub fn next_regime(&self) -> Regime {
        if self.config.cycle.is_empty() {
            return Regime::LowVol;
        }
        self.config.cycle[(self.state.total_generations % self.config.cycle.len() as u64) as usize]
    }

    /// Run one generation. Returns the candidates promoted to the archive
    /// this tick (usually empty between promotion rounds).
    pub fn tick(&mut self) -> Vec<Candidate> {
        let regime = self.next_regime();
        let population = self
            .state
            .populations
            .remove(&regime)
            .unwrap_or_else(|| PopulationState::empty(regime));

        let recommendation = recommend(&population.candidates);
        let regime_cfg = RegimeConfig::for_regime(regime);

        let outcome = evolve_generation(
            &population,
            &self.config,
            &regime_cfg,
            recommendation.as_ref(),
            &self.state.map_elites,
            &mut self.rng,
        );
        let mut population = outcome.population;
        let mut events = outcome.events;

        for candidate in &population.candidates {
            self.state.map_elites.insert(candidate);
        }

        // Buffer fresh qualifiers for the next promotion round.
        for candidate in &population.candidates {
            if passes_archive_threshold(candidate)
                && population
                    .archive_buffer
                    .iter()
                    .all(|held| held.id != candidate.id)
            {
                population.archive_buffer.push(candidate.clone());
            }
        }

        let generation_now = self.state.total_generations + 1;
        let mut promoted = Vec::new();
        if generation_now % self.config.archive_interval.max(1) == 0 {
            promoted = select_promotions(
                &population.archive_buffer,
                &self.state.archive,
                self.config.archive_batch_limit,
                self.config.min_score_improvement,
            );
            population.archive_buffer.clear();

            if !promoted.is_empty() {
                for candidate in &promoted {
                    if self.state.archive.iter().all(|held| held.id != candidate.id) {
                        self.state.archive.push_back(candidate.clone());
                    }
                }
                while self.state.archive.len() > self.config.archive_cap {
                    self.state.archive.pop_front();
                }
                events.push(EngineEvent {
                    kind: EventKind::ArchivePromotion,
                    regime,
                    generation: population.generation,
                    detail: format!("promoted {} candidates", promoted.len()),
                });
                info!(
                    regime = %regime,
                    promoted = promoted.len(),
                    archive = self.state.archive.len(),
                    "archive promotion round"
                );
            }
        }

        if let Some(champion) = &population.champion {
            debug!(
                regime = %regime,
                generation = population.generation,
                score = champion.score,
                "tick complete"
            );
        }

        self.append_events(events);
        self.state.populations.insert(regime, population);
        self.state.total_generations = generation_now;

        promoted
    }

    /// Run `n` ticks, collecting every promotion.
    pub fn run_ticks(&mut self, n: usize) -> Vec<Candidate> {
        let mut promoted = Vec::new();
        for _ in 0..n {
            promoted.extend(self.tick());
        }
        promoted
    }

    fn append_events(&mut self, events: Vec<EngineEvent>) {
        for e in events {
            self.state.events.push_back(e);
        }
        while self.state.events.len() > EVENT_LOG_CAP {
            self.state.events.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.population_size = 10;
        cfg.train_paths = 1;
        cfg.eval_paths = 1;
        cfg.path_steps = 32;
        cfg
    }

    #[test]
    fn ticks_rotate_through_the_cycle() {
        let mut engine = Engine::new(tiny_cfg(), 1);
        assert_eq!(engine.next_regime(), Regime::LowVol);
        engine.tick();
        assert_eq!(engine.next_regime(), Regime::HighVol);
        engine.tick();
        assert_eq!(engine.next_regime(), Regime::JumpDiffusion);
        engine.tick();
        assert_eq!(engine.next_regime(), Regime::LowVol);
        assert_eq!(engine.state().total_generations, 3);
        assert_eq!(engine.state().populations.len(), 3);
    }

    #[test]
    fn event_log_stays_bounded() {
        let mut engine = Engine::new(tiny_cfg(), 2);
        for _ in 0..120 {
            engine.tick();
        }
        assert!(engine.state().events.len() <= EVENT_LOG_CAP);
    }

    #[test]
    fn archived_candidates_never_outrun_their_generation() {
        let mut engine = Engine::new(tiny_cfg(), 3);
        for _ in 0..15 {
            let g = engine.state().total_generations;
            let promoted = engine.tick();
            for c in promoted {
                assert!(c.generation <= g + 1, "archive entry from the future");
            }
        }
        for c in &engine.state().archive {
            assert!(c.generation <= engine.state().total_generations);
        }
    }

    #[test]
    fn start_stop_flips_the_flag() {
        let mut engine = Engine::new(tiny_cfg(), 4);
        assert!(!engine.running());
        engine.start();
        assert!(engine.running());
        engine.stop();
        assert!(!engine.running());
    }
}
