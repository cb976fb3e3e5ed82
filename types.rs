use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cma::CmaEs;
use crate::families::FamilyId;
use crate::map_elites::MapElitesGrid;

// ─── Core constants ───────────────────────────────────────────────────────────

/// Number of discrete liquidity bins tiling the log-price axis.
pub const N_BINS: usize = 64;

/// Total liquidity mass every candidate distributes across its bins.
pub const TOTAL_LIQUIDITY: f64 = 1000.0;

pub const LOG_PRICE_MIN: f64 = -2.0;
pub const LOG_PRICE_MAX: f64 = 2.0;
pub const BIN_WIDTH: f64 = (LOG_PRICE_MAX - LOG_PRICE_MIN) / N_BINS as f64;

/// Swap fee taken on every trade (30 bps).
pub const FEE_RATE: f64 = 0.003;

/// Minimum pool/reference log-price deviation before arbitrageurs act.
pub const ARB_THRESHOLD: f64 = 0.005;

pub const POPULATION_SIZE: usize = 40;
pub const ELITE_FRACTION: f64 = 0.25;
pub const EXPLORATION_RATE: f64 = 0.25;

pub const MAX_PATHS_PER_EVAL: usize = 4;
pub const FAST_PATH_STEPS: usize = 96;
pub const DT: f64 = 1.0 / 365.0;

pub const ARCHIVE_ROUND_INTERVAL: u64 = 5;
pub const ARCHIVE_BATCH_LIMIT: usize = 24;
pub const ARCHIVE_MIN_SCORE_IMPROVEMENT: f64 = 0.005;
pub const WORKER_ARCHIVE_CAP: usize = 2000;
pub const PERSISTENT_ARCHIVE_CAP: usize = 50_000;

pub const EVENT_LOG_CAP: usize = 200;

// ─── Regimes ──────────────────────────────────────────────────────────────────

/// Stochastic price-process configuration a population evolves against.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Regime {
    LowVol,
    HighVol,
    JumpDiffusion,
    RegimeShift,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::LowVol => "low-vol",
            Regime::HighVol => "high-vol",
            Regime::JumpDiffusion => "jump-diffusion",
            Regime::RegimeShift => "regime-shift",
        }
    }

    /// Default engine rotation. `regime-shift` is opt-in via `EngineConfig`.
    pub fn default_cycle() -> Vec<Regime> {
        vec![Regime::LowVol, Regime::HighVol, Regime::JumpDiffusion]
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Regime {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low-vol" => Ok(Regime::LowVol),
            "high-vol" => Ok(Regime::HighVol),
            "jump-diffusion" => Ok(Regime::JumpDiffusion),
            "regime-shift" => Ok(Regime::RegimeShift),
            other => Err(EngineError::InvalidState(format!("unknown regime '{other}'"))),
        }
    }
}

// ─── Metrics & features ───────────────────────────────────────────────────────

/// Raw simulation metrics averaged over the evaluation paths of one candidate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_fees: f64,
    pub total_slippage: f64,
    pub arb_leakage: f64,
    pub liquidity_utilization: f64,
    pub lp_value_vs_hodl: f64,
    pub max_drawdown: f64,
    pub volatility_of_returns: f64,
}

/// Shape descriptors of a bin density, computed on the probability vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub curvature: f64,
    pub curvature_gradient: f64,
    pub entropy: f64,
    pub symmetry: f64,
    pub tail_density_ratio: f64,
    pub peak_concentration: f64,
    pub concentration_width: f64,
}

/// The seven normalized spider axes. Also keys the per-metric champion table
/// and the recommender's weak-axis output.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AxisKey {
    Fees,
    Utilization,
    LpValue,
    LowSlippage,
    LowArbLeak,
    Stability,
    LowDrawdown,
}

impl AxisKey {
    pub const ALL: [AxisKey; 7] = [
        AxisKey::Fees,
        AxisKey::Utilization,
        AxisKey::LpValue,
        AxisKey::LowSlippage,
        AxisKey::LowArbLeak,
        AxisKey::Stability,
        AxisKey::LowDrawdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AxisKey::Fees => "fees",
            AxisKey::Utilization => "utilization",
            AxisKey::LpValue => "lp_value",
            AxisKey::LowSlippage => "low_slippage",
            AxisKey::LowArbLeak => "low_arb_leak",
            AxisKey::Stability => "stability",
            AxisKey::LowDrawdown => "low_drawdown",
        }
    }

    /// Is `challenger` strictly better than `incumbent` on this axis, judged
    /// on the raw metric the axis tracks?
    pub fn improves(&self, challenger: &Candidate, incumbent: &Candidate) -> bool {
        let (c, i) = (challenger, incumbent);
        match self {
            AxisKey::Fees => c.metrics.total_fees > i.metrics.total_fees,
            AxisKey::Utilization => {
                c.metrics.liquidity_utilization > i.metrics.liquidity_utilization
            }
            AxisKey::LpValue => c.metrics.lp_value_vs_hodl > i.metrics.lp_value_vs_hodl,
            AxisKey::LowSlippage => c.metrics.total_slippage < i.metrics.total_slippage,
            AxisKey::LowArbLeak => c.metrics.arb_leakage < i.metrics.arb_leakage,
            AxisKey::Stability => c.stability < i.stability,
            AxisKey::LowDrawdown => c.metrics.max_drawdown < i.metrics.max_drawdown,
        }
    }
}

// ─── Candidate ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolType {
    TwoAsset,
    MultiAsset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateSource {
    Global,
    Experiment,
    UserDesigned,
}

/// An evaluated liquidity shape. Immutable after creation: the evolution step
/// always replaces candidates wholesale rather than editing them in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub generation: u64,
    pub regime: Regime,
    /// `N_BINS` non-negative masses summing to `TOTAL_LIQUIDITY`.
    pub bins: Vec<f64>,
    pub family_id: FamilyId,
    pub family_params: BTreeMap<String, f64>,
    pub metrics: Metrics,
    pub features: Features,
    /// Std deviation of `lp_value_vs_hodl` across all paths of one evaluation.
    pub stability: f64,
    /// Composite score, lower is better.
    pub score: f64,
    pub pool_type: PoolType,
    pub asset_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_profile: Option<String>,
    pub source: CandidateSource,
}

// ─── Population & engine state ────────────────────────────────────────────────

/// Per-regime evolutionary state. Replaced wholesale each generation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PopulationState {
    pub regime: Regime,
    pub candidates: Vec<Candidate>,
    pub champion: Option<Candidate>,
    /// All-time best per axis; monotone in the axis direction.
    pub metric_champions: BTreeMap<AxisKey, Candidate>,
    pub generation: u64,
    pub evaluations: u64,
    /// Monotone per-population counter used to mint stable candidate ids.
    pub serial: u64,
    /// Qualifying candidates awaiting the next promotion round.
    pub archive_buffer: Vec<Candidate>,
    /// Covariance-adapted sampler feeding exploration slots, when enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cma: Option<CmaEs>,
}

impl PopulationState {
    pub fn empty(regime: Regime) -> Self {
        Self {
            regime,
            candidates: Vec::new(),
            champion: None,
            metric_champions: BTreeMap::new(),
            generation: 0,
            evaluations: 0,
            serial: 0,
            archive_buffer: Vec::new(),
            cma: None,
        }
    }
}

/// Activity-log event kinds emitted by the evolution step and the engine loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ChampionReplaced,
    FamilyFrontierEntry,
    ConvergencePlateau,
    GenerationComplete,
    FamilyRegimeDominance,
    ArchivePromotion,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub regime: Regime,
    pub generation: u64,
    pub detail: String,
}

/// Full engine snapshot. `Engine::tick` transforms this atomically; consumers
/// observing `total_generations = g` see every mutation of generation `g`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineState {
    pub populations: BTreeMap<Regime, PopulationState>,
    /// Global archive, insertion-ordered, deduplicated by id, FIFO-bounded.
    pub archive: VecDeque<Candidate>,
    pub map_elites: MapElitesGrid,
    pub events: VecDeque<EngineEvent>,
    pub running: bool,
    pub total_generations: u64,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            populations: BTreeMap::new(),
            archive: VecDeque::new(),
            map_elites: MapElitesGrid::default(),
            events: VecDeque::new(),
            running: false,
            total_generations: 0,
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringMode {
    /// Spider-coverage-enhanced composite (default).
    SpiderCoverage,
    /// Plain weighted sum of raw metrics, without the coverage terms.
    Basic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub population_size: usize,
    pub elite_fraction: f64,
    pub exploration_rate: f64,
    pub train_paths: usize,
    pub eval_paths: usize,
    pub path_steps: usize,
    pub dt: f64,
    pub scoring_mode: ScoringMode,
    pub archive_interval: u64,
    pub archive_batch_limit: usize,
    pub archive_cap: usize,
    pub min_score_improvement: f64,
    pub cma_enabled: bool,
    pub cycle: Vec<Regime>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            population_size: POPULATION_SIZE,
            elite_fraction: ELITE_FRACTION,
            exploration_rate: EXPLORATION_RATE,
            train_paths: MAX_PATHS_PER_EVAL,
            eval_paths: MAX_PATHS_PER_EVAL,
            path_steps: FAST_PATH_STEPS,
            dt: DT,
            scoring_mode: ScoringMode::SpiderCoverage,
            archive_interval: ARCHIVE_ROUND_INTERVAL,
            archive_batch_limit: ARCHIVE_BATCH_LIMIT,
            archive_cap: WORKER_ARCHIVE_CAP,
            min_score_improvement: ARCHIVE_MIN_SCORE_IMPROVEMENT,
            cma_enabled: true,
            cycle: Regime::default_cycle(),
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

pub type EngineResult<T> = Result<T, EngineError>;

/// Library-surface errors. Numeric degeneracy (zero-sum densities, Cholesky
/// floors, clamped slippage) is recovered locally and never reaches here;
/// validation failures drop the candidate inside the evolution step.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("archive storage failure: {0}")]
    Archive(String),

    #[error("engine channel failure: {0}")]
    Channel(String),

    #[error("invalid engine state: {0}")]
    InvalidState(String),
}
