//! Archive selection and persistence sinks.
//!
//! The engine buffers qualifying candidates and, every few generations,
//! promotes a deduplicated batch whose scores materially improve on the
//! incumbents. Persistence is a capability: the engine hands promoted
//! candidates to an `ArchiveSink`, which may be an in-memory ring, a JSONL
//! file, or anything a runner wires in. Sink failures surface to the caller;
//! in-memory engine state is never blocked on them.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::families::FamilyId;
use crate::types::{Candidate, EngineError, EngineResult, Regime};

// ─── Qualification ────────────────────────────────────────────────────────────

/// Bars a candidate must clear before it is even buffered for promotion.
/// Tuned so that a well-rounded shape passes and degenerate specialists do
/// not.
pub fn passes_archive_threshold(c: &Candidate) -> bool {
    let m = &c.metrics;
    c.score.is_finite()
        && m.total_fees >= 2.0
        && m.total_slippage <= 0.08
        && m.arb_leakage <= 40.0
        && m.liquidity_utilization >= 0.25
        && m.lp_value_vs_hodl >= 0.98
        && m.max_drawdown <= 0.35
        && c.stability <= 0.3
}

/// Pick the promotion batch: best-per-(family, regime) combo from the buffer,
/// admitted only when it beats the archive incumbent for that combo by at
/// least `min_improvement`, capped at `batch_limit` entries, best first.
pub fn select_promotions(
    buffer: &[Candidate],
    archive: &VecDeque<Candidate>,
    batch_limit: usize,
    min_improvement: f64,
) -> Vec<Candidate> {
    type Combo = (FamilyId, Regime);

    let mut best: BTreeMap<Combo, &Candidate> = BTreeMap::new();
    for c in buffer {
        let key = (c.family_id, c.regime);
        match best.get(&key) {
            Some(held) if held.score <= c.score => {}
            _ => {
                best.insert(key, c);
            }
        }
    }

    let mut incumbents: BTreeMap<Combo, f64> = BTreeMap::new();
    for c in archive {
        let key = (c.family_id, c.regime);
        let entry = incumbents.entry(key).or_insert(f64::INFINITY);
        *entry = entry.min(c.score);
    }

    let mut promoted: Vec<Candidate> = best
        .into_iter()
        .filter(|(key, c)| {
            let incumbent = incumbents.get(key).copied().unwrap_or(f64::INFINITY);
            c.score <= incumbent - min_improvement
        })
        .map(|(_, c)| c.clone())
        .collect();

    promoted.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
    promoted.truncate(batch_limit);
    promoted
}

// ─── Sinks ────────────────────────────────────────────────────────────────────

/// Persistence capability for promoted candidates. Bulk insert plus bulk
/// eviction of the oldest entries beyond a cap are the only two operations;
/// callers serialize concurrent writers around the sink themselves.
pub trait ArchiveSink: Send {
    fn insert(&mut self, batch: &[Candidate]) -> EngineResult<()>;

    /// Drop the oldest entries beyond `cap`; returns how many went.
    fn evict_beyond(&mut self, cap: usize) -> EngineResult<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Insertion-ordered in-memory sink, used by tests and memory-only runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: VecDeque<Candidate>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Candidate> {
        self.entries.iter().find(|c| c.id == id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Candidate> {
        self.entries.iter()
    }
}

impl ArchiveSink for MemorySink {
    fn insert(&mut self, batch: &[Candidate]) -> EngineResult<()> {
        for c in batch {
            if self.entries.iter().all(|held| held.id != c.id) {
                self.entries.push_back(c.clone());
            }
        }
        Ok(())
    }

    fn evict_beyond(&mut self, cap: usize) -> EngineResult<usize> {
        let mut evicted = 0;
        while self.entries.len() > cap {
            self.entries.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Append-only JSONL sink: one wire-format candidate per line. Eviction
/// rewrites the file keeping the newest `cap` lines, so the cap is a soft
/// bound between rewrites.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lines: usize,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lines = match fs::read_to_string(&path) {
            Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(EngineError::Archive(format!(
                    "cannot open archive file {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self { path, lines })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArchiveSink for JsonlSink {
    fn insert(&mut self, batch: &[Candidate]) -> EngineResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                EngineError::Archive(format!(
                    "cannot append to {}: {e}",
                    self.path.display()
                ))
            })?;
        for c in batch {
            let line = serde_json::to_string(c)
                .map_err(|e| EngineError::Archive(format!("serialize candidate: {e}")))?;
            writeln!(file, "{line}").map_err(|e| {
                EngineError::Archive(format!("write to {}: {e}", self.path.display()))
            })?;
        }
        self.lines += batch.len();
        Ok(())
    }

    fn evict_beyond(&mut self, cap: usize) -> EngineResult<usize> {
        if self.lines <= cap {
            return Ok(0);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            EngineError::Archive(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let keep_from = lines.len().saturating_sub(cap);
        let kept = &lines[keep_from..];
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        fs::write(&self.path, out).map_err(|e| {
            EngineError::Archive(format!("cannot rewrite {}: {e}", self.path.display()))
        })?;
        let evicted = self.lines - kept.len();
        self.lines = kept.len();
        Ok(evicted)
    }

    fn len(&self) -> usize {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateSource, Features, Metrics, PoolType, N_BINS, TOTAL_LIQUIDITY};
    use std::collections::BTreeMap;

    fn archivable(id: &str, score: f64) -> Candidate {
        Candidate {
            id: id.to_string(),
            generation: 1,
            regime: Regime::LowVol,
            bins: vec![TOTAL_LIQUIDITY / N_BINS as f64; N_BINS],
            family_id: FamilyId::PiecewiseBands,
            family_params: BTreeMap::new(),
            metrics: Metrics {
                total_fees: 10.0,
                total_slippage: 0.03,
                arb_leakage: 20.0,
                liquidity_utilization: 0.5,
                lp_value_vs_hodl: 1.02,
                max_drawdown: 0.2,
                volatility_of_returns: 0.05,
            },
            features: Features::default(),
            stability: 0.12,
            score,
            pool_type: PoolType::TwoAsset,
            asset_count: 2,
            adaptive_profile: None,
            source: CandidateSource::Global,
        }
    }

    #[test]
    fn qualifying_metrics_pass_the_threshold() {
        assert!(passes_archive_threshold(&archivable("a", -1.0)));

        let mut deep_drawdown = archivable("b", -1.0);
        deep_drawdown.metrics.max_drawdown = 0.6;
        assert!(!passes_archive_threshold(&deep_drawdown));

        let mut unstable = archivable("c", -1.0);
        unstable.stability = 0.5;
        assert!(!passes_archive_threshold(&unstable));
    }

    #[test]
    fn promotion_requires_material_improvement() {
        let incumbent = archivable("old", -1.0);
        let mut archive = VecDeque::new();
        archive.push_back(incumbent);

        // Marginally better: rejected.
        let near = vec![archivable("near", -1.002)];
        assert!(select_promotions(&near, &archive, 24, 0.005).is_empty());

        // Materially better: promoted.
        let clear = vec![archivable("clear", -1.2)];
        let promoted = select_promotions(&clear, &archive, 24, 0.005);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, "clear");
    }

    #[test]
    fn promotion_dedupes_per_family_combo() {
        let buffer = vec![
            archivable("worse", -0.5),
            archivable("better", -0.9),
            archivable("middling", -0.7),
        ];
        let promoted = select_promotions(&buffer, &VecDeque::new(), 24, 0.005);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, "better");
    }

    #[test]
    fn memory_sink_round_trips_by_id() {
        let mut sink = MemorySink::new();
        let original = archivable("keep-me", -2.0);
        sink.insert(std::slice::from_ref(&original)).unwrap();

        let held = sink.get("keep-me").expect("inserted");
        assert_eq!(held.id, original.id);
        assert_eq!(held.bins, original.bins);
        assert_eq!(held.score, original.score);

        // FIFO eviction keeps the newest.
        sink.insert(&[archivable("later", -1.0)]).unwrap();
        assert_eq!(sink.evict_beyond(1).unwrap(), 1);
        assert!(sink.get("keep-me").is_none());
        assert!(sink.get("later").is_some());
    }
}
