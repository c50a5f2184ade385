use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use finmem_models::{Day, MemoryConfig, MemoryId, Tier};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::MemoryError;
use crate::index::{FlatIndex, VectorIndex};
use crate::symbol::{ScoredMemory, SweepReport, SymbolMemory, SymbolSnapshot};

/// Current checkpoint format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Builds the vector index handed to each new symbol.
pub type IndexFactory = Arc<dyn Fn() -> Box<dyn VectorIndex> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSnapshot {
    pub version: u32,
    pub dimensions: usize,
    pub importance_upper_bound: f64,
    pub importance_update_step: f64,
    pub last_swept_day: Option<Day>,
    pub symbols: Vec<SymbolSnapshot>,
}

/// Tiered memory for every traded symbol.
///
/// Symbols can be checked out with [`MemoryEngine::take_symbol`] so per-symbol
/// work runs in parallel; the engine-wide sweep and snapshots require every
/// symbol to have been returned.
pub struct MemoryEngine {
    config: MemoryConfig,
    dimensions: usize,
    symbols: BTreeMap<String, SymbolMemory>,
    checked_out: BTreeSet<String>,
    index_factory: IndexFactory,
    last_swept_day: Option<Day>,
}

impl MemoryEngine {
    /// Create an empty engine. Fails on an inconsistent memory configuration.
    pub fn new(config: MemoryConfig, dimensions: usize) -> Result<Self, MemoryError> {
        validate_config(&config, dimensions)?;
        Ok(Self {
            config,
            dimensions,
            symbols: BTreeMap::new(),
            checked_out: BTreeSet::new(),
            index_factory: Arc::new(|| Box::new(FlatIndex::new())),
            last_swept_day: None,
        })
    }

    /// Use a different index implementation for symbols created from now on.
    pub fn with_index_factory(mut self, factory: IndexFactory) -> Self {
        self.index_factory = factory;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn last_swept_day(&self) -> Option<Day> {
        self.last_swept_day
    }

    /// Names of every known symbol, including checked-out ones.
    pub fn symbols(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.symbols.keys().cloned().collect();
        names.extend(self.checked_out.iter().cloned());
        names.into_iter().collect()
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolMemory> {
        self.symbols.get(symbol)
    }

    fn symbol_mut(&mut self, symbol: &str) -> Result<&mut SymbolMemory, MemoryError> {
        if self.checked_out.contains(symbol) {
            return Err(MemoryError::Unavailable(format!("{symbol} is checked out")));
        }
        if !self.symbols.contains_key(symbol) {
            let memory = SymbolMemory::new(
                symbol,
                &self.config,
                self.dimensions,
                (self.index_factory)(),
            );
            self.symbols.insert(symbol.to_string(), memory);
        }
        self.symbols
            .get_mut(symbol)
            .ok_or_else(|| MemoryError::Unavailable(symbol.to_string()))
    }

    /// Hand a symbol's memory to a worker. Unknown symbols start empty.
    pub fn take_symbol(&mut self, symbol: &str) -> Result<SymbolMemory, MemoryError> {
        self.symbol_mut(symbol)?;
        let memory = self
            .symbols
            .remove(symbol)
            .ok_or_else(|| MemoryError::Unavailable(symbol.to_string()))?;
        self.checked_out.insert(symbol.to_string());
        Ok(memory)
    }

    /// Give back a memory obtained from [`MemoryEngine::take_symbol`].
    pub fn return_symbol(&mut self, memory: SymbolMemory) -> Result<(), MemoryError> {
        if !self.checked_out.remove(memory.symbol()) {
            return Err(MemoryError::Invariant(format!(
                "{} returned without being checked out",
                memory.symbol()
            )));
        }
        self.symbols.insert(memory.symbol().to_string(), memory);
        Ok(())
    }

    pub fn insert(
        &mut self,
        symbol: &str,
        tier: Tier,
        text: &str,
        embedding: Vec<f32>,
        day: Day,
    ) -> Result<Option<MemoryId>, MemoryError> {
        self.symbol_mut(symbol)?.insert(tier, text, embedding, day)
    }

    pub fn retrieve(
        &mut self,
        symbol: &str,
        tier: Tier,
        query: &[f32],
        day: Day,
        k: usize,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        self.symbol_mut(symbol)?.retrieve(tier, query, day, k)
    }

    pub fn reinforce(
        &mut self,
        symbol: &str,
        tier: Tier,
        ids: &[MemoryId],
        day: Day,
    ) -> Result<usize, MemoryError> {
        self.symbol_mut(symbol)?.reinforce(tier, ids, day)
    }

    /// Engine-wide daily sweep. Runs once per day after every symbol has
    /// been returned.
    pub fn sweep(&mut self, day: Day) -> Result<SweepReport, MemoryError> {
        if !self.checked_out.is_empty() {
            return Err(MemoryError::Unavailable(format!(
                "cannot sweep while {} symbol(s) are checked out",
                self.checked_out.len()
            )));
        }
        if let Some(last) = self.last_swept_day {
            if day <= last {
                return Err(MemoryError::Invariant(format!(
                    "day {last} already swept, refusing day {day}"
                )));
            }
        }

        // Refuse the whole sweep if any symbol would, so no symbol runs ahead.
        for memory in self.symbols.values() {
            memory.check_sweep(day)?;
        }

        let mut report = SweepReport::default();
        for memory in self.symbols.values_mut() {
            report += memory.sweep(day)?;
        }
        self.last_swept_day = Some(day);

        info!(
            day,
            symbols = self.symbols.len(),
            decayed = report.decayed,
            promoted = report.promoted,
            demoted = report.demoted,
            removed = report.removed,
            "Memory sweep complete"
        );
        Ok(report)
    }

    /// Serialize the full engine state as versioned JSON.
    pub fn snapshot(&self) -> Result<Vec<u8>, MemoryError> {
        if !self.checked_out.is_empty() {
            return Err(MemoryError::Unavailable(
                "cannot snapshot while symbols are checked out".to_string(),
            ));
        }
        let snapshot = EngineSnapshot {
            version: SNAPSHOT_VERSION,
            dimensions: self.dimensions,
            importance_upper_bound: self.config.importance_upper_bound,
            importance_update_step: self.config.importance_update_step,
            last_swept_day: self.last_swept_day,
            symbols: self.symbols.values().map(SymbolMemory::snapshot).collect(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    /// Replace this engine's state with a snapshot. On error the engine is
    /// left unchanged.
    pub fn restore(&mut self, blob: &[u8]) -> Result<(), MemoryError> {
        if !self.checked_out.is_empty() {
            return Err(MemoryError::Unavailable(
                "cannot restore while symbols are checked out".to_string(),
            ));
        }
        let snapshot: EngineSnapshot = serde_json::from_slice(blob)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MemoryError::SnapshotVersion(snapshot.version));
        }
        if snapshot.dimensions != self.dimensions {
            return Err(MemoryError::Config(format!(
                "snapshot uses {}-dimensional embeddings, engine is configured for {}",
                snapshot.dimensions, self.dimensions
            )));
        }
        if snapshot.importance_upper_bound != self.config.importance_upper_bound
            || snapshot.importance_update_step != self.config.importance_update_step
        {
            return Err(MemoryError::Config(format!(
                "snapshot uses importance bound {} and step {}, engine is configured for {} and {}",
                snapshot.importance_upper_bound,
                snapshot.importance_update_step,
                self.config.importance_upper_bound,
                self.config.importance_update_step
            )));
        }

        let mut symbols = BTreeMap::new();
        for symbol_snapshot in snapshot.symbols {
            let name = symbol_snapshot.symbol.clone();
            let memory = SymbolMemory::from_snapshot(
                symbol_snapshot,
                &self.config,
                self.dimensions,
                (self.index_factory)(),
            )?;
            if symbols.insert(name.clone(), memory).is_some() {
                return Err(MemoryError::Invariant(format!(
                    "snapshot lists {name} twice"
                )));
            }
        }

        self.symbols = symbols;
        self.last_swept_day = snapshot.last_swept_day;
        Ok(())
    }

    /// Build a fresh engine from a snapshot blob.
    pub fn from_snapshot(
        config: MemoryConfig,
        dimensions: usize,
        blob: &[u8],
    ) -> Result<Self, MemoryError> {
        let mut engine = Self::new(config, dimensions)?;
        engine.restore(blob)?;
        Ok(engine)
    }
}

/// Reject memory configurations that could break the importance bounds or
/// make decay meaningless.
pub fn validate_config(config: &MemoryConfig, dimensions: usize) -> Result<(), MemoryError> {
    let upper = config.importance_upper_bound;
    if dimensions == 0 {
        return Err(MemoryError::Config("embedding dimensions must be > 0".into()));
    }
    if !(upper.is_finite() && upper > 0.0) {
        return Err(MemoryError::Config(format!(
            "importance_upper_bound must be positive, got {upper}"
        )));
    }
    let step = config.importance_update_step;
    if !(step.is_finite() && step >= 0.0) {
        return Err(MemoryError::Config(format!(
            "importance_update_step must be non-negative, got {step}"
        )));
    }

    for tier in Tier::ALL {
        let policy = config.policy(tier);
        if !(0.0..=upper).contains(&policy.importance_init) {
            return Err(MemoryError::Config(format!(
                "{tier}.importance_init {} outside [0, {upper}]",
                policy.importance_init
            )));
        }
        if !(policy.decay_importance_factor > 0.0 && policy.decay_importance_factor <= 1.0) {
            return Err(MemoryError::Config(format!(
                "{tier}.decay_importance_factor must be in (0, 1], got {}",
                policy.decay_importance_factor
            )));
        }
        if !(policy.decay_recency_factor.is_finite() && policy.decay_recency_factor > 0.0) {
            return Err(MemoryError::Config(format!(
                "{tier}.decay_recency_factor must be positive, got {}",
                policy.decay_recency_factor
            )));
        }
        if let (Some(lower), Some(upper_jump)) =
            (policy.jump_lower_threshold, policy.jump_upper_threshold)
        {
            if lower >= upper_jump {
                return Err(MemoryError::Config(format!(
                    "{tier}.jump_lower_threshold {lower} must be below jump_upper_threshold {upper_jump}"
                )));
            }
        }
    }

    match config.reflection.similarity_threshold {
        Some(threshold) if (-1.0..=1.0).contains(&threshold) => Ok(()),
        Some(threshold) => Err(MemoryError::Config(format!(
            "reflection.similarity_threshold must be in [-1, 1], got {threshold}"
        ))),
        None => Err(MemoryError::Config(
            "reflection.similarity_threshold is required".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MemoryEngine {
        MemoryEngine::new(MemoryConfig::default(), 2).unwrap()
    }

    #[test]
    fn rejects_bad_config() {
        let mut config = MemoryConfig::default();
        config.short.decay_importance_factor = 1.5;
        assert!(matches!(
            MemoryEngine::new(config, 2),
            Err(MemoryError::Config(_))
        ));

        let mut config = MemoryConfig::default();
        config.long.importance_init = 120.0;
        assert!(MemoryEngine::new(config, 2).is_err());

        let mut config = MemoryConfig::default();
        config.reflection.similarity_threshold = None;
        assert!(MemoryEngine::new(config, 2).is_err());

        assert!(MemoryEngine::new(MemoryConfig::default(), 0).is_err());
    }

    #[test]
    fn take_and_return_symbol() {
        let mut engine = engine();
        engine.insert("AAPL", Tier::Short, "x", vec![1.0, 0.0], 0).unwrap();

        let memory = engine.take_symbol("AAPL").unwrap();
        assert_eq!(memory.len(Tier::Short), 1);
        assert!(matches!(
            engine.insert("AAPL", Tier::Short, "y", vec![1.0, 0.0], 0),
            Err(MemoryError::Unavailable(_))
        ));
        assert!(engine.take_symbol("AAPL").is_err());
        assert!(matches!(engine.sweep(1), Err(MemoryError::Unavailable(_))));
        assert_eq!(engine.symbols(), vec!["AAPL".to_string()]);

        engine.return_symbol(memory).unwrap();
        assert!(engine.sweep(1).is_ok());
    }

    #[test]
    fn returning_unknown_symbol_is_an_error() {
        let mut engine = engine();
        let stray = SymbolMemory::new("TSLA", engine.config(), 2, Box::new(FlatIndex::new()));
        assert!(matches!(
            engine.return_symbol(stray),
            Err(MemoryError::Invariant(_))
        ));
    }

    #[test]
    fn sweep_day_must_advance() {
        let mut engine = engine();
        engine.sweep(3).unwrap();
        assert!(matches!(engine.sweep(3), Err(MemoryError::Invariant(_))));
        assert_eq!(engine.last_swept_day(), Some(3));
    }

    #[test]
    fn restore_rejects_other_dimensions_and_versions() {
        let mut engine = engine();
        engine.insert("AAPL", Tier::Short, "x", vec![1.0, 0.0], 0).unwrap();
        let blob = engine.snapshot().unwrap();

        let mut wide = MemoryEngine::new(MemoryConfig::default(), 3).unwrap();
        assert!(matches!(wide.restore(&blob), Err(MemoryError::Config(_))));

        let mut value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        value["version"] = serde_json::json!(99);
        let bumped = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            engine.restore(&bumped),
            Err(MemoryError::SnapshotVersion(99))
        ));
        // Failed restores leave state alone.
        assert_eq!(engine.symbol("AAPL").unwrap().len(Tier::Short), 1);
    }

    #[test]
    fn restore_rejects_other_importance_settings() {
        let mut engine = engine();
        engine.insert("AAPL", Tier::Short, "x", vec![1.0, 0.0], 0).unwrap();
        let blob = engine.snapshot().unwrap();

        let mut config = MemoryConfig::default();
        config.importance_update_step = 10.0;
        let mut stepped = MemoryEngine::new(config, 2).unwrap();
        assert!(matches!(stepped.restore(&blob), Err(MemoryError::Config(_))));
        assert!(stepped.symbol("AAPL").is_none());

        let mut config = MemoryConfig::default();
        config.importance_upper_bound = 120.0;
        let mut raised = MemoryEngine::new(config, 2).unwrap();
        assert!(matches!(raised.restore(&blob), Err(MemoryError::Config(_))));
    }

    #[test]
    fn failed_sweep_leaves_every_symbol_unswept() {
        let mut engine = engine();
        engine.insert("AAPL", Tier::Short, "x", vec![1.0, 0.0], 0).unwrap();
        engine.insert("MSFT", Tier::Short, "y", vec![0.0, 1.0], 0).unwrap();

        // MSFT alone has already been swept past day 3.
        let mut msft = engine.take_symbol("MSFT").unwrap();
        msft.sweep(5).unwrap();
        engine.return_symbol(msft).unwrap();

        let before = engine.symbol("AAPL").unwrap().snapshot();
        assert!(matches!(engine.sweep(3), Err(MemoryError::Invariant(_))));
        assert_eq!(engine.symbol("AAPL").unwrap().last_swept(), None);
        assert_eq!(engine.symbol("AAPL").unwrap().snapshot(), before);
        assert_eq!(engine.last_swept_day(), None);
    }
}
