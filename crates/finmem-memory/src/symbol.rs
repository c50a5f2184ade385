use std::collections::BTreeSet;
use std::ops::AddAssign;

use finmem_models::{Day, MemoryConfig, MemoryId, MemoryRecord, ScoreWeights, Tier};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MemoryError;
use crate::index::{cosine_similarity, Partition, VectorIndex};
use crate::tier::{check_importance, payload_of, MemoryTier, TierSnapshot};

/// A retrieved record with the score components that ranked it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f64,
    pub similarity: f64,
    pub recency: f64,
}

/// Counts of what one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub decayed: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub removed: usize,
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.decayed += other.decayed;
        self.promoted += other.promoted;
        self.demoted += other.demoted;
        self.removed += other.removed;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub last_swept: Option<Day>,
    pub tiers: Vec<TierSnapshot>,
}

/// The four tiers of one symbol plus the index partitions that mirror them.
///
/// A `SymbolMemory` is self-contained so a worker task can own it outright
/// for the duration of a decision cycle.
pub struct SymbolMemory {
    symbol: String,
    tiers: [MemoryTier; 4],
    index: Box<dyn VectorIndex>,
    upper: f64,
    step: f64,
    weights: ScoreWeights,
    dimensions: usize,
    last_swept: Option<Day>,
}

fn slot(tier: Tier) -> usize {
    match tier {
        Tier::Short => 0,
        Tier::Mid => 1,
        Tier::Long => 2,
        Tier::Reflection => 3,
    }
}

impl SymbolMemory {
    pub fn new(
        symbol: &str,
        config: &MemoryConfig,
        dimensions: usize,
        index: Box<dyn VectorIndex>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            tiers: Tier::ALL.map(|tier| MemoryTier::new(tier, config.policy(tier).clone())),
            index,
            upper: config.importance_upper_bound,
            step: config.importance_update_step,
            weights: config.weights,
            dimensions,
            last_swept: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn tier(&self, tier: Tier) -> &MemoryTier {
        &self.tiers[slot(tier)]
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut MemoryTier {
        &mut self.tiers[slot(tier)]
    }

    pub fn get(&self, tier: Tier, id: MemoryId) -> Option<&MemoryRecord> {
        self.tier(tier).get(id)
    }

    pub fn len(&self, tier: Tier) -> usize {
        self.tier(tier).len()
    }

    pub fn total_len(&self) -> usize {
        self.tiers.iter().map(MemoryTier::len).sum()
    }

    pub fn last_swept(&self) -> Option<Day> {
        self.last_swept
    }

    fn partition(&self, tier: Tier) -> Partition {
        Partition::new(&self.symbol, tier)
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<(), MemoryError> {
        if embedding.len() != self.dimensions {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    /// Store a new record. Returns `Ok(None)` when a reflection is rejected
    /// as a near-duplicate of one already stored.
    pub fn insert(
        &mut self,
        tier: Tier,
        text: &str,
        embedding: Vec<f32>,
        day: Day,
    ) -> Result<Option<MemoryId>, MemoryError> {
        self.check_dimensions(&embedding)?;
        let partition = self.partition(tier);

        if let Some(threshold) = self.tier(tier).policy().similarity_threshold {
            if let Some(nearest) = self.index.search(&partition, &embedding, 1).first() {
                if nearest.similarity >= threshold {
                    debug!(
                        symbol = %self.symbol,
                        %tier,
                        nearest = %nearest.id,
                        similarity = nearest.similarity,
                        "Rejected near-duplicate memory"
                    );
                    return Ok(None);
                }
            }
        }

        let importance = self.tier(tier).policy().importance_init;
        check_importance(importance, self.upper)?;

        let symbol = self.symbol.clone();
        let arena = self.tier_mut(tier);
        let id = arena.allocate_id();
        let record = MemoryRecord {
            id,
            text: text.to_string(),
            embedding,
            symbol,
            tier,
            importance,
            created_at: day,
            last_accessed_at: day,
        };
        self.index
            .insert(&partition, id, &record.embedding, payload_of(&record))?;
        self.tier_mut(tier).insert(record)?;
        Ok(Some(id))
    }

    /// Top `k` records of a tier by composite score.
    ///
    /// Returned records have `last_accessed_at` bumped to `day`; importance is
    /// left untouched.
    pub fn retrieve(
        &mut self,
        tier: Tier,
        query: &[f32],
        day: Day,
        k: usize,
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        self.check_dimensions(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let partition = self.partition(tier);

        let mut candidates: BTreeSet<MemoryId> = self
            .index
            .search(&partition, query, k)
            .into_iter()
            .map(|m| m.id)
            .collect();
        candidates.extend(self.tier(tier).top_by_recency_importance(day, self.upper, k));

        let arena = self.tier(tier);
        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .filter_map(|id| arena.get(id))
            .map(|record| {
                let similarity = cosine_similarity(query, &record.embedding);
                let recency = arena.recency_of(record, day);
                let score = self.weights.similarity * similarity
                    + self.weights.recency * recency
                    + self.weights.importance * (record.importance / self.upper);
                ScoredMemory {
                    record: record.clone(),
                    score,
                    similarity,
                    recency,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        scored.truncate(k);

        for hit in &mut scored {
            let Some(record) = self.tiers[slot(tier)].get_mut(hit.record.id) else {
                continue;
            };
            record.last_accessed_at = record.last_accessed_at.max(day);
            hit.record.last_accessed_at = record.last_accessed_at;
            let payload = payload_of(record);
            self.index.update_payload(&partition, hit.record.id, payload);
        }

        Ok(scored)
    }

    /// Raise the importance of cited records by the update step, capped at the
    /// upper bound. Unknown ids are skipped. Returns how many were reinforced.
    pub fn reinforce(
        &mut self,
        tier: Tier,
        ids: &[MemoryId],
        day: Day,
    ) -> Result<usize, MemoryError> {
        let partition = self.partition(tier);
        let (upper, step) = (self.upper, self.step);
        let mut reinforced = 0;
        for id in ids {
            let Some(record) = self.tiers[slot(tier)].get_mut(*id) else {
                debug!(symbol = %self.symbol, %tier, %id, "Skipping reinforce of unknown memory");
                continue;
            };
            let importance = (record.importance + step).min(upper);
            check_importance(importance, upper)?;
            record.importance = importance;
            record.last_accessed_at = record.last_accessed_at.max(day);
            let payload = payload_of(record);
            self.index.update_payload(&partition, *id, payload);
            reinforced += 1;
        }
        Ok(reinforced)
    }

    /// Check that [`SymbolMemory::sweep`] would accept `day` without changing
    /// anything.
    pub fn check_sweep(&self, day: Day) -> Result<(), MemoryError> {
        self.decayed(day).map(|_| ())
    }

    /// Day ordering and every decayed importance, validated up front.
    fn decayed(&self, day: Day) -> Result<Vec<(Tier, MemoryId, f64)>, MemoryError> {
        if let Some(last) = self.last_swept {
            if day <= last {
                return Err(MemoryError::Invariant(format!(
                    "{} already swept day {last}, refusing day {day}",
                    self.symbol
                )));
            }
        }

        let mut decayed = Vec::new();
        for arena in &self.tiers {
            let factor = arena.policy().decay_importance_factor;
            for record in arena.records() {
                let importance = record.importance * factor;
                check_importance(importance, self.upper)?;
                decayed.push((arena.tier(), record.id, importance));
            }
        }
        Ok(decayed)
    }

    /// Daily maintenance: decay, then one-hop promotion/demotion, then cleanup
    /// under each record's current tier policy.
    pub fn sweep(&mut self, day: Day) -> Result<SweepReport, MemoryError> {
        let decayed = self.decayed(day)?;

        let mut report = SweepReport {
            decayed: decayed.len(),
            ..SweepReport::default()
        };
        for (tier, id, importance) in decayed {
            if let Some(record) = self.tiers[slot(tier)].get_mut(id) {
                record.importance = importance;
            }
        }

        // Decide every move against the post-decay state, then apply.
        let mut moves: Vec<(Tier, MemoryId, Tier)> = Vec::new();
        for tier in Tier::LADDER {
            let arena = self.tier(tier);
            let policy = arena.policy();
            for record in arena.records() {
                let up = tier
                    .up()
                    .zip(policy.jump_upper_threshold)
                    .filter(|(_, threshold)| record.importance >= *threshold);
                let down = tier
                    .down()
                    .zip(policy.jump_lower_threshold)
                    .filter(|(_, threshold)| record.importance < *threshold);
                if let Some((dest, _)) = up {
                    moves.push((tier, record.id, dest));
                } else if let Some((dest, _)) = down {
                    moves.push((tier, record.id, dest));
                }
            }
        }
        for (from, id, to) in moves {
            self.move_record(from, id, to, day)?;
            if to > from {
                report.promoted += 1;
            } else {
                report.demoted += 1;
            }
        }

        for tier in Tier::ALL {
            let partition = self.partition(tier);
            let arena = self.tier(tier);
            let policy = arena.policy();
            let expired: Vec<MemoryId> = arena
                .records()
                .filter(|r| {
                    r.importance < policy.clean_up_importance_threshold
                        || arena.recency_of(r, day) < policy.clean_up_recency_threshold
                })
                .map(|r| r.id)
                .collect();
            for id in expired {
                self.tier_mut(tier).remove(id);
                self.index.delete(&partition, id);
                report.removed += 1;
            }

            for record in self.tiers[slot(tier)].records() {
                self.index
                    .update_payload(&partition, record.id, payload_of(record));
            }
        }

        self.last_swept = Some(day);
        debug!(
            symbol = %self.symbol,
            day,
            decayed = report.decayed,
            promoted = report.promoted,
            demoted = report.demoted,
            removed = report.removed,
            "Swept symbol memory"
        );
        Ok(report)
    }

    /// Move a record into a neighbouring tier under a fresh id, re-initialising
    /// its importance and recency for the destination.
    fn move_record(
        &mut self,
        from: Tier,
        id: MemoryId,
        to: Tier,
        day: Day,
    ) -> Result<(), MemoryError> {
        let importance = self.tier(to).policy().importance_init;
        check_importance(importance, self.upper)?;

        let Some(mut record) = self.tier_mut(from).remove(id) else {
            return Err(MemoryError::Invariant(format!(
                "{}/{from} lost record {id} mid-sweep",
                self.symbol
            )));
        };
        let (source, dest) = (self.partition(from), self.partition(to));
        self.index.delete(&source, id);

        let new_id = self.tier_mut(to).allocate_id();
        record.id = new_id;
        record.tier = to;
        record.importance = importance;
        record.last_accessed_at = day.max(record.created_at);
        self.index
            .insert(&dest, new_id, &record.embedding, payload_of(&record))?;
        self.tier_mut(to).insert(record)?;
        debug!(symbol = %self.symbol, %from, %to, old_id = %id, %new_id, "Moved memory");
        Ok(())
    }

    pub fn snapshot(&self) -> SymbolSnapshot {
        SymbolSnapshot {
            symbol: self.symbol.clone(),
            last_swept: self.last_swept,
            tiers: self.tiers.iter().map(MemoryTier::snapshot).collect(),
        }
    }

    /// Rebuild from a snapshot, re-inserting vectors into `index` in id order
    /// so the index ends up identical to the one that was saved.
    pub fn from_snapshot(
        snapshot: SymbolSnapshot,
        config: &MemoryConfig,
        dimensions: usize,
        index: Box<dyn VectorIndex>,
    ) -> Result<Self, MemoryError> {
        let mut memory = Self::new(&snapshot.symbol, config, dimensions, index);
        memory.last_swept = snapshot.last_swept;

        let mut seen = BTreeSet::new();
        for tier_snapshot in snapshot.tiers {
            let tier = tier_snapshot.tier;
            if !seen.insert(tier) {
                return Err(MemoryError::Invariant(format!(
                    "{} snapshot lists tier {tier} twice",
                    snapshot.symbol
                )));
            }
            let arena = MemoryTier::from_snapshot(
                tier_snapshot,
                config.policy(tier).clone(),
                &snapshot.symbol,
                config.importance_upper_bound,
            )?;
            let partition = memory.partition(tier);
            for record in arena.records() {
                memory.check_dimensions(&record.embedding)?;
                memory
                    .index
                    .insert(&partition, record.id, &record.embedding, payload_of(record))?;
            }
            memory.tiers[slot(tier)] = arena;
        }
        Ok(memory)
    }
}

impl std::fmt::Debug for SymbolMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolMemory")
            .field("symbol", &self.symbol)
            .field("short", &self.len(Tier::Short))
            .field("mid", &self.len(Tier::Mid))
            .field("long", &self.len(Tier::Long))
            .field("reflection", &self.len(Tier::Reflection))
            .field("last_swept", &self.last_swept)
            .finish()
    }
}
