use std::collections::BTreeMap;

use finmem_models::{Day, MemoryId, MemoryRecord, Tier, TierPolicy};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::index::IndexPayload;

/// Record arena for one (symbol, tier) partition.
///
/// Holds the records themselves and the id counter. The similarity index
/// lives next to it in [`crate::SymbolMemory`] and is kept in step there.
#[derive(Debug, Clone)]
pub struct MemoryTier {
    tier: Tier,
    policy: TierPolicy,
    records: BTreeMap<MemoryId, MemoryRecord>,
    next_id: u64,
}

/// Serialized form of a tier. `next_id` is kept so ids are never reused
/// after a restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierSnapshot {
    pub tier: Tier,
    pub next_id: u64,
    pub records: Vec<MemoryRecord>,
}

impl MemoryTier {
    pub fn new(tier: Tier, policy: TierPolicy) -> Self {
        Self {
            tier,
            policy,
            records: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: MemoryId) -> Option<&MemoryRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: MemoryId) -> Option<&mut MemoryRecord> {
        self.records.get_mut(&id)
    }

    /// Records in ascending id order.
    pub fn records(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.records.values()
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut MemoryRecord> {
        self.records.values_mut()
    }

    pub fn ids(&self) -> Vec<MemoryId> {
        self.records.keys().copied().collect()
    }

    pub(crate) fn allocate_id(&mut self) -> MemoryId {
        let id = MemoryId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, record: MemoryRecord) -> Result<(), MemoryError> {
        if self.records.contains_key(&record.id) {
            return Err(MemoryError::DuplicateId {
                symbol: record.symbol,
                tier: self.tier,
                id: record.id,
            });
        }
        if record.id.0 >= self.next_id {
            self.next_id = record.id.0 + 1;
        }
        self.records.insert(record.id, record);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: MemoryId) -> Option<MemoryRecord> {
        self.records.remove(&id)
    }

    /// Recency factor of a record as seen on `day`.
    pub fn recency_of(&self, record: &MemoryRecord, day: Day) -> f64 {
        self.policy
            .recency(day.saturating_sub(record.last_accessed_at))
    }

    /// Ids of the `k` records with the highest recency + normalized
    /// importance, ignoring similarity. Ties go to the lower id.
    pub fn top_by_recency_importance(&self, day: Day, upper: f64, k: usize) -> Vec<MemoryId> {
        let mut scored: Vec<(MemoryId, f64)> = self
            .records
            .values()
            .map(|r| (r.id, self.recency_of(r, day) + r.importance / upper))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }

    pub fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            tier: self.tier,
            next_id: self.next_id,
            records: self.records.values().cloned().collect(),
        }
    }

    /// Rebuild a tier from a snapshot, checking every record against the
    /// partition it claims to belong to.
    pub fn from_snapshot(
        snapshot: TierSnapshot,
        policy: TierPolicy,
        symbol: &str,
        upper: f64,
    ) -> Result<Self, MemoryError> {
        let mut tier = Self::new(snapshot.tier, policy);
        for record in snapshot.records {
            if record.tier != snapshot.tier || record.symbol != symbol {
                return Err(MemoryError::Invariant(format!(
                    "record {} filed under {symbol}/{} claims {}/{}",
                    record.id, snapshot.tier, record.symbol, record.tier
                )));
            }
            check_record(&record, upper)?;
            tier.insert(record)?;
        }
        if snapshot.next_id < tier.next_id {
            return Err(MemoryError::Invariant(format!(
                "{symbol}/{} id counter {} is behind its records",
                snapshot.tier, snapshot.next_id
            )));
        }
        tier.next_id = snapshot.next_id;
        Ok(tier)
    }
}

pub(crate) fn payload_of(record: &MemoryRecord) -> IndexPayload {
    IndexPayload {
        importance: record.importance,
        last_accessed_at: record.last_accessed_at,
    }
}

/// Importance bounds and access ordering every stored record must satisfy.
pub(crate) fn check_record(record: &MemoryRecord, upper: f64) -> Result<(), MemoryError> {
    check_importance(record.importance, upper)?;
    if record.last_accessed_at < record.created_at {
        return Err(MemoryError::Invariant(format!(
            "record {} last accessed on day {} before creation on day {}",
            record.id, record.last_accessed_at, record.created_at
        )));
    }
    Ok(())
}

pub(crate) fn check_importance(importance: f64, upper: f64) -> Result<(), MemoryError> {
    if !importance.is_finite() || importance < 0.0 || importance > upper {
        return Err(MemoryError::Invariant(format!(
            "importance {importance} outside [0, {upper}]"
        )));
    }
    Ok(())
}
