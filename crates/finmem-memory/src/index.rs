use std::collections::{BTreeMap, HashMap};

use finmem_models::{Day, MemoryId, Tier};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// A (symbol, tier) slice of the index. Searches never cross partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    pub symbol: String,
    pub tier: Tier,
}

impl Partition {
    pub fn new(symbol: &str, tier: Tier) -> Self {
        Self {
            symbol: symbol.to_string(),
            tier,
        }
    }
}

/// Metadata stored next to each vector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IndexPayload {
    pub importance: f64,
    pub last_accessed_at: Day,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: MemoryId,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f64,
    pub payload: IndexPayload,
}

/// Nearest-neighbour store used by the memory tiers.
///
/// Implementations must return matches ordered by descending similarity with
/// ties broken by ascending id, so retrieval stays deterministic.
pub trait VectorIndex: Send {
    fn insert(
        &mut self,
        partition: &Partition,
        id: MemoryId,
        vector: &[f32],
        payload: IndexPayload,
    ) -> Result<(), MemoryError>;

    fn search(&self, partition: &Partition, query: &[f32], k: usize) -> Vec<IndexMatch>;

    /// Returns false when the id was not present.
    fn delete(&mut self, partition: &Partition, id: MemoryId) -> bool;

    /// Returns false when the id was not present.
    fn update_payload(&mut self, partition: &Partition, id: MemoryId, payload: IndexPayload)
        -> bool;

    fn len(&self, partition: &Partition) -> usize;
}

/// Cosine similarity of two vectors. Zero-norm inputs are treated as
/// dissimilar to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Exact brute-force index. Memory tiers hold at most a few thousand records
/// per symbol, so a linear scan is fast enough and fully deterministic.
#[derive(Debug, Default)]
pub struct FlatIndex {
    partitions: HashMap<Partition, BTreeMap<MemoryId, (Vec<f32>, IndexPayload)>>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorIndex for FlatIndex {
    fn insert(
        &mut self,
        partition: &Partition,
        id: MemoryId,
        vector: &[f32],
        payload: IndexPayload,
    ) -> Result<(), MemoryError> {
        let entries = self.partitions.entry(partition.clone()).or_default();
        if entries.contains_key(&id) {
            return Err(MemoryError::DuplicateId {
                symbol: partition.symbol.clone(),
                tier: partition.tier,
                id,
            });
        }
        entries.insert(id, (vector.to_vec(), payload));
        Ok(())
    }

    fn search(&self, partition: &Partition, query: &[f32], k: usize) -> Vec<IndexMatch> {
        let Some(entries) = self.partitions.get(partition) else {
            return Vec::new();
        };

        let mut matches: Vec<IndexMatch> = entries
            .iter()
            .map(|(id, (vector, payload))| IndexMatch {
                id: *id,
                similarity: cosine_similarity(query, vector),
                payload: *payload,
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(k);
        matches
    }

    fn delete(&mut self, partition: &Partition, id: MemoryId) -> bool {
        self.partitions
            .get_mut(partition)
            .map(|entries| entries.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn update_payload(
        &mut self,
        partition: &Partition,
        id: MemoryId,
        payload: IndexPayload,
    ) -> bool {
        match self
            .partitions
            .get_mut(partition)
            .and_then(|entries| entries.get_mut(&id))
        {
            Some(entry) => {
                entry.1 = payload;
                true
            }
            None => false,
        }
    }

    fn len(&self, partition: &Partition) -> usize {
        self.partitions.get(partition).map_or(0, BTreeMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> IndexPayload {
        IndexPayload {
            importance: 50.0,
            last_accessed_at: 0,
        }
    }

    #[test]
    fn cosine_of_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn search_orders_by_similarity_then_id() {
        let mut index = FlatIndex::new();
        let part = Partition::new("AAPL", Tier::Short);
        index.insert(&part, MemoryId(2), &[1.0, 0.0], payload()).unwrap();
        index.insert(&part, MemoryId(1), &[1.0, 0.0], payload()).unwrap();
        index.insert(&part, MemoryId(3), &[0.0, 1.0], payload()).unwrap();

        let matches = index.search(&part, &[1.0, 0.0], 2);
        let ids: Vec<MemoryId> = matches.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![MemoryId(1), MemoryId(2)]);
    }

    #[test]
    fn partitions_are_isolated() {
        let mut index = FlatIndex::new();
        let short = Partition::new("AAPL", Tier::Short);
        let mid = Partition::new("AAPL", Tier::Mid);
        let other = Partition::new("TSLA", Tier::Short);
        index.insert(&short, MemoryId(0), &[1.0, 0.0], payload()).unwrap();

        assert!(index.search(&mid, &[1.0, 0.0], 5).is_empty());
        assert!(index.search(&other, &[1.0, 0.0], 5).is_empty());
        assert_eq!(index.len(&short), 1);
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut index = FlatIndex::new();
        let part = Partition::new("AAPL", Tier::Long);
        index.insert(&part, MemoryId(0), &[1.0], payload()).unwrap();
        let err = index.insert(&part, MemoryId(0), &[1.0], payload()).unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateId { .. }));
    }

    #[test]
    fn delete_and_update_payload() {
        let mut index = FlatIndex::new();
        let part = Partition::new("AAPL", Tier::Mid);
        index.insert(&part, MemoryId(4), &[1.0], payload()).unwrap();

        let updated = IndexPayload {
            importance: 70.0,
            last_accessed_at: 3,
        };
        assert!(index.update_payload(&part, MemoryId(4), updated));
        assert_eq!(index.search(&part, &[1.0], 1)[0].payload, updated);

        assert!(index.delete(&part, MemoryId(4)));
        assert!(!index.delete(&part, MemoryId(4)));
        assert!(!index.update_payload(&part, MemoryId(4), updated));
        assert_eq!(index.len(&part), 0);
    }
}
