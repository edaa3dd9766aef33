//! Exact k-nearest-neighbour index over per-node vectors
//!
//! Vectors live beside the graph (not in property maps) and share its
//! snapshot and persistence boundary. Search is an exhaustive scan, so the
//! result is exact and ordered by non-decreasing distance.

use crate::graph::NodeId;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// Vector index errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Empty vector")]
    Empty,

    #[error("Vector component {index} is not finite")]
    NonFinite { index: usize },
}

pub type VectorResult<T> = Result<T, VectorError>;

/// Distance metric for vector search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// L2 distance
    #[default]
    Euclidean,
    /// 1 - cosine similarity
    Cosine,
    /// 1 - dot product
    InnerProduct,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            DistanceMetric::Cosine => {
                let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a <= 0.0 || norm_b <= 0.0 {
                    return 1.0;
                }
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
            DistanceMetric::InnerProduct => 1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    /// Fixed by the first inserted vector, cleared when the index empties
    dimensions: Option<usize>,
    metric: DistanceMetric,
    vectors: BTreeMap<NodeId, Vec<f32>>,
}

impl VectorIndex {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            dimensions: None,
            metric,
            vectors: BTreeMap::new(),
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Validate a vector against this index without storing it
    pub fn check(&self, vector: &[f32]) -> VectorResult<()> {
        if vector.is_empty() {
            return Err(VectorError::Empty);
        }
        if let Some(index) = vector.iter().position(|x| !x.is_finite()) {
            return Err(VectorError::NonFinite { index });
        }
        match self.dimensions {
            Some(expected) if expected != vector.len() => Err(VectorError::DimensionMismatch {
                expected,
                got: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Insert or replace the vector of a node
    pub fn put(&mut self, node_id: NodeId, vector: Vec<f32>) -> VectorResult<()> {
        // A node replacing the only stored vector may change the dimension
        let previous = self.dimensions;
        if self.vectors.len() == 1 && self.vectors.contains_key(&node_id) {
            self.dimensions = None;
        }
        if let Err(e) = self.check(&vector) {
            self.dimensions = previous;
            return Err(e);
        }
        self.dimensions = Some(vector.len());
        self.vectors.insert(node_id, vector);
        Ok(())
    }

    pub fn get(&self, node_id: NodeId) -> Option<&[f32]> {
        self.vectors.get(&node_id).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, node_id: NodeId) -> Option<Vec<f32>> {
        let removed = self.vectors.remove(&node_id);
        if self.vectors.is_empty() {
            self.dimensions = None;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[f32])> {
        self.vectors.iter().map(|(id, v)| (*id, v.as_slice()))
    }

    /// The `k` nearest nodes to `query`, closest first. Ties are broken by
    /// node id so results are reproducible.
    pub fn search(&self, query: &[f32], k: usize) -> VectorResult<Vec<(NodeId, f32)>> {
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        self.check(query)?;

        let metric = self.metric;
        let mut scored: Vec<(NodeId, f32)> = self
            .vectors
            .par_iter()
            .map(|(id, vector)| (*id, metric.distance(query, vector)))
            .collect();

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VectorIndex {
        let mut index = VectorIndex::new(DistanceMetric::Euclidean);
        index.put(NodeId::new(1), vec![1.0, 0.0, 0.0]).unwrap();
        index.put(NodeId::new(2), vec![0.0, 1.0, 0.0]).unwrap();
        index.put(NodeId::new(3), vec![0.9, 0.1, 0.0]).unwrap();
        index
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = sample();
        let results = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, NodeId::new(1));
        assert_eq!(results[1].0, NodeId::new(3));
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_search_respects_k() {
        let index = sample();
        assert_eq!(index.search(&[0.0, 1.0, 0.0], 1).unwrap()[0].0, NodeId::new(2));
        assert!(index.search(&[0.0, 1.0, 0.0], 0).unwrap().is_empty());
        assert_eq!(index.search(&[0.0, 1.0, 0.0], 10).unwrap().len(), 3);
    }

    #[test]
    fn test_dimension_is_enforced() {
        let mut index = sample();
        let err = index.put(NodeId::new(4), vec![1.0, 2.0]).unwrap_err();
        assert_eq!(err, VectorError::DimensionMismatch { expected: 3, got: 2 });
        assert!(index.search(&[1.0], 1).is_err());
        assert!(index.put(NodeId::new(5), vec![f32::NAN, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_remove_resets_dimension_when_empty() {
        let mut index = VectorIndex::new(DistanceMetric::Cosine);
        index.put(NodeId::new(1), vec![1.0, 1.0]).unwrap();
        assert!(index.remove(NodeId::new(1)).is_some());
        assert_eq!(index.dimensions(), None);
        index.put(NodeId::new(2), vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(index.dimensions(), Some(3));
    }
}
