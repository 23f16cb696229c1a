//! Exact k-nearest-neighbor ranking by Euclidean distance.

use crate::store::{EmbeddingStore, StoreError, StoredEmbedding};
use crate::types::{Embedding, EventId, MatchResult, PhotoId};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("query has {actual} dimensions, gallery vectors have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("query vector contains non-finite components")]
    InvalidQuery,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Strategy for ranking a gallery against a query embedding.
pub trait Matcher {
    /// The `k` closest gallery entries, ascending by distance, ties broken by
    /// photo id ascending.
    fn rank(
        &self,
        query: &Embedding,
        gallery: &[StoredEmbedding],
        k: usize,
    ) -> Result<Vec<MatchResult>, MatchError>;
}

/// Exact Euclidean matcher.
///
/// One distance computation per gallery entry; a bounded max-heap keeps the
/// current best `k`, so ranking is O(n log k) and never sorts the whole set.
pub struct EuclideanMatcher;

/// Heap entry ordered by `(distance, photo_id)`; the heap top is the worst kept.
struct Candidate<'a> {
    distance: f32,
    photo_id: &'a PhotoId,
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.photo_id.cmp(other.photo_id))
    }
}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

impl Matcher for EuclideanMatcher {
    fn rank(
        &self,
        query: &Embedding,
        gallery: &[StoredEmbedding],
        k: usize,
    ) -> Result<Vec<MatchResult>, MatchError> {
        if !query.is_finite() {
            return Err(MatchError::InvalidQuery);
        }
        if k == 0 || gallery.is_empty() {
            return Ok(Vec::new());
        }

        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(k + 1);
        for entry in gallery {
            if entry.embedding.dimension() != query.dimension() {
                return Err(MatchError::DimensionMismatch {
                    expected: entry.embedding.dimension(),
                    actual: query.dimension(),
                });
            }
            let candidate = Candidate {
                distance: query.euclidean_distance(&entry.embedding),
                photo_id: &entry.photo_id,
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| MatchResult { photo_id: c.photo_id.clone(), distance: c.distance })
            .collect())
    }
}

/// Rank the embeddings stored for `event` against `query`.
///
/// An event without embeddings yields `Ok(vec![])`, never an error.
pub fn find_matches(
    store: &dyn EmbeddingStore,
    matcher: &dyn Matcher,
    query: &Embedding,
    event: &EventId,
    k: usize,
) -> Result<Vec<MatchResult>, MatchError> {
    let gallery = store.query(event)?;
    let results = matcher.rank(query, &gallery, k)?;
    tracing::debug!(
        event = %event,
        gallery = gallery.len(),
        k,
        returned = results.len(),
        "ranked event gallery"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, values: &[f32]) -> StoredEmbedding {
        StoredEmbedding { photo_id: PhotoId::from(id), embedding: Embedding::new(values.to_vec()) }
    }

    fn ids(results: &[MatchResult]) -> Vec<&str> {
        results.iter().map(|r| r.photo_id.as_str()).collect()
    }

    #[test]
    fn test_concrete_scenario() {
        let gallery = vec![entry("p1", &[0.0, 0.0]), entry("p2", &[1.0, 0.0]), entry("p3", &[3.0, 4.0])];
        let results = EuclideanMatcher.rank(&Embedding::new(vec![0.0, 0.0]), &gallery, 2).unwrap();
        assert_eq!(
            results,
            vec![
                MatchResult { photo_id: "p1".into(), distance: 0.0 },
                MatchResult { photo_id: "p2".into(), distance: 1.0 },
            ]
        );
    }

    #[test]
    fn test_returns_min_k_len() {
        let gallery = vec![entry("a", &[1.0]), entry("b", &[2.0]), entry("c", &[3.0])];
        let query = Embedding::new(vec![0.0]);
        for k in 0..6 {
            let results = EuclideanMatcher.rank(&query, &gallery, k).unwrap();
            assert_eq!(results.len(), k.min(gallery.len()), "k = {k}");
        }
    }

    #[test]
    fn test_results_ascending() {
        let gallery: Vec<_> = (0..50)
            .map(|i| {
                let v = ((i * 37) % 50) as f32;
                entry(&format!("p{i:02}"), &[v, -v / 2.0])
            })
            .collect();
        let results = EuclideanMatcher.rank(&Embedding::new(vec![10.0, 3.0]), &gallery, 20).unwrap();
        assert_eq!(results.len(), 20);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_ties_broken_by_photo_id() {
        let gallery = vec![
            entry("p9", &[1.0, 0.0]),
            entry("p3", &[0.0, 1.0]),
            entry("p5", &[-1.0, 0.0]),
            entry("p1", &[0.0, -1.0]),
        ];
        let query = Embedding::new(vec![0.0, 0.0]);
        let results = EuclideanMatcher.rank(&query, &gallery, 3).unwrap();
        assert_eq!(ids(&results), vec!["p1", "p3", "p5"]);

        // Deterministic regardless of gallery order.
        let mut reversed = gallery.clone();
        reversed.reverse();
        assert_eq!(EuclideanMatcher.rank(&query, &reversed, 3).unwrap(), results);
    }

    #[test]
    fn test_exact_match_first_with_zero_distance() {
        let gallery = vec![entry("x", &[0.2, 0.9]), entry("y", &[0.6, 0.8]), entry("z", &[-0.3, 0.1])];
        let results = EuclideanMatcher.rank(&Embedding::new(vec![0.6, 0.8]), &gallery, 3).unwrap();
        assert_eq!(results[0].photo_id.as_str(), "y");
        assert_eq!(results[0].distance, 0.0);
    }

    #[test]
    fn test_empty_gallery() {
        let results = EuclideanMatcher.rank(&Embedding::new(vec![1.0]), &[], 8).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let gallery = vec![entry("a", &[1.0, 2.0, 3.0])];
        let err = EuclideanMatcher.rank(&Embedding::new(vec![1.0, 2.0]), &gallery, 1).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_non_finite_query_rejected() {
        let gallery = vec![entry("a", &[1.0])];
        let err = EuclideanMatcher.rank(&Embedding::new(vec![f32::NAN]), &gallery, 1).unwrap_err();
        assert_eq!(err, MatchError::InvalidQuery);
    }
}
