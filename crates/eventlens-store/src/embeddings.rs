//! In-memory embedding store with per-event copy-on-write shards.
//!
//! Readers take a shard's read lock just long enough to clone an `Arc` of the
//! current map, then rank without holding any lock. Writers to one event are
//! serialized by that shard's write lock and clone the map only while an older
//! snapshot is still held by a reader. Events never share a shard.

use eventlens_core::store::{validate_vector, EmbeddingStore, StoreError, StoredEmbedding};
use eventlens_core::types::{Embedding, EventId, PhotoId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

type Snapshot = Arc<BTreeMap<PhotoId, Embedding>>;

#[derive(Default)]
struct Shard {
    vectors: RwLock<Snapshot>,
}

#[derive(Default)]
pub struct MemoryEmbeddingStore {
    shards: RwLock<HashMap<EventId, Arc<Shard>>>,
    /// Owning event of every stored photo, so a photo lives in one event only.
    owners: RwLock<HashMap<PhotoId, EventId>>,
}

fn poisoned(what: &str) -> StoreError {
    StoreError::Unavailable(format!("{what} lock poisoned"))
}

impl MemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-load persisted embeddings, e.g. at daemon startup. Rows the store
    /// rejects are skipped with a warning; returns how many were loaded.
    pub fn hydrate<I>(&self, rows: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (EventId, PhotoId, Embedding)>,
    {
        let mut count = 0;
        for (event, photo, embedding) in rows {
            match self.put(&event, &photo, embedding) {
                Ok(()) => count += 1,
                Err(e @ StoreError::Unavailable(_)) => return Err(e),
                Err(e) => tracing::warn!(event = %event, photo = %photo, error = %e, "skipping stored embedding"),
            }
        }
        Ok(count)
    }

    /// Events that currently hold at least one vector.
    pub fn events(&self) -> Result<Vec<EventId>, StoreError> {
        let shards = self.shards.read().map_err(|_| poisoned("shard registry"))?;
        let mut events = Vec::new();
        for (id, shard) in shards.iter() {
            let snapshot = shard.vectors.read().map_err(|_| poisoned("shard"))?;
            if !snapshot.is_empty() {
                events.push(id.clone());
            }
        }
        events.sort();
        Ok(events)
    }

    /// Total number of vectors across all events.
    pub fn total(&self) -> Result<usize, StoreError> {
        Ok(self.owners.read().map_err(|_| poisoned("owner index"))?.len())
    }

    fn shard(&self, event: &EventId) -> Result<Option<Arc<Shard>>, StoreError> {
        let shards = self.shards.read().map_err(|_| poisoned("shard registry"))?;
        Ok(shards.get(event).cloned())
    }

    fn shard_or_create(&self, event: &EventId) -> Result<Arc<Shard>, StoreError> {
        if let Some(shard) = self.shard(event)? {
            return Ok(shard);
        }
        let mut shards = self.shards.write().map_err(|_| poisoned("shard registry"))?;
        Ok(Arc::clone(shards.entry(event.clone()).or_default()))
    }

    /// Move a photo to another event. The owner index stays locked so that
    /// the vector leaves the old event before it appears in the new one.
    fn relocate(
        &self,
        from: &EventId,
        to: &EventId,
        shard: &Shard,
        photo: &PhotoId,
        embedding: Embedding,
    ) -> Result<(), StoreError> {
        let mut owners = self.owners.write().map_err(|_| poisoned("owner index"))?;
        let mut removed = None;
        if let Some(old) = self.shard(from)? {
            let vector = {
                let mut guard = old.vectors.write().map_err(|_| poisoned("shard"))?;
                Arc::make_mut(&mut guard).remove(photo)
            };
            removed = vector.map(|vector| (old, vector));
        }

        if let Err(e) = insert_into(shard, to, photo, embedding) {
            if let Some((old, vector)) = removed {
                let mut guard = old.vectors.write().map_err(|_| poisoned("shard"))?;
                Arc::make_mut(&mut guard).insert(photo.clone(), vector);
            }
            return Err(e);
        }
        owners.insert(photo.clone(), to.clone());
        tracing::debug!(photo = %photo, from = %from, to = %to, "embedding moved between events");
        Ok(())
    }

    fn snapshot(&self, event: &EventId) -> Result<Option<Snapshot>, StoreError> {
        match self.shard(event)? {
            Some(shard) => {
                let guard = shard.vectors.read().map_err(|_| poisoned("shard"))?;
                Ok(Some(Arc::clone(&guard)))
            }
            None => Ok(None),
        }
    }
}

/// Insert under the shard's write lock. All vectors of one event share a
/// dimension; the photo's own previous vector does not count.
fn insert_into(shard: &Shard, event: &EventId, photo: &PhotoId, embedding: Embedding) -> Result<(), StoreError> {
    let mut guard = shard.vectors.write().map_err(|_| poisoned("shard"))?;
    if let Some((_, existing)) = guard.iter().find(|(id, _)| *id != photo) {
        if existing.dimension() != embedding.dimension() {
            return Err(StoreError::DimensionMismatch {
                event: event.clone(),
                expected: existing.dimension(),
                actual: embedding.dimension(),
            });
        }
    }
    Arc::make_mut(&mut guard).insert(photo.clone(), embedding);
    Ok(())
}

impl EmbeddingStore for MemoryEmbeddingStore {
    fn put(&self, event: &EventId, photo: &PhotoId, embedding: Embedding) -> Result<(), StoreError> {
        validate_vector(photo, &embedding)?;

        let shard = self.shard_or_create(event)?;
        let previous = self
            .owners
            .read()
            .map_err(|_| poisoned("owner index"))?
            .get(photo)
            .cloned();
        if let Some(previous) = previous.filter(|p| p != event) {
            return self.relocate(&previous, event, &shard, photo, embedding);
        }

        insert_into(&shard, event, photo, embedding)?;
        let mut owners = self.owners.write().map_err(|_| poisoned("owner index"))?;
        if let Some(previous) = owners.insert(photo.clone(), event.clone()) {
            // Only reachable when another writer moved the photo concurrently.
            if previous != *event {
                if let Some(old) = self.shard(&previous)? {
                    let mut guard = old.vectors.write().map_err(|_| poisoned("shard"))?;
                    Arc::make_mut(&mut guard).remove(photo);
                }
            }
        }
        Ok(())
    }

    fn query(&self, event: &EventId) -> Result<Vec<StoredEmbedding>, StoreError> {
        let Some(snapshot) = self.snapshot(event)? else {
            return Ok(Vec::new());
        };
        Ok(snapshot
            .iter()
            .map(|(photo_id, embedding)| StoredEmbedding {
                photo_id: photo_id.clone(),
                embedding: embedding.clone(),
            })
            .collect())
    }

    fn remove(&self, event: &EventId, photo: &PhotoId) -> Result<bool, StoreError> {
        let mut owners = self.owners.write().map_err(|_| poisoned("owner index"))?;
        let Some(shard) = self.shard(event)? else {
            return Ok(false);
        };
        let mut guard = shard.vectors.write().map_err(|_| poisoned("shard"))?;
        if !guard.contains_key(photo) {
            return Ok(false);
        }
        Arc::make_mut(&mut guard).remove(photo);
        owners.remove(photo);
        Ok(true)
    }

    fn len(&self, event: &EventId) -> Result<usize, StoreError> {
        Ok(self.snapshot(event)?.map_or(0, |s| s.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventlens_core::matcher::{find_matches, EuclideanMatcher};
    use std::thread;

    fn e(id: &str) -> EventId {
        EventId::from(id)
    }

    fn p(id: &str) -> PhotoId {
        PhotoId::from(id)
    }

    fn v(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_put_overwrites_previous_vector() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("wed"), &p("p1"), v(&[1.0, 1.0])).unwrap();
        store.put(&e("wed"), &p("p1"), v(&[2.0, 2.0])).unwrap();

        let rows = store.query(&e("wed")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].embedding.values, vec![2.0, 2.0]);
    }

    #[test]
    fn test_query_isolates_events() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("a"), &p("a1"), v(&[0.0])).unwrap();
        store.put(&e("a"), &p("a2"), v(&[1.0])).unwrap();
        store.put(&e("b"), &p("b1"), v(&[0.0])).unwrap();

        let a: Vec<_> = store.query(&e("a")).unwrap().into_iter().map(|r| r.photo_id).collect();
        assert_eq!(a, vec![p("a1"), p("a2")]);
        let b: Vec<_> = store.query(&e("b")).unwrap().into_iter().map(|r| r.photo_id).collect();
        assert_eq!(b, vec![p("b1")]);
        assert!(store.query(&e("c")).unwrap().is_empty());
    }

    #[test]
    fn test_photo_moves_between_events() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("a"), &p("x"), v(&[0.0])).unwrap();
        store.put(&e("b"), &p("x"), v(&[0.0])).unwrap();
        assert_eq!(store.len(&e("a")).unwrap(), 0);
        assert_eq!(store.len(&e("b")).unwrap(), 1);
        assert_eq!(store.total().unwrap(), 1);
        assert_eq!(store.events().unwrap(), vec![e("b")]);
    }

    #[test]
    fn test_rejected_move_keeps_photo_in_original_event() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("a"), &p("x"), v(&[0.0])).unwrap();
        store.put(&e("b"), &p("y"), v(&[0.0, 1.0])).unwrap();

        assert!(matches!(
            store.put(&e("b"), &p("x"), v(&[0.5])),
            Err(StoreError::DimensionMismatch { .. })
        ));
        let a: Vec<_> = store.query(&e("a")).unwrap().into_iter().map(|r| r.photo_id).collect();
        assert_eq!(a, vec![p("x")]);
        assert_eq!(store.len(&e("b")).unwrap(), 1);
        assert_eq!(store.total().unwrap(), 2);

        // Once the dimensions agree the move goes through.
        store.put(&e("b"), &p("x"), v(&[0.5, 0.5])).unwrap();
        assert_eq!(store.len(&e("a")).unwrap(), 0);
        assert_eq!(store.len(&e("b")).unwrap(), 2);
    }

    #[test]
    fn test_rejects_invalid_vectors() {
        let store = MemoryEmbeddingStore::new();
        assert!(matches!(
            store.put(&e("a"), &p("x"), v(&[])),
            Err(StoreError::InvalidVector { .. })
        ));
        assert!(matches!(
            store.put(&e("a"), &p("x"), v(&[f32::NAN, 0.0])),
            Err(StoreError::InvalidVector { .. })
        ));
        assert_eq!(store.len(&e("a")).unwrap(), 0);
    }

    #[test]
    fn test_rejects_dimension_mismatch_within_event() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("a"), &p("x"), v(&[0.0, 1.0])).unwrap();
        let err = store.put(&e("a"), &p("y"), v(&[0.0])).unwrap_err();
        assert_eq!(err, StoreError::DimensionMismatch { event: e("a"), expected: 2, actual: 1 });
        // Other events are free to use another dimension.
        store.put(&e("b"), &p("y"), v(&[0.0])).unwrap();
        // A sole vector may be overwritten with a new dimension.
        store.put(&e("a"), &p("x"), v(&[0.0, 1.0, 2.0])).unwrap();
    }

    #[test]
    fn test_remove() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("a"), &p("x"), v(&[0.0])).unwrap();
        assert!(store.remove(&e("a"), &p("x")).unwrap());
        assert!(!store.remove(&e("a"), &p("x")).unwrap());
        assert!(!store.remove(&e("zzz"), &p("x")).unwrap());
        assert_eq!(store.total().unwrap(), 0);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_writes() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("a"), &p("x"), v(&[0.0])).unwrap();
        let before = store.query(&e("a")).unwrap();
        store.put(&e("a"), &p("y"), v(&[1.0])).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(store.len(&e("a")).unwrap(), 2);
    }

    #[test]
    fn test_hydrate_and_events() {
        let store = MemoryEmbeddingStore::new();
        let n = store
            .hydrate(vec![
                (e("b"), p("1"), v(&[0.0])),
                (e("a"), p("2"), v(&[0.0])),
                (e("a"), p("3"), v(&[1.0])),
            ])
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(store.events().unwrap(), vec![e("a"), e("b")]);
    }

    #[test]
    fn test_hydrate_skips_rejected_rows() {
        let store = MemoryEmbeddingStore::new();
        let n = store
            .hydrate(vec![
                (e("a"), p("1"), v(&[0.0, 1.0])),
                (e("a"), p("2"), v(&[0.0])),
                (e("a"), p("3"), v(&[f32::INFINITY, 0.0])),
                (e("a"), p("4"), v(&[1.0, 0.0])),
            ])
            .unwrap();
        assert_eq!(n, 2);
        let ids: Vec<_> = store.query(&e("a")).unwrap().into_iter().map(|r| r.photo_id).collect();
        assert_eq!(ids, vec![p("1"), p("4")]);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let store = Arc::new(MemoryEmbeddingStore::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..250 {
                        let photo = p(&format!("w{w}-{i:03}"));
                        store.put(&e("party"), &photo, v(&[w as f32, i as f32])).unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let rows = store.query(&e("party")).unwrap();
                        assert!(rows.windows(2).all(|w| w[0].photo_id < w[1].photo_id));
                    }
                })
            })
            .collect();

        for h in writers.into_iter().chain(readers) {
            h.join().unwrap();
        }
        assert_eq!(store.len(&e("party")).unwrap(), 1000);
    }

    #[test]
    fn test_find_matches_on_empty_event_is_ok() {
        let store = MemoryEmbeddingStore::new();
        let results = find_matches(&store, &EuclideanMatcher, &v(&[0.0, 0.0]), &e("none"), 8).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_find_matches_concrete_scenario() {
        let store = MemoryEmbeddingStore::new();
        store.put(&e("wed"), &p("p1"), v(&[0.0, 0.0])).unwrap();
        store.put(&e("wed"), &p("p2"), v(&[1.0, 0.0])).unwrap();
        store.put(&e("wed"), &p("p3"), v(&[3.0, 4.0])).unwrap();
        store.put(&e("other"), &p("q1"), v(&[0.0, 0.0])).unwrap();

        let results = find_matches(&store, &EuclideanMatcher, &v(&[0.0, 0.0]), &e("wed"), 2).unwrap();
        let pairs: Vec<_> = results.iter().map(|r| (r.photo_id.as_str(), r.distance)).collect();
        assert_eq!(pairs, vec![("p1", 0.0), ("p2", 1.0)]);
    }
}
