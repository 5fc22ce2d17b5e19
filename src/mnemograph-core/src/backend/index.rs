use anyhow::Result;
use hnsw_rs::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

const MAX_LAYER: usize = 16;

/// Approximate nearest-neighbor index over one vector collection.
///
/// HNSW is append-only, so deletions are tombstoned: removed slots stay in
/// the graph but are filtered out of search results.
pub struct VectorIndex {
    hnsw: Arc<RwLock<Option<Hnsw<'static, f32, DistCosine>>>>,

    /// Mapping from HNSW slot -> record id
    id_map: Arc<RwLock<Vec<String>>>,

    /// Reverse mapping from record id -> live HNSW slot
    reverse_map: Arc<RwLock<HashMap<String, usize>>>,

    /// Slots whose record was deleted or superseded
    tombstones: Arc<RwLock<HashSet<usize>>>,

    dimensions: usize,

    config: IndexConfig,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub hnsw_m: usize,               // Max connections per layer (default: 16)
    pub hnsw_ef_construction: usize, // Build quality (default: 200)
    pub hnsw_ef_search: usize,       // Search quality (default: 100)
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 100,
        }
    }
}

impl VectorIndex {
    pub fn new(dimensions: usize, config: IndexConfig) -> Self {
        Self {
            hnsw: Arc::new(RwLock::new(None)),
            id_map: Arc::new(RwLock::new(Vec::new())),
            reverse_map: Arc::new(RwLock::new(HashMap::new())),
            tombstones: Arc::new(RwLock::new(HashSet::new())),
            dimensions,
            config,
        }
    }

    /// Build the index from scratch.
    pub fn build(&self, records: Vec<(String, Vec<f32>)>) -> Result<()> {
        if records.is_empty() {
            info!("No records to index");
            return Ok(());
        }

        info!(
            "Building HNSW index for {} records (dims={})",
            records.len(),
            self.dimensions
        );

        let hnsw: Hnsw<'static, f32, DistCosine> = Hnsw::new(
            self.config.hnsw_m,
            records.len().max(16),
            MAX_LAYER,
            self.config.hnsw_ef_construction,
            DistCosine,
        );

        let mut id_map = Vec::new();
        let mut reverse_map = HashMap::new();

        for (idx, (id, vector)) in records.into_iter().enumerate() {
            if vector.len() != self.dimensions {
                warn!(
                    "Skipping record {} with wrong dimensions: {} (expected {})",
                    id,
                    vector.len(),
                    self.dimensions
                );
                continue;
            }

            hnsw.insert((&vector, idx));
            id_map.push(id.clone());
            reverse_map.insert(id, idx);
        }

        *self.hnsw.write().unwrap() = Some(hnsw);
        *self.id_map.write().unwrap() = id_map;
        *self.reverse_map.write().unwrap() = reverse_map;
        self.tombstones.write().unwrap().clear();

        Ok(())
    }

    /// Add or replace a single record. Replacing tombstones the old slot.
    pub fn add(&self, id: String, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions {
            anyhow::bail!(
                "Vector dimension mismatch: {} (expected {})",
                vector.len(),
                self.dimensions
            );
        }

        let mut hnsw_lock = self.hnsw.write().unwrap();
        let mut id_map = self.id_map.write().unwrap();
        let mut reverse_map = self.reverse_map.write().unwrap();
        let mut tombstones = self.tombstones.write().unwrap();

        if hnsw_lock.is_none() {
            let hnsw: Hnsw<'static, f32, DistCosine> = Hnsw::new(
                self.config.hnsw_m,
                10000, // Initial capacity
                MAX_LAYER,
                self.config.hnsw_ef_construction,
                DistCosine,
            );
            *hnsw_lock = Some(hnsw);
            debug!("Created new HNSW index");
        }

        if let Some(&old_idx) = reverse_map.get(&id) {
            tombstones.insert(old_idx);
        }

        let idx = id_map.len();
        hnsw_lock
            .as_ref()
            .expect("index was just created")
            .insert((&vector, idx));
        id_map.push(id.clone());
        reverse_map.insert(id, idx);

        Ok(())
    }

    /// Tombstone a record so searches no longer return it.
    pub fn remove(&self, id: &str) {
        let mut reverse_map = self.reverse_map.write().unwrap();
        if let Some(idx) = reverse_map.remove(id) {
            self.tombstones.write().unwrap().insert(idx);
        }
    }

    /// K nearest neighbors as (id, cosine distance), closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimensions {
            anyhow::bail!(
                "Query dimension mismatch: {} (expected {})",
                query.len(),
                self.dimensions
            );
        }

        let hnsw_lock = self.hnsw.read().unwrap();
        let id_map = self.id_map.read().unwrap();
        let tombstones = self.tombstones.read().unwrap();

        let Some(hnsw) = hnsw_lock.as_ref() else {
            return Ok(Vec::new());
        };

        // Over-fetch so tombstoned slots do not starve the result set
        let fetch = k + tombstones.len();
        let neighbors = hnsw.search(query, fetch, self.config.hnsw_ef_search);

        let results: Vec<(String, f32)> = neighbors
            .into_iter()
            .filter_map(|neighbor| {
                let idx = neighbor.d_id;
                if tombstones.contains(&idx) {
                    return None;
                }
                if idx < id_map.len() {
                    Some((id_map[idx].clone(), neighbor.distance))
                } else {
                    warn!("Invalid slot in HNSW: {}", idx);
                    None
                }
            })
            .take(k)
            .collect();

        debug!("HNSW search returned {} results", results.len());

        Ok(results)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.reverse_map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_built(&self) -> bool {
        self.hnsw.read().unwrap().is_some()
    }

    pub fn clear(&self) {
        *self.hnsw.write().unwrap() = None;
        self.id_map.write().unwrap().clear();
        self.reverse_map.write().unwrap().clear();
        self.tombstones.write().unwrap().clear();
    }
}
