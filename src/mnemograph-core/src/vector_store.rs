use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::driver::{VectorDriver, VectorRecord, NODE_COLLECTION, RELATION_COLLECTION};
use crate::embedder::{Embedder, EncodeMode, ParallelEncoder};
use crate::error::{MemoryError, Result};
use crate::models::{CreationReport, DeletionPlan, Triplet, VectorCounts};

const ENCODE_WORKERS: usize = 8;
const ENCODE_BATCH: usize = 4;

/// Semantic mirror of the graph: node names and canonical triplet strings,
/// embedded in passage mode. Deletion policy always comes from the graph
/// store's plan; this store never infers it.
pub struct VectorKnowledgeStore {
    driver: Arc<dyn VectorDriver>,
    encoder: ParallelEncoder,
}

impl VectorKnowledgeStore {
    pub fn new(driver: Arc<dyn VectorDriver>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            driver,
            encoder: ParallelEncoder::new(embedder, ENCODE_WORKERS, ENCODE_BATCH),
        }
    }

    pub fn driver(&self) -> &Arc<dyn VectorDriver> {
        &self.driver
    }

    /// Mirror triplets into the vector backend. Dedup runs against this
    /// backend's own existence check: a relation id may already be present
    /// even when the graph store first sees the structural triplet.
    ///
    /// In the report, triplet sets carry relation ids: the vector store
    /// keys facts by canonical relation id, not structural id.
    pub async fn create_triplets(
        &self,
        triplets: &[Triplet],
        create_nodes: bool,
        batch_size: usize,
    ) -> Result<CreationReport> {
        for triplet in triplets {
            triplet.validate()?;
        }

        let mut report = CreationReport::default();
        for chunk in triplets.chunks(batch_size.max(1)) {
            self.create_batch(chunk, create_nodes, &mut report).await?;
        }

        debug!(
            created_relations = report.created_triplets.len(),
            created_nodes = report.created_nodes.len(),
            "vector create finished"
        );
        Ok(report)
    }

    async fn create_batch(
        &self,
        chunk: &[Triplet],
        create_nodes: bool,
        report: &mut CreationReport,
    ) -> Result<()> {
        // (collection, id, text) triples pending embedding
        let mut pending: Vec<(&'static str, String, String)> = Vec::new();

        for triplet in chunk {
            let relation_id = &triplet.relation.id;
            if !report.created_triplets.contains(relation_id)
                && !report.existing_triplets.contains(relation_id)
            {
                if self
                    .driver
                    .item_exists(RELATION_COLLECTION, relation_id)
                    .await?
                {
                    report.existing_triplets.insert(relation_id.clone());
                } else {
                    report.created_triplets.insert(relation_id.clone());
                    pending.push((
                        RELATION_COLLECTION,
                        relation_id.clone(),
                        triplet.stringified.clone(),
                    ));
                }
            }

            if !create_nodes {
                continue;
            }
            for node in triplet.nodes() {
                if report.created_nodes.contains(&node.id)
                    || report.existing_nodes.contains(&node.id)
                {
                    continue;
                }
                if self.driver.item_exists(NODE_COLLECTION, &node.id).await? {
                    report.existing_nodes.insert(node.id.clone());
                } else {
                    report.created_nodes.insert(node.id.clone());
                    pending.push((NODE_COLLECTION, node.id.clone(), node.name.clone()));
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|(_, _, text)| text.clone()).collect();
        let vectors = self.encoder.encode(EncodeMode::Passage, &texts).await?;

        let mut by_collection: HashMap<&'static str, Vec<VectorRecord>> = HashMap::new();
        for ((collection, id, text), vector) in pending.into_iter().zip(vectors) {
            by_collection.entry(collection).or_default().push(VectorRecord {
                id,
                text,
                vector,
            });
        }
        for (collection, records) in by_collection {
            self.driver.create(collection, &records).await?;
        }
        Ok(())
    }

    /// Apply the graph store's deletion plan, removing exactly the mirrors
    /// it flagged.
    pub async fn delete_triplets(
        &self,
        triplets: &[Triplet],
        plans: &[DeletionPlan],
    ) -> Result<()> {
        if triplets.len() != plans.len() {
            return Err(MemoryError::InvalidInput(format!(
                "{} triplets but {} deletion plans",
                triplets.len(),
                plans.len()
            )));
        }

        let mut node_ids = Vec::new();
        let mut relation_ids = Vec::new();
        for (triplet, plan) in triplets.iter().zip(plans) {
            if plan.delete_start_node {
                node_ids.push(triplet.start.id.clone());
            }
            if plan.delete_end_node {
                node_ids.push(triplet.end.id.clone());
            }
            if plan.delete_relation_mirror {
                relation_ids.push(triplet.relation.id.clone());
            }
        }

        if !node_ids.is_empty() {
            self.driver.delete(NODE_COLLECTION, &node_ids).await?;
        }
        if !relation_ids.is_empty() {
            self.driver.delete(RELATION_COLLECTION, &relation_ids).await?;
        }

        debug!(
            nodes = node_ids.len(),
            relations = relation_ids.len(),
            "vector delete finished"
        );
        Ok(())
    }

    /// Raw vectors for retrieval components layered on top.
    pub async fn read_embeddings(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        Ok(self.driver.read_embeddings(collection, ids).await?)
    }

    pub async fn count(&self) -> Result<VectorCounts> {
        Ok(VectorCounts {
            nodes: self.driver.count(NODE_COLLECTION).await?,
            relations: self.driver.count(RELATION_COLLECTION).await?,
        })
    }

    /// Wipe every collection on the backend.
    pub async fn clear(&self) -> Result<()> {
        Ok(self.driver.clear().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryVectorBackend;
    use crate::models::{Node, NodeKind, Relation};
    use crate::testutil::StubEmbedder;

    fn store() -> VectorKnowledgeStore {
        VectorKnowledgeStore::new(
            Arc::new(MemoryVectorBackend::new()),
            Arc::new(StubEmbedder::new(4)),
        )
    }

    #[tokio::test]
    async fn test_create_collapses_canonical_duplicates() {
        let store = store();
        let t1 = Triplet::simple("Paris", "capital_of", "France");
        let t2 = Triplet::new(
            Node::new("Paris", NodeKind::Episodic),
            Relation::simple("capital_of"),
            Node::object("France"),
            None,
        );

        let report = store
            .create_triplets(&[t1.clone(), t2.clone()], true, 100)
            .await
            .unwrap();

        // One canonical fact, three distinct nodes
        assert_eq!(report.created_triplets.len(), 1);
        assert_eq!(report.created_nodes.len(), 3);
        assert_eq!(
            store.count().await.unwrap(),
            VectorCounts {
                nodes: 3,
                relations: 1
            }
        );
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = store();
        let triplet = Triplet::simple("Paris", "capital_of", "France");

        store
            .create_triplets(std::slice::from_ref(&triplet), true, 100)
            .await
            .unwrap();
        let second = store
            .create_triplets(std::slice::from_ref(&triplet), true, 100)
            .await
            .unwrap();

        assert!(second.created_triplets.is_empty());
        assert!(second.existing_triplets.contains(&triplet.relation.id));
        assert_eq!(
            store.count().await.unwrap(),
            VectorCounts {
                nodes: 2,
                relations: 1
            }
        );
    }

    #[tokio::test]
    async fn test_create_without_nodes() {
        let store = store();
        let triplet = Triplet::simple("Paris", "capital_of", "France");

        store
            .create_triplets(std::slice::from_ref(&triplet), false, 100)
            .await
            .unwrap();
        assert_eq!(
            store.count().await.unwrap(),
            VectorCounts {
                nodes: 0,
                relations: 1
            }
        );
    }

    #[tokio::test]
    async fn test_delete_obeys_plan() {
        let store = store();
        let triplet = Triplet::simple("A", "rel", "B");
        store
            .create_triplets(std::slice::from_ref(&triplet), true, 100)
            .await
            .unwrap();

        // The graph said: drop A and the relation, keep B
        let plan = DeletionPlan {
            delete_start_node: true,
            delete_end_node: false,
            delete_relation_mirror: true,
        };
        store
            .delete_triplets(std::slice::from_ref(&triplet), &[plan])
            .await
            .unwrap();

        assert_eq!(
            store.count().await.unwrap(),
            VectorCounts {
                nodes: 1,
                relations: 0
            }
        );
        assert!(store
            .driver()
            .item_exists(NODE_COLLECTION, &triplet.end.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_requires_aligned_plans() {
        let store = store();
        let triplet = Triplet::simple("A", "rel", "B");
        let err = store
            .delete_triplets(std::slice::from_ref(&triplet), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_read_embeddings_skips_missing() {
        let store = store();
        let triplet = Triplet::simple("A", "rel", "B");
        store
            .create_triplets(std::slice::from_ref(&triplet), true, 100)
            .await
            .unwrap();

        let embeddings = store
            .read_embeddings(
                NODE_COLLECTION,
                &[triplet.start.id.clone(), "missing".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[&triplet.start.id].len(), 4);
    }
}
