use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::backend::Backends;
use crate::config::EngineConfig;
use crate::embedder::Embedder;
use crate::error::{MemoryError, Result};
use crate::graph_store::GraphKnowledgeStore;
use crate::merge::MergeProvider;
use crate::models::{
    CreationReport, DeletionPlan, DeletionReport, MemoryCounts, NodeKind, TreeCounts, Triplet,
};
use crate::tree_index::{AddOutcome, SemanticTreeIndex};
use crate::vector_store::VectorKnowledgeStore;

/// Per-layer creation reports for one `add_knowledge` call.
#[derive(Debug)]
pub struct KnowledgeReport {
    pub graph: CreationReport,
    pub vector: CreationReport,
    /// Object entities newly indexed in the semantic tree.
    pub indexed_entities: usize,
}

/// What one `remove_knowledge` call deleted, layer by layer.
#[derive(Debug)]
pub struct RemovalReport {
    pub graph: DeletionReport,
    pub plans: Vec<DeletionPlan>,
    /// Object entities removed from the semantic tree.
    pub removed_entities: usize,
}

/// Composes the three stores and enforces their write/delete protocol:
/// graph first, vector second (obeying the graph's deletion plans), tree
/// last. Single writer; callers serialize concurrent mutation.
pub struct MemoryEngine {
    graph: GraphKnowledgeStore,
    vector: VectorKnowledgeStore,
    tree: Option<SemanticTreeIndex>,
    config: EngineConfig,
}

impl MemoryEngine {
    pub fn new(
        backends: Backends,
        embedder: Arc<dyn Embedder>,
        merger: Arc<dyn MergeProvider>,
        config: EngineConfig,
    ) -> Self {
        let graph = GraphKnowledgeStore::new(backends.graph.clone());
        let vector = VectorKnowledgeStore::new(backends.vector.clone(), embedder.clone());
        let tree = config.index_objects.then(|| {
            SemanticTreeIndex::new(
                backends.tree.clone(),
                backends.vector.clone(),
                embedder,
                merger,
                config.tree.clone(),
            )
        });
        Self {
            graph,
            vector,
            tree,
            config,
        }
    }

    /// Prepare the layers; creates the semantic tree root on first use.
    pub async fn open(&self) -> Result<()> {
        if let Some(tree) = &self.tree {
            tree.open().await?;
        }
        Ok(())
    }

    pub fn graph(&self) -> &GraphKnowledgeStore {
        &self.graph
    }

    pub fn vector(&self) -> &VectorKnowledgeStore {
        &self.vector
    }

    pub fn tree(&self) -> Option<&SemanticTreeIndex> {
        self.tree.as_ref()
    }

    /// Store triplets across all layers. Graph first, then the vector
    /// mirror, then object entities into the semantic tree.
    pub async fn add_knowledge(
        &self,
        triplets: &[Triplet],
        check_consistency: bool,
    ) -> Result<KnowledgeReport> {
        let graph = self
            .graph
            .create_triplets(triplets, self.config.batch_size)
            .await?;
        let vector = self
            .vector
            .create_triplets(triplets, true, self.config.batch_size)
            .await?;

        let mut indexed_entities = 0;
        if let Some(tree) = &self.tree {
            let mut seen: HashSet<&str> = HashSet::new();
            for triplet in triplets {
                for node in triplet.nodes() {
                    if node.kind != NodeKind::Object || !seen.insert(node.id.as_str()) {
                        continue;
                    }
                    if matches!(
                        tree.add_node(&node.id, &node.name).await?,
                        AddOutcome::Inserted { .. }
                    ) {
                        indexed_entities += 1;
                    }
                }
            }
        }

        if check_consistency {
            self.check_consistency().await?;
        }

        info!(
            triplets = triplets.len(),
            created = graph.created_triplets.len(),
            indexed_entities,
            "knowledge added"
        );
        Ok(KnowledgeReport {
            graph,
            vector,
            indexed_entities,
        })
    }

    /// Delete triplets. The graph store computes and applies the structural
    /// deletion, the vector store obeys its plan, and graph-orphaned object
    /// entities leave the semantic tree.
    pub async fn remove_knowledge(
        &self,
        triplets: &[Triplet],
        check_consistency: bool,
    ) -> Result<RemovalReport> {
        let (graph, plans) = self.graph.delete_triplets(triplets).await?;
        self.vector.delete_triplets(triplets, &plans).await?;

        let mut removed_entities = 0;
        if let Some(tree) = &self.tree {
            for (triplet, plan) in triplets.iter().zip(&plans) {
                if plan.delete_start_node
                    && triplet.start.kind == NodeKind::Object
                    && tree.remove_node(&triplet.start.id).await?
                {
                    removed_entities += 1;
                }
                if plan.delete_end_node
                    && triplet.end.kind == NodeKind::Object
                    && tree.remove_node(&triplet.end.id).await?
                {
                    removed_entities += 1;
                }
            }
        }

        if check_consistency {
            self.check_consistency().await?;
        }

        info!(
            triplets = triplets.len(),
            deleted = graph.deleted_triplets.len(),
            removed_entities,
            "knowledge removed"
        );
        Ok(RemovalReport {
            graph,
            plans,
            removed_entities,
        })
    }

    /// Aggregate counts across all layers.
    pub async fn count_items(&self) -> Result<MemoryCounts> {
        let tree = match &self.tree {
            Some(tree) => tree.count().await?,
            None => TreeCounts::default(),
        };
        Ok(MemoryCounts {
            graph: self.graph.count().await?,
            vector: self.vector.count().await?,
            tree,
        })
    }

    /// Full wipe across all layers. The tree root is re-created so the
    /// engine stays usable.
    pub async fn clear(&self) -> Result<()> {
        self.graph.clear().await?;
        self.vector.clear().await?;
        if let Some(tree) = &self.tree {
            tree.clear().await?;
        }
        info!("memory engine cleared");
        Ok(())
    }

    /// Verify the cross-store invariants. A failure means a prior write
    /// went partially wrong; surface it, do not repair silently.
    pub async fn check_consistency(&self) -> Result<()> {
        let graph = self.graph.count().await?;
        let vector = self.vector.count().await?;

        if graph.nodes != vector.nodes {
            return Err(MemoryError::ConsistencyViolation(format!(
                "graph holds {} nodes but the vector store holds {}",
                graph.nodes, vector.nodes
            )));
        }
        if graph.triplets < vector.relations {
            return Err(MemoryError::ConsistencyViolation(format!(
                "graph holds {} triplets but the vector store holds {} relations",
                graph.triplets, vector.relations
            )));
        }

        if let Some(tree) = &self.tree {
            tree.check_consistency().await?;
        }
        Ok(())
    }
}
