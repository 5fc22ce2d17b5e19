use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{GraphCounts, Node, NodeKind, TreeCounts, TreeNode, Triplet};

/// Vector collection holding node-name documents.
pub const NODE_COLLECTION: &str = "nodes";
/// Vector collection holding canonical triplet strings, keyed by relation id.
pub const RELATION_COLLECTION: &str = "relations";
/// Vector collection holding semantic-tree leaf texts.
pub const TREE_LEAF_COLLECTION: &str = "tree_leaves";
/// Vector collection holding semantic-tree branch summaries.
pub const TREE_SUMMARY_COLLECTION: &str = "tree_summaries";

/// One embedded document in a vector collection.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Nearest-neighbor result. Distance is cosine distance: 0 means identical.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    pub distance: f32,
}

/// Capability contract of a graph storage backend. The graph store layers
/// all write policy on top; drivers only persist and answer primitives.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn create_nodes(&self, nodes: &[Node]) -> Result<()>;
    async fn create_triplets(&self, triplets: &[Triplet]) -> Result<()>;

    /// Missing ids are silently skipped.
    async fn read_nodes(&self, ids: &[String]) -> Result<Vec<Node>>;

    /// Merge properties into existing nodes; nodes are otherwise immutable.
    async fn update_nodes(&self, nodes: &[Node]) -> Result<()>;

    async fn delete_nodes(&self, ids: &[String]) -> Result<()>;
    async fn delete_triplets(&self, ids: &[String]) -> Result<()>;

    async fn count(&self) -> Result<GraphCounts>;
    async fn node_exists(&self, id: &str) -> Result<bool>;
    async fn triplet_exists(&self, id: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;

    /// Distinct neighbor node ids, ignoring edge direction.
    async fn adjacent_node_ids(&self, node_id: &str) -> Result<Vec<String>>;

    /// Triplets whose edge runs from `start_id` to `end_id`.
    async fn triplets_between(&self, start_id: &str, end_id: &str) -> Result<Vec<Triplet>>;

    async fn node_kind(&self, id: &str) -> Result<Option<NodeKind>>;

    /// How many stored triplets share this relation's canonical id.
    async fn relation_occurrences(&self, relation_id: &str) -> Result<usize>;
}

/// Capability contract of a vector storage backend, addressed by collection
/// name. Create and update are both upserts.
#[async_trait]
pub trait VectorDriver: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn create(&self, collection: &str, records: &[VectorRecord]) -> Result<()>;

    /// Missing ids are silently skipped.
    async fn read(&self, collection: &str, ids: &[String]) -> Result<Vec<VectorRecord>>;

    async fn update(&self, collection: &str, records: &[VectorRecord]) -> Result<()>;
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()>;

    async fn count(&self, collection: &str) -> Result<usize>;
    async fn item_exists(&self, collection: &str, id: &str) -> Result<bool>;

    /// Wipe every collection.
    async fn clear(&self) -> Result<()>;

    /// K nearest neighbors by cosine distance, closest first.
    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<VectorHit>>;

    /// Raw vectors for a set of ids. Missing ids are silently skipped.
    async fn read_embeddings(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>>;
}

/// Capability contract of a tree storage backend. Structure is encoded in
/// each node's `parent_id`; drivers maintain the children index.
#[async_trait]
pub trait TreeDriver: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn create(&self, nodes: &[TreeNode]) -> Result<()>;

    /// Missing ids are silently skipped.
    async fn read(&self, ids: &[String]) -> Result<Vec<TreeNode>>;

    /// Replace stored nodes, re-homing children indexes if a parent changed.
    async fn update(&self, nodes: &[TreeNode]) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn count(&self) -> Result<TreeCounts>;
    async fn item_exists(&self, id: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;

    async fn root(&self) -> Result<Option<TreeNode>>;
    async fn child_nodes(&self, parent_id: &str) -> Result<Vec<TreeNode>>;

    /// Every leaf in the subtree rooted at `id`.
    async fn leaf_descendants(&self, id: &str) -> Result<Vec<TreeNode>>;

    /// Deepest stored depth; 0 for a root-only tree.
    async fn max_depth(&self) -> Result<usize>;

    /// Look up the leaf representing a domain node id.
    async fn find_by_str_id(&self, str_id: &str) -> Result<Option<TreeNode>>;
}
