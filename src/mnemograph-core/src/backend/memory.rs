use anyhow::{Context, Result};
use async_trait::async_trait;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;

use crate::backend::index::{IndexConfig, VectorIndex};
use crate::driver::{GraphDriver, TreeDriver, VectorDriver, VectorHit, VectorRecord};
use crate::models::{GraphCounts, Node, NodeKind, TreeCounts, TreeNode, TreeNodeKind, Triplet};

/// Edge payload in the in-memory graph.
#[derive(Debug, Clone)]
struct EdgeEntry {
    triplet: Triplet,
}

#[derive(Default)]
struct GraphState {
    graph: StableDiGraph<String, EdgeEntry>,
    node_ix: HashMap<String, NodeIndex>,
    nodes: HashMap<String, Node>,
    edge_ix: HashMap<String, EdgeIndex>,
    /// relation id -> number of stored triplets sharing it
    relation_refs: HashMap<String, usize>,
}

impl GraphState {
    fn drop_edge(&mut self, edge: EdgeIndex) {
        if let Some(entry) = self.graph.remove_edge(edge) {
            self.edge_ix.remove(&entry.triplet.id);
            let relation_id = entry.triplet.relation.id;
            if let Some(refs) = self.relation_refs.get_mut(&relation_id) {
                *refs -= 1;
                if *refs == 0 {
                    self.relation_refs.remove(&relation_id);
                }
            }
        }
    }
}

/// In-memory graph backend over a stable directed graph.
#[derive(Default)]
pub struct MemoryGraphBackend {
    state: RwLock<GraphState>,
}

impl MemoryGraphBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphDriver for MemoryGraphBackend {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn create_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut state = self.state.write().await;
        for node in nodes {
            if state.nodes.contains_key(&node.id) {
                continue;
            }
            let ix = state.graph.add_node(node.id.clone());
            state.node_ix.insert(node.id.clone(), ix);
            state.nodes.insert(node.id.clone(), node.clone());
        }
        Ok(())
    }

    async fn create_triplets(&self, triplets: &[Triplet]) -> Result<()> {
        let mut state = self.state.write().await;
        for triplet in triplets {
            if state.edge_ix.contains_key(&triplet.id) {
                continue;
            }
            let start = *state
                .node_ix
                .get(&triplet.start.id)
                .with_context(|| format!("start node {} not stored", triplet.start.id))?;
            let end = *state
                .node_ix
                .get(&triplet.end.id)
                .with_context(|| format!("end node {} not stored", triplet.end.id))?;
            let edge = state.graph.add_edge(
                start,
                end,
                EdgeEntry {
                    triplet: triplet.clone(),
                },
            );
            state.edge_ix.insert(triplet.id.clone(), edge);
            *state
                .relation_refs
                .entry(triplet.relation.id.clone())
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn read_nodes(&self, ids: &[String]) -> Result<Vec<Node>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect())
    }

    async fn update_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut state = self.state.write().await;
        for node in nodes {
            let stored = state
                .nodes
                .get_mut(&node.id)
                .with_context(|| format!("node {} not stored", node.id))?;
            stored
                .properties
                .extend(node.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    async fn delete_nodes(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            let Some(ix) = state.node_ix.remove(id) else {
                continue;
            };
            let incident: Vec<EdgeIndex> = state
                .graph
                .edges_directed(ix, Direction::Outgoing)
                .chain(state.graph.edges_directed(ix, Direction::Incoming))
                .map(|e| e.id())
                .collect();
            for edge in incident {
                state.drop_edge(edge);
            }
            state.graph.remove_node(ix);
            state.nodes.remove(id);
        }
        Ok(())
    }

    async fn delete_triplets(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(edge) = state.edge_ix.get(id).copied() {
                state.drop_edge(edge);
            }
        }
        Ok(())
    }

    async fn count(&self) -> Result<GraphCounts> {
        let state = self.state.read().await;
        Ok(GraphCounts {
            nodes: state.nodes.len(),
            triplets: state.edge_ix.len(),
        })
    }

    async fn node_exists(&self, id: &str) -> Result<bool> {
        Ok(self.state.read().await.nodes.contains_key(id))
    }

    async fn triplet_exists(&self, id: &str) -> Result<bool> {
        Ok(self.state.read().await.edge_ix.contains_key(id))
    }

    async fn clear(&self) -> Result<()> {
        *self.state.write().await = GraphState::default();
        Ok(())
    }

    async fn adjacent_node_ids(&self, node_id: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(&ix) = state.node_ix.get(node_id) else {
            return Ok(Vec::new());
        };
        let mut seen = HashSet::new();
        let mut adjacent = Vec::new();
        for neighbor in state.graph.neighbors_undirected(ix) {
            let id = &state.graph[neighbor];
            if seen.insert(id.clone()) {
                adjacent.push(id.clone());
            }
        }
        Ok(adjacent)
    }

    async fn triplets_between(&self, start_id: &str, end_id: &str) -> Result<Vec<Triplet>> {
        let state = self.state.read().await;
        let (Some(&start), Some(&end)) =
            (state.node_ix.get(start_id), state.node_ix.get(end_id))
        else {
            return Ok(Vec::new());
        };
        Ok(state
            .graph
            .edges_connecting(start, end)
            .map(|e| e.weight().triplet.clone())
            .collect())
    }

    async fn node_kind(&self, id: &str) -> Result<Option<NodeKind>> {
        Ok(self.state.read().await.nodes.get(id).map(|n| n.kind))
    }

    async fn relation_occurrences(&self, relation_id: &str) -> Result<usize> {
        Ok(self
            .state
            .read()
            .await
            .relation_refs
            .get(relation_id)
            .copied()
            .unwrap_or(0))
    }
}

struct Collection {
    records: HashMap<String, VectorRecord>,
    index: Option<VectorIndex>,
    dimensions: usize,
}

impl Collection {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            index: None,
            dimensions: 0,
        }
    }
}

/// In-memory vector backend. Queries scan brute-force below the index
/// threshold and switch to HNSW above it.
pub struct MemoryVectorBackend {
    collections: RwLock<HashMap<String, Collection>>,
    index_threshold: usize,
    index_config: IndexConfig,
}

impl Default for MemoryVectorBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVectorBackend {
    pub fn new() -> Self {
        Self::with_threshold(1000)
    }

    /// Build the HNSW index once a collection reaches `threshold` records.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            index_threshold: threshold.max(1),
            index_config: IndexConfig::default(),
        }
    }
}

#[async_trait]
impl VectorDriver for MemoryVectorBackend {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(Collection::new);
        for record in records {
            if coll.dimensions == 0 {
                coll.dimensions = record.vector.len();
            }
            if let Some(index) = &coll.index {
                index.add(record.id.clone(), record.vector.clone())?;
            }
            coll.records.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn read(&self, collection: &str, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| coll.records.get(id).cloned())
            .collect())
    }

    async fn update(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        self.create(collection, records).await
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        let mut collections = self.collections.write().await;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(());
        };
        for id in ids {
            coll.records.remove(id);
            if let Some(index) = &coll.index {
                index.remove(id);
            }
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.records.len())
            .unwrap_or(0))
    }

    async fn item_exists(&self, collection: &str, id: &str) -> Result<bool> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.records.contains_key(id))
            .unwrap_or(false))
    }

    async fn clear(&self) -> Result<()> {
        self.collections.write().await.clear();
        Ok(())
    }

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let mut collections = self.collections.write().await;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(Vec::new());
        };
        if coll.records.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        if coll.records.len() >= self.index_threshold && coll.index.is_none() {
            let index = VectorIndex::new(coll.dimensions, self.index_config.clone());
            index.build(
                coll.records
                    .values()
                    .map(|r| (r.id.clone(), r.vector.clone()))
                    .collect(),
            )?;
            coll.index = Some(index);
        }
        if let Some(index) = &coll.index {
            let hits = index
                .search(vector, k)?
                .into_iter()
                .filter_map(|(id, distance)| {
                    coll.records.get(&id).map(|r| VectorHit {
                        id,
                        text: r.text.clone(),
                        distance,
                    })
                })
                .collect();
            return Ok(hits);
        }

        // Brute-force cosine scan
        let mut hits: Vec<VectorHit> = coll
            .records
            .par_iter()
            .map(|(id, record)| VectorHit {
                id: id.clone(),
                text: record.text.clone(),
                distance: 1.0 - cosine_similarity(vector, &record.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn read_embeddings(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| {
                coll.records
                    .get(id)
                    .map(|r| (id.clone(), r.vector.clone()))
            })
            .collect())
    }
}

/// Cosine similarity between two vectors.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for i in 0..a.len() {
        dot_product += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<String, TreeNode>,
    children: HashMap<String, Vec<String>>,
    by_str_id: HashMap<String, String>,
    root_id: Option<String>,
}

/// In-memory tree backend with a children index and domain-id lookup.
#[derive(Default)]
pub struct MemoryTreeBackend {
    state: RwLock<TreeState>,
}

impl MemoryTreeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TreeDriver for MemoryTreeBackend {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, nodes: &[TreeNode]) -> Result<()> {
        let mut state = self.state.write().await;
        for node in nodes {
            if state.nodes.contains_key(&node.id) {
                anyhow::bail!("tree node {} already stored", node.id);
            }
            if node.kind == TreeNodeKind::Root {
                if state.root_id.is_some() {
                    anyhow::bail!("tree already has a root");
                }
                state.root_id = Some(node.id.clone());
            }
            if let Some(parent) = &node.parent_id {
                state
                    .children
                    .entry(parent.clone())
                    .or_default()
                    .push(node.id.clone());
            }
            if let Some(str_id) = &node.str_id {
                state.by_str_id.insert(str_id.clone(), node.id.clone());
            }
            state.nodes.insert(node.id.clone(), node.clone());
        }
        Ok(())
    }

    async fn read(&self, ids: &[String]) -> Result<Vec<TreeNode>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect())
    }

    async fn update(&self, nodes: &[TreeNode]) -> Result<()> {
        let mut state = self.state.write().await;
        for node in nodes {
            let old = state
                .nodes
                .get(&node.id)
                .with_context(|| format!("tree node {} not stored", node.id))?
                .clone();

            if old.parent_id != node.parent_id {
                if let Some(parent) = &old.parent_id {
                    if let Some(siblings) = state.children.get_mut(parent) {
                        siblings.retain(|id| id != &node.id);
                    }
                }
                if let Some(parent) = &node.parent_id {
                    state
                        .children
                        .entry(parent.clone())
                        .or_default()
                        .push(node.id.clone());
                }
            }

            if old.str_id != node.str_id {
                if let Some(str_id) = &old.str_id {
                    state.by_str_id.remove(str_id);
                }
                if let Some(str_id) = &node.str_id {
                    state.by_str_id.insert(str_id.clone(), node.id.clone());
                }
            }

            state.nodes.insert(node.id.clone(), node.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            let Some(node) = state.nodes.remove(id) else {
                continue;
            };
            if let Some(parent) = &node.parent_id {
                if let Some(siblings) = state.children.get_mut(parent) {
                    siblings.retain(|child| child != id);
                }
            }
            state.children.remove(id);
            if let Some(str_id) = &node.str_id {
                state.by_str_id.remove(str_id);
            }
            if state.root_id.as_deref() == Some(id) {
                state.root_id = None;
            }
        }
        Ok(())
    }

    async fn count(&self) -> Result<TreeCounts> {
        let state = self.state.read().await;
        let mut counts = TreeCounts::default();
        for node in state.nodes.values() {
            match node.kind {
                TreeNodeKind::Root => counts.roots += 1,
                TreeNodeKind::Leaf => counts.leaves += 1,
                TreeNodeKind::Summarized => counts.summarized += 1,
            }
        }
        Ok(counts)
    }

    async fn item_exists(&self, id: &str) -> Result<bool> {
        Ok(self.state.read().await.nodes.contains_key(id))
    }

    async fn clear(&self) -> Result<()> {
        *self.state.write().await = TreeState::default();
        Ok(())
    }

    async fn root(&self) -> Result<Option<TreeNode>> {
        let state = self.state.read().await;
        Ok(state
            .root_id
            .as_ref()
            .and_then(|id| state.nodes.get(id))
            .cloned())
    }

    async fn child_nodes(&self, parent_id: &str) -> Result<Vec<TreeNode>> {
        let state = self.state.read().await;
        Ok(state
            .children
            .get(parent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.nodes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn leaf_descendants(&self, id: &str) -> Result<Vec<TreeNode>> {
        let state = self.state.read().await;
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        let mut leaves = Vec::new();
        while let Some(current) = queue.pop_front() {
            let Some(children) = state.children.get(current) else {
                continue;
            };
            for child_id in children {
                if let Some(child) = state.nodes.get(child_id) {
                    match child.kind {
                        TreeNodeKind::Leaf => leaves.push(child.clone()),
                        _ => queue.push_back(child_id),
                    }
                }
            }
        }
        Ok(leaves)
    }

    async fn max_depth(&self) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.nodes.values().map(|n| n.depth).max().unwrap_or(0))
    }

    async fn find_by_str_id(&self, str_id: &str) -> Result<Option<TreeNode>> {
        let state = self.state.read().await;
        Ok(state
            .by_str_id
            .get(str_id)
            .and_then(|id| state.nodes.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triplet(start: &str, relation: &str, end: &str) -> Triplet {
        Triplet::simple(start, relation, end)
    }

    async fn seeded_graph(triplets: &[Triplet]) -> MemoryGraphBackend {
        let backend = MemoryGraphBackend::new();
        let nodes: Vec<Node> = {
            let mut seen = HashSet::new();
            triplets
                .iter()
                .flat_map(|t| t.nodes().cloned().collect::<Vec<_>>())
                .filter(|n| seen.insert(n.id.clone()))
                .collect()
        };
        backend.create_nodes(&nodes).await.unwrap();
        backend.create_triplets(triplets).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_graph_adjacency_is_undirected() {
        let t1 = triplet("A", "rel", "B");
        let t2 = triplet("B", "rel", "C");
        let backend = seeded_graph(&[t1.clone(), t2.clone()]).await;

        let mut adjacent = backend.adjacent_node_ids(&t1.end.id).await.unwrap();
        adjacent.sort();
        let mut expected = vec![t1.start.id.clone(), t2.end.id.clone()];
        expected.sort();
        assert_eq!(adjacent, expected);
    }

    #[tokio::test]
    async fn test_graph_relation_occurrences() {
        let t1 = triplet("Paris", "capital_of", "France");
        let t2 = Triplet::new(
            Node::new("Paris", NodeKind::Episodic),
            crate::models::Relation::simple("capital_of"),
            Node::object("France"),
            None,
        );
        let backend = seeded_graph(&[t1.clone(), t2.clone()]).await;

        assert_eq!(
            backend.relation_occurrences(&t1.relation.id).await.unwrap(),
            2
        );

        backend.delete_triplets(&[t1.id.clone()]).await.unwrap();
        assert_eq!(
            backend.relation_occurrences(&t1.relation.id).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_graph_delete_node_removes_incident_edges() {
        let t1 = triplet("A", "rel", "B");
        let backend = seeded_graph(&[t1.clone()]).await;

        backend.delete_nodes(&[t1.start.id.clone()]).await.unwrap();
        let counts = backend.count().await.unwrap();
        assert_eq!(counts.nodes, 1);
        assert_eq!(counts.triplets, 0);
        assert_eq!(
            backend.relation_occurrences(&t1.relation.id).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_vector_query_brute_force_ordering() {
        let backend = MemoryVectorBackend::new();
        backend
            .create(
                "test",
                &[
                    VectorRecord {
                        id: "x".to_string(),
                        text: "x".to_string(),
                        vector: vec![1.0, 0.0],
                    },
                    VectorRecord {
                        id: "y".to_string(),
                        text: "y".to_string(),
                        vector: vec![0.0, 1.0],
                    },
                ],
            )
            .await
            .unwrap();

        let hits = backend.query("test", &[0.9, 0.1], 2).await.unwrap();
        assert_eq!(hits[0].id, "x");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[tokio::test]
    async fn test_vector_query_uses_index_above_threshold() {
        let backend = MemoryVectorBackend::with_threshold(3);
        let records: Vec<VectorRecord> = (0..4)
            .map(|i| {
                let mut vector = vec![0.0; 4];
                vector[i] = 1.0;
                VectorRecord {
                    id: format!("r{}", i),
                    text: format!("r{}", i),
                    vector,
                }
            })
            .collect();
        backend.create("test", &records).await.unwrap();

        let hits = backend.query("test", &[0.0, 0.0, 1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].id, "r2");

        // Deletes must be honored by the index path too
        backend
            .delete("test", &["r2".to_string()])
            .await
            .unwrap();
        let hits = backend.query("test", &[0.0, 0.0, 1.0, 0.0], 1).await.unwrap();
        assert_ne!(hits[0].id, "r2");
    }

    #[tokio::test]
    async fn test_tree_children_and_descendants() {
        let backend = MemoryTreeBackend::new();
        let root = TreeNode::root();
        backend.create(std::slice::from_ref(&root)).await.unwrap();

        let mut branch = TreeNode::leaf(&root.id, "n1", "branch", 1);
        branch.kind = TreeNodeKind::Summarized;
        branch.str_id = None;
        backend.create(std::slice::from_ref(&branch)).await.unwrap();

        let leaf_a = TreeNode::leaf(&branch.id, "n2", "a", 2);
        let leaf_b = TreeNode::leaf(&branch.id, "n3", "b", 2);
        backend
            .create(&[leaf_a.clone(), leaf_b.clone()])
            .await
            .unwrap();

        assert_eq!(backend.child_nodes(&root.id).await.unwrap().len(), 1);
        assert_eq!(backend.child_nodes(&branch.id).await.unwrap().len(), 2);

        let descendants = backend.leaf_descendants(&root.id).await.unwrap();
        assert_eq!(descendants.len(), 2);

        assert_eq!(backend.max_depth().await.unwrap(), 2);
        assert!(backend.find_by_str_id("n2").await.unwrap().is_some());
        assert!(backend.find_by_str_id("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tree_rejects_second_root() {
        let backend = MemoryTreeBackend::new();
        backend.create(&[TreeNode::root()]).await.unwrap();
        assert!(backend.create(&[TreeNode::root()]).await.is_err());
    }

    #[tokio::test]
    async fn test_tree_update_rehomes_children_index() {
        let backend = MemoryTreeBackend::new();
        let root = TreeNode::root();
        backend.create(std::slice::from_ref(&root)).await.unwrap();

        let mut branch = TreeNode::leaf(&root.id, "n1", "branch", 1);
        branch.kind = TreeNodeKind::Summarized;
        branch.str_id = None;
        backend.create(std::slice::from_ref(&branch)).await.unwrap();

        let leaf = TreeNode::leaf(&branch.id, "n2", "a", 2);
        backend.create(std::slice::from_ref(&leaf)).await.unwrap();

        // Re-home the leaf under the root
        let mut moved = leaf.clone();
        moved.parent_id = Some(root.id.clone());
        moved.depth = 1;
        backend.update(std::slice::from_ref(&moved)).await.unwrap();

        assert!(backend.child_nodes(&branch.id).await.unwrap().is_empty());
        assert_eq!(backend.child_nodes(&root.id).await.unwrap().len(), 2);
    }
}
