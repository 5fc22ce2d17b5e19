use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TreeConfig;
use crate::driver::{
    TreeDriver, VectorDriver, VectorHit, VectorRecord, TREE_LEAF_COLLECTION,
    TREE_SUMMARY_COLLECTION,
};
use crate::embedder::Embedder;
use crate::error::{MemoryError, Result};
use crate::merge::MergeProvider;
use crate::models::{TreeCounts, TreeNode, TreeNodeKind};

/// Hard ceiling for the adaptive descent threshold once the tree has depth.
const MAX_DESCENT_THRESHOLD: f32 = 0.98;

const MERGE_CONTEXT: &str = "combining entity descriptions inside one semantic cluster";

/// Result of an insertion attempt.
#[derive(Debug, Clone)]
pub enum AddOutcome {
    Inserted { leaf_id: String, depth: usize },
    AlreadyExists { leaf_id: String },
}

/// One matched entity.
#[derive(Debug, Clone)]
pub struct TreeMatch {
    pub leaf_id: String,
    /// Domain node id the matched leaf represents.
    pub str_id: String,
    pub text: String,
    pub distance: f32,
}

/// Similarity-organized hierarchy over object entities. Free-text mentions
/// resolve to the right node despite paraphrase, and close entities are
/// discoverable as a group.
///
/// Not safe for two concurrent insertions that could traverse to the same
/// parent; callers serialize writers per tree.
pub struct SemanticTreeIndex {
    tree: Arc<dyn TreeDriver>,
    vectors: Arc<dyn VectorDriver>,
    embedder: Arc<dyn Embedder>,
    merger: Arc<dyn MergeProvider>,
    config: TreeConfig,
}

impl SemanticTreeIndex {
    pub fn new(
        tree: Arc<dyn TreeDriver>,
        vectors: Arc<dyn VectorDriver>,
        embedder: Arc<dyn Embedder>,
        merger: Arc<dyn MergeProvider>,
        config: TreeConfig,
    ) -> Self {
        Self {
            tree,
            vectors,
            embedder,
            merger,
            config,
        }
    }

    /// Connect and create the root if this is a fresh tree.
    pub async fn open(&self) -> Result<()> {
        self.tree.open().await?;
        if self.tree.root().await?.is_none() {
            self.tree.create(&[TreeNode::root()]).await?;
            info!("created semantic tree root");
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.tree.close().await?)
    }

    /// Insert one entity. Idempotent per domain node id.
    pub async fn add_node(&self, node_id: &str, text: &str) -> Result<AddOutcome> {
        if node_id.trim().is_empty() || text.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "tree entries need a node id and non-empty text".to_string(),
            ));
        }

        if let Some(existing) = self.tree.find_by_str_id(node_id).await? {
            debug!(node_id, "entity already indexed");
            return Ok(AddOutcome::AlreadyExists {
                leaf_id: existing.id,
            });
        }

        let root = self.tree.root().await?.ok_or_else(|| {
            MemoryError::NotFound("tree root missing; open() the index first".to_string())
        })?;
        let query = self
            .embedder
            .encode_queries(&[text])
            .await?
            .pop()
            .ok_or_else(|| MemoryError::Backend(anyhow::anyhow!("embedder returned no vector")))?;
        let max_depth = self.tree.max_depth().await?;

        // Descend while a child clears the adaptive threshold
        let mut path: Vec<TreeNode> = Vec::new();
        let mut current = root;
        loop {
            let children = self.tree.child_nodes(&current.id).await?;
            if children.is_empty() {
                break;
            }
            let threshold = self.descent_threshold(path.len(), max_depth);
            match self.best_child(&children, &query, threshold).await? {
                Some((child, similarity)) => {
                    debug!(child = %child.id, similarity, threshold, "descending");
                    path.push(child.clone());
                    current = child;
                }
                None => break,
            }
        }

        // A leaf parent first becomes a branch point
        let mut parent = current;
        let mut ancestors = path;
        if parent.kind == TreeNodeKind::Leaf {
            parent = self.promote_leaf(&parent).await?;
            ancestors.pop();
            ancestors.push(parent.clone());
        }

        // Resummarize deepest to shallowest; each merge result carries up
        let mut carry = text.to_string();
        let mut updated: Vec<TreeNode> = Vec::new();
        for ancestor in ancestors.iter().rev() {
            let merged = match self.merger.merge(&ancestor.text, &carry, MERGE_CONTEXT).await {
                Ok(summary) if !summary.trim().is_empty() => summary,
                Ok(_) => {
                    warn!(ancestor = %ancestor.id, "merge returned empty text, concatenating");
                    format!("{}, {}", ancestor.text, carry)
                }
                Err(error) => {
                    warn!(ancestor = %ancestor.id, %error, "merge failed, concatenating");
                    format!("{}, {}", ancestor.text, carry)
                }
            };
            let mut node = ancestor.clone();
            node.text = merged.clone();
            node.descendants_num += 1;
            updated.push(node);
            carry = merged;
        }

        // Propagate new summaries to the vector collection and the tree
        if !updated.is_empty() {
            let texts: Vec<&str> = updated.iter().map(|n| n.text.as_str()).collect();
            let vectors = self.embedder.encode_passages(&texts).await?;
            let records: Vec<VectorRecord> = updated
                .iter()
                .zip(vectors)
                .map(|(node, vector)| VectorRecord {
                    id: node.id.clone(),
                    text: node.text.clone(),
                    vector,
                })
                .collect();
            self.vectors
                .update(TREE_SUMMARY_COLLECTION, &records)
                .await?;
            self.tree.update(&updated).await?;
            parent = updated[0].clone();
        }

        // Attach the new leaf
        let leaf = TreeNode::leaf(&parent.id, node_id, text, parent.depth + 1);
        self.tree.create(std::slice::from_ref(&leaf)).await?;
        let vector = self
            .embedder
            .encode_passages(&[text])
            .await?
            .pop()
            .ok_or_else(|| MemoryError::Backend(anyhow::anyhow!("embedder returned no vector")))?;
        self.vectors
            .create(
                TREE_LEAF_COLLECTION,
                &[VectorRecord {
                    id: leaf.id.clone(),
                    text: text.to_string(),
                    vector,
                }],
            )
            .await?;

        info!(leaf = %leaf.id, depth = leaf.depth, "indexed entity");
        Ok(AddOutcome::Inserted {
            leaf_id: leaf.id,
            depth: leaf.depth,
        })
    }

    /// Threshold tightens exponentially with depth, so early insertions land
    /// in broad buckets and later ones discriminate finer.
    fn descent_threshold(&self, depth: usize, max_depth: usize) -> f32 {
        let base = self.config.sim_threshold;
        if max_depth == 0 {
            return base;
        }
        let scaled = base * (self.config.depth_rate * depth as f32 / max_depth as f32).exp();
        scaled.min(MAX_DESCENT_THRESHOLD)
    }

    /// Highest-scoring child above the threshold, if any.
    async fn best_child(
        &self,
        children: &[TreeNode],
        query: &[f32],
        threshold: f32,
    ) -> Result<Option<(TreeNode, f32)>> {
        let leaf_ids: Vec<String> = children
            .iter()
            .filter(|c| c.kind == TreeNodeKind::Leaf)
            .map(|c| c.id.clone())
            .collect();
        let summary_ids: Vec<String> = children
            .iter()
            .filter(|c| c.kind == TreeNodeKind::Summarized)
            .map(|c| c.id.clone())
            .collect();

        let mut embeddings = self
            .vectors
            .read_embeddings(TREE_LEAF_COLLECTION, &leaf_ids)
            .await?;
        embeddings.extend(
            self.vectors
                .read_embeddings(TREE_SUMMARY_COLLECTION, &summary_ids)
                .await?,
        );

        let mut best: Option<(TreeNode, f32)> = None;
        for child in children {
            let Some(vector) = embeddings.get(&child.id) else {
                warn!(child = %child.id, "child has no stored embedding");
                continue;
            };
            let similarity = cosine_similarity(query, vector);
            if similarity < threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(_, s)| similarity > *s) {
                best = Some((child.clone(), similarity));
            }
        }
        Ok(best)
    }

    /// Convert a leaf into a summarized branch in place: its text becomes
    /// the first branch summary and the leaf content re-attaches one level
    /// deeper with a fresh internal id, keeping its embedding.
    async fn promote_leaf(&self, leaf: &TreeNode) -> Result<TreeNode> {
        let str_id = leaf.str_id.clone().ok_or_else(|| {
            MemoryError::ConsistencyViolation(format!("leaf {} carries no domain id", leaf.id))
        })?;
        let embeddings = self
            .vectors
            .read_embeddings(TREE_LEAF_COLLECTION, std::slice::from_ref(&leaf.id))
            .await?;
        let vector = embeddings.get(&leaf.id).cloned().ok_or_else(|| {
            MemoryError::ConsistencyViolation(format!("leaf {} has no stored embedding", leaf.id))
        })?;

        let mut branch = leaf.clone();
        branch.kind = TreeNodeKind::Summarized;
        branch.str_id = None;
        branch.descendants_num = 1; // the re-attached leaf
        self.tree.update(std::slice::from_ref(&branch)).await?;

        let reattached = TreeNode::leaf(&branch.id, &str_id, &leaf.text, leaf.depth + 1);
        self.tree.create(std::slice::from_ref(&reattached)).await?;

        self.vectors
            .delete(TREE_LEAF_COLLECTION, std::slice::from_ref(&leaf.id))
            .await?;
        self.vectors
            .create(
                TREE_LEAF_COLLECTION,
                &[VectorRecord {
                    id: reattached.id.clone(),
                    text: leaf.text.clone(),
                    vector: vector.clone(),
                }],
            )
            .await?;
        self.vectors
            .create(
                TREE_SUMMARY_COLLECTION,
                &[VectorRecord {
                    id: branch.id.clone(),
                    text: branch.text.clone(),
                    vector,
                }],
            )
            .await?;

        debug!(branch = %branch.id, "promoted leaf to summarized branch");
        Ok(branch)
    }

    /// Match free text to indexed entities using the configured thresholds.
    pub async fn match_entities(&self, text: &str) -> Result<Vec<TreeMatch>> {
        self.match_entities_with(
            text,
            self.config.match_distance,
            self.config.fetch_k,
            self.config.max_matches,
        )
        .await
    }

    /// Match free text to indexed entities. The nearest leaf and nearest
    /// summarized node compete; a summarized winner fans out to its leaf
    /// descendants, re-ranked and truncated to `max_n`.
    pub async fn match_entities_with(
        &self,
        text: &str,
        distance_threshold: f32,
        fetch_k: usize,
        max_n: usize,
    ) -> Result<Vec<TreeMatch>> {
        let query = self
            .embedder
            .encode_queries(&[text])
            .await?
            .pop()
            .ok_or_else(|| MemoryError::Backend(anyhow::anyhow!("embedder returned no vector")))?;

        let leaf_hits = self
            .vectors
            .query(TREE_LEAF_COLLECTION, &query, fetch_k)
            .await?;
        let summary_hits = self
            .vectors
            .query(TREE_SUMMARY_COLLECTION, &query, fetch_k)
            .await?;

        let best_leaf = leaf_hits.into_iter().next();
        let best_summary = summary_hits.into_iter().next();
        let leaf_ok = best_leaf
            .as_ref()
            .is_some_and(|h| h.distance <= distance_threshold);
        let summary_ok = best_summary
            .as_ref()
            .is_some_and(|h| h.distance <= distance_threshold);

        if !leaf_ok && !summary_ok {
            return Err(MemoryError::NotFound(format!(
                "no indexed entity within distance {} of {:?}",
                distance_threshold, text
            )));
        }

        let pick_summary = summary_ok
            && match (&best_leaf, &best_summary) {
                (Some(leaf), Some(summary)) if leaf_ok => summary.distance < leaf.distance,
                _ => true,
            };

        if pick_summary {
            if let Some(hit) = best_summary {
                return self.fan_out(&hit, &query, max_n).await;
            }
        } else if let Some(hit) = best_leaf {
            let node = self
                .tree
                .read(std::slice::from_ref(&hit.id))
                .await?
                .pop()
                .ok_or_else(|| {
                    MemoryError::ConsistencyViolation(format!(
                        "vector record {} has no tree node",
                        hit.id
                    ))
                })?;
            let str_id = node.str_id.ok_or_else(|| {
                MemoryError::ConsistencyViolation(format!("leaf {} carries no domain id", node.id))
            })?;
            return Ok(vec![TreeMatch {
                leaf_id: hit.id,
                str_id,
                text: node.text,
                distance: hit.distance,
            }]);
        }

        Err(MemoryError::NotFound(format!(
            "no indexed entity matched {:?}",
            text
        )))
    }

    async fn fan_out(&self, hit: &VectorHit, query: &[f32], max_n: usize) -> Result<Vec<TreeMatch>> {
        let leaves = self.tree.leaf_descendants(&hit.id).await?;
        let ids: Vec<String> = leaves.iter().map(|l| l.id.clone()).collect();
        let embeddings = self
            .vectors
            .read_embeddings(TREE_LEAF_COLLECTION, &ids)
            .await?;

        let mut matches: Vec<TreeMatch> = Vec::new();
        for leaf in leaves {
            let Some(str_id) = leaf.str_id.clone() else {
                warn!(leaf = %leaf.id, "leaf descendant carries no domain id");
                continue;
            };
            let distance = embeddings
                .get(&leaf.id)
                .map(|v| 1.0 - cosine_similarity(query, v))
                .unwrap_or(1.0);
            matches.push(TreeMatch {
                leaf_id: leaf.id,
                str_id,
                text: leaf.text,
                distance,
            });
        }
        matches.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        matches.truncate(max_n);

        debug!(branch = %hit.id, matches = matches.len(), "summarized branch won the match");
        Ok(matches)
    }

    /// Remove the leaf for a domain node id. A summarized ancestor left with
    /// a single leaf child collapses: the survivor takes its place and the
    /// branch is deleted. Summaries are truncated structurally, never
    /// re-generated.
    pub async fn remove_node(&self, str_id: &str) -> Result<bool> {
        let Some(leaf) = self.tree.find_by_str_id(str_id).await? else {
            return Ok(false);
        };

        // Ancestor chain, parent first
        let mut chain: Vec<TreeNode> = Vec::new();
        let mut cursor = leaf.parent_id.clone();
        while let Some(id) = cursor {
            let Some(node) = self.tree.read(std::slice::from_ref(&id)).await?.pop() else {
                break;
            };
            cursor = node.parent_id.clone();
            chain.push(node);
        }

        self.tree.delete(std::slice::from_ref(&leaf.id)).await?;
        self.vectors
            .delete(TREE_LEAF_COLLECTION, std::slice::from_ref(&leaf.id))
            .await?;

        // Every summarized ancestor loses one leaf descendant
        let decremented: Vec<TreeNode> = chain
            .iter()
            .filter(|n| n.kind == TreeNodeKind::Summarized)
            .cloned()
            .map(|mut n| {
                n.descendants_num = n.descendants_num.saturating_sub(1);
                n
            })
            .collect();
        if !decremented.is_empty() {
            self.tree.update(&decremented).await?;
        }

        // Contract emptied or single-leaf branches bottom-up
        let mut cursor = leaf.parent_id;
        while let Some(id) = cursor {
            let Some(node) = self.tree.read(std::slice::from_ref(&id)).await?.pop() else {
                break;
            };
            if node.kind != TreeNodeKind::Summarized {
                break;
            }
            let children = self.tree.child_nodes(&node.id).await?;
            if children.is_empty() {
                self.tree.delete(std::slice::from_ref(&node.id)).await?;
                self.vectors
                    .delete(TREE_SUMMARY_COLLECTION, std::slice::from_ref(&node.id))
                    .await?;
                cursor = node.parent_id.clone();
                continue;
            }
            if children.len() == 1 && children[0].kind == TreeNodeKind::Leaf {
                let mut survivor = children[0].clone();
                survivor.parent_id = node.parent_id.clone();
                survivor.depth = node.depth;
                self.tree.update(std::slice::from_ref(&survivor)).await?;
                self.tree.delete(std::slice::from_ref(&node.id)).await?;
                self.vectors
                    .delete(TREE_SUMMARY_COLLECTION, std::slice::from_ref(&node.id))
                    .await?;
                debug!(branch = %node.id, "collapsed single-leaf branch");
            }
            break;
        }

        info!(str_id, "removed entity from tree");
        Ok(true)
    }

    /// Verify structural invariants and the vector-store mirrors. Developer
    /// facing: a failure means a bug or a partial write, not bad user input.
    pub async fn check_consistency(&self) -> Result<()> {
        let counts = self.tree.count().await?;
        if counts.roots != 1 {
            return Err(MemoryError::ConsistencyViolation(format!(
                "expected exactly one root, found {}",
                counts.roots
            )));
        }
        let root = self.tree.root().await?.ok_or_else(|| {
            MemoryError::ConsistencyViolation("root counted but not readable".to_string())
        })?;

        let mut walked_leaves = 0usize;
        let mut walked_summarized = 0usize;
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let children = self.tree.child_nodes(&node.id).await?;
            match node.kind {
                TreeNodeKind::Leaf => {
                    if !children.is_empty() {
                        return Err(MemoryError::ConsistencyViolation(format!(
                            "leaf {} has {} children",
                            node.id,
                            children.len()
                        )));
                    }
                    walked_leaves += 1;
                }
                TreeNodeKind::Summarized => {
                    if children.is_empty() {
                        return Err(MemoryError::ConsistencyViolation(format!(
                            "summarized node {} has no children",
                            node.id
                        )));
                    }
                    walked_summarized += 1;
                }
                TreeNodeKind::Root => {}
            }
            stack.extend(children);
        }

        if walked_summarized > walked_leaves {
            return Err(MemoryError::ConsistencyViolation(format!(
                "{} summarized nodes exceed {} leaves",
                walked_summarized, walked_leaves
            )));
        }
        if walked_leaves != counts.leaves || walked_summarized != counts.summarized {
            return Err(MemoryError::ConsistencyViolation(format!(
                "tree holds unreachable nodes: walked {}/{} leaves, {}/{} summarized",
                walked_leaves, counts.leaves, walked_summarized, counts.summarized
            )));
        }

        let leaf_vectors = self.vectors.count(TREE_LEAF_COLLECTION).await?;
        if leaf_vectors != counts.leaves {
            return Err(MemoryError::ConsistencyViolation(format!(
                "{} tree leaves but {} leaf vectors",
                counts.leaves, leaf_vectors
            )));
        }
        let summary_vectors = self.vectors.count(TREE_SUMMARY_COLLECTION).await?;
        if summary_vectors != counts.summarized {
            return Err(MemoryError::ConsistencyViolation(format!(
                "{} summarized nodes but {} summary vectors",
                counts.summarized, summary_vectors
            )));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<TreeCounts> {
        Ok(self.tree.count().await?)
    }

    /// Reset the tree store and re-create the root. Leaf and summary vector
    /// records live on the vector backend; clear that first.
    pub async fn clear(&self) -> Result<()> {
        self.tree.clear().await?;
        self.tree.create(&[TreeNode::root()]).await?;
        Ok(())
    }
}

/// Cosine similarity between two vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryTreeBackend, MemoryVectorBackend};
    use crate::merge::MergeProvider;
    use crate::testutil::{FailingMerger, StubEmbedder, StubMerger};

    const APPLE: &str = "Apple Inc.";
    const APPLE_CORP: &str = "Apple Corporation";
    const APPLE_MERGED: &str = "Apple Inc.; Apple Corporation";
    const APPLE_WATCH: &str = "Apple Watch";
    const MICROSOFT: &str = "Microsoft Corp.";

    fn vocab_embedder() -> StubEmbedder {
        StubEmbedder::new(4)
            .define(APPLE, vec![1.0, 0.0, 0.0, 0.0])
            .define(APPLE_CORP, vec![0.9, 0.436, 0.0, 0.0])
            .define(APPLE_MERGED, vec![0.95, 0.3122, 0.0, 0.0])
            .define(APPLE_WATCH, vec![0.6, 0.2, 0.7746, 0.0])
            .define(MICROSOFT, vec![0.0, 0.0, 1.0, 0.0])
            .define("apple products", vec![0.95, 0.3122, 0.0, 0.0])
            .define("microsoft", vec![0.0, 0.0, 0.995, 0.0999])
            .define("quantum biology", vec![0.0, 0.0, 0.0, 1.0])
    }

    async fn index_with(merger: Arc<dyn MergeProvider>) -> SemanticTreeIndex {
        let index = SemanticTreeIndex::new(
            Arc::new(MemoryTreeBackend::new()),
            Arc::new(MemoryVectorBackend::new()),
            Arc::new(vocab_embedder()),
            merger,
            TreeConfig::default(),
        );
        index.open().await.unwrap();
        index
    }

    async fn index() -> SemanticTreeIndex {
        index_with(Arc::new(StubMerger)).await
    }

    #[tokio::test]
    async fn test_dissimilar_entities_branch_separately() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-msft", MICROSOFT).await.unwrap();

        let root = index.tree.root().await.unwrap().unwrap();
        let children = index.tree.child_nodes(&root.id).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.kind == TreeNodeKind::Leaf));

        let counts = index.count().await.unwrap();
        assert_eq!(counts.leaves, 2);
        assert_eq!(counts.summarized, 0);
        index.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_node_is_idempotent() {
        let index = index().await;
        let first = index.add_node("n-apple", APPLE).await.unwrap();
        let AddOutcome::Inserted { leaf_id, depth } = first else {
            panic!("first insert must create a leaf");
        };
        assert_eq!(depth, 1);

        let second = index.add_node("n-apple", APPLE).await.unwrap();
        match second {
            AddOutcome::AlreadyExists { leaf_id: existing } => assert_eq!(existing, leaf_id),
            AddOutcome::Inserted { .. } => panic!("second insert must be a no-op"),
        }
        assert_eq!(index.count().await.unwrap().leaves, 1);
    }

    #[tokio::test]
    async fn test_similar_entity_promotes_leaf() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-apple-corp", APPLE_CORP).await.unwrap();

        let root = index.tree.root().await.unwrap().unwrap();
        let children = index.tree.child_nodes(&root.id).await.unwrap();
        assert_eq!(children.len(), 1);

        let branch = &children[0];
        assert_eq!(branch.kind, TreeNodeKind::Summarized);
        assert_eq!(branch.descendants_num, 2);
        assert!(branch.str_id.is_none());
        assert_eq!(branch.text, APPLE_MERGED);

        // The original leaf re-attached one level deeper
        let leaves = index.tree.child_nodes(&branch.id).await.unwrap();
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|l| l.depth == 2));
        let reattached = leaves
            .iter()
            .find(|l| l.str_id.as_deref() == Some("n-apple"))
            .expect("original entity keeps its leaf");
        assert_eq!(reattached.text, APPLE);

        index.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn test_moderate_similarity_attaches_as_sibling() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-apple-corp", APPLE_CORP).await.unwrap();
        index.add_node("n-apple-watch", APPLE_WATCH).await.unwrap();

        let root = index.tree.root().await.unwrap().unwrap();
        let children = index.tree.child_nodes(&root.id).await.unwrap();
        assert_eq!(children.len(), 1);

        // Close enough to join the cluster, too far to pair with one member
        let branch = &children[0];
        assert_eq!(branch.descendants_num, 3);
        assert_eq!(index.tree.child_nodes(&branch.id).await.unwrap().len(), 3);
        assert_eq!(index.count().await.unwrap().leaves, 3);
        index.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_failure_falls_back_to_concatenation() {
        let index = index_with(Arc::new(FailingMerger)).await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-apple-corp", APPLE_CORP).await.unwrap();

        let root = index.tree.root().await.unwrap().unwrap();
        let branch = &index.tree.child_nodes(&root.id).await.unwrap()[0];
        assert_eq!(branch.kind, TreeNodeKind::Summarized);
        // The insert still proceeded, with degraded summary text
        assert_eq!(branch.text, format!("{}, {}", APPLE, APPLE_CORP));
        index.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn test_match_fans_out_from_summarized_winner() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-apple-corp", APPLE_CORP).await.unwrap();
        index.add_node("n-msft", MICROSOFT).await.unwrap();

        let matches = index.match_entities("apple products").await.unwrap();
        assert_eq!(matches.len(), 2);
        // Closest member first
        assert_eq!(matches[0].str_id, "n-apple-corp");
        assert_eq!(matches[1].str_id, "n-apple");
        assert!(matches[0].distance <= matches[1].distance);

        let truncated = index
            .match_entities_with("apple products", 0.35, 16, 1)
            .await
            .unwrap();
        assert_eq!(truncated.len(), 1);
    }

    #[tokio::test]
    async fn test_match_returns_single_leaf_winner() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-apple-corp", APPLE_CORP).await.unwrap();
        index.add_node("n-msft", MICROSOFT).await.unwrap();

        let matches = index.match_entities("microsoft").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].str_id, "n-msft");
    }

    #[tokio::test]
    async fn test_match_fails_beyond_distance_threshold() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-msft", MICROSOFT).await.unwrap();

        let err = index.match_entities("quantum biology").await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_collapses_single_leaf_branch() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-apple-corp", APPLE_CORP).await.unwrap();
        index.add_node("n-msft", MICROSOFT).await.unwrap();

        assert!(index.remove_node("n-apple-corp").await.unwrap());

        // The branch collapsed; the surviving leaf took its place
        let root = index.tree.root().await.unwrap().unwrap();
        let children = index.tree.child_nodes(&root.id).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.kind == TreeNodeKind::Leaf));
        let survivor = children
            .iter()
            .find(|c| c.str_id.as_deref() == Some("n-apple"))
            .expect("surviving leaf re-homed under root");
        assert_eq!(survivor.depth, 1);

        let counts = index.count().await.unwrap();
        assert_eq!(counts.leaves, 2);
        assert_eq!(counts.summarized, 0);
        index.check_consistency().await.unwrap();

        // Unknown ids are a quiet no-op
        assert!(!index.remove_node("n-unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_plain_sibling_keeps_branch() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-apple-corp", APPLE_CORP).await.unwrap();
        index.add_node("n-apple-watch", APPLE_WATCH).await.unwrap();

        assert!(index.remove_node("n-apple-watch").await.unwrap());

        let root = index.tree.root().await.unwrap().unwrap();
        let branch = &index.tree.child_nodes(&root.id).await.unwrap()[0];
        assert_eq!(branch.kind, TreeNodeKind::Summarized);
        assert_eq!(branch.descendants_num, 2);
        assert_eq!(index.tree.child_nodes(&branch.id).await.unwrap().len(), 2);
        index.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_consistency_catches_missing_vector() {
        let index = index().await;
        index.add_node("n-apple", APPLE).await.unwrap();
        index.add_node("n-msft", MICROSOFT).await.unwrap();
        index.check_consistency().await.unwrap();

        // Corrupt the mirror behind the index's back
        let leaf = index.tree.find_by_str_id("n-apple").await.unwrap().unwrap();
        index
            .vectors
            .delete(TREE_LEAF_COLLECTION, &[leaf.id])
            .await
            .unwrap();

        let err = index.check_consistency().await.unwrap_err();
        assert!(matches!(err, MemoryError::ConsistencyViolation(_)));
    }

    #[tokio::test]
    async fn test_descent_threshold_caps_at_depth() {
        let index = index().await;
        // Fresh tree: the base threshold applies as-is
        assert_eq!(index.descent_threshold(0, 0), 0.55);
        // Deeper trees tighten exponentially, capped
        let deep = index.descent_threshold(9, 10);
        assert!(deep > 0.55);
        assert!(deep <= MAX_DESCENT_THRESHOLD);
        assert_eq!(index.descent_threshold(40, 10), MAX_DESCENT_THRESHOLD);
    }
}
