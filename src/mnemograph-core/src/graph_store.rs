use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::driver::GraphDriver;
use crate::error::{MemoryError, Result};
use crate::models::{CreationReport, DeletionPlan, DeletionReport, GraphCounts, Node, Triplet};

/// Authoritative structural store. Decides what is new versus already
/// present on writes, and what is safe to physically delete; the vector
/// store obeys its deletion plans and never decides on its own.
pub struct GraphKnowledgeStore {
    driver: Arc<dyn GraphDriver>,
}

impl GraphKnowledgeStore {
    pub fn new(driver: Arc<dyn GraphDriver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<dyn GraphDriver> {
        &self.driver
    }

    /// Write triplets in fixed-size batches. Idempotent: a second call with
    /// the same input creates nothing and reports everything as existing.
    pub async fn create_triplets(
        &self,
        triplets: &[Triplet],
        batch_size: usize,
    ) -> Result<CreationReport> {
        for triplet in triplets {
            triplet.validate()?;
        }

        let mut report = CreationReport::default();
        for chunk in triplets.chunks(batch_size.max(1)) {
            self.create_batch(chunk, &mut report).await?;
        }

        debug!(
            created_triplets = report.created_triplets.len(),
            existing_triplets = report.existing_triplets.len(),
            created_nodes = report.created_nodes.len(),
            "graph create finished"
        );
        Ok(report)
    }

    async fn create_batch(&self, chunk: &[Triplet], report: &mut CreationReport) -> Result<()> {
        // Call-scoped accumulators: what this batch will physically write.
        let mut new_triplets: Vec<Triplet> = Vec::new();
        let mut new_nodes: Vec<Node> = Vec::new();

        for triplet in chunk {
            // Repeats within the call are skipped outright
            if report.created_triplets.contains(&triplet.id)
                || report.existing_triplets.contains(&triplet.id)
            {
                continue;
            }

            if self.driver.triplet_exists(&triplet.id).await? {
                report.existing_triplets.insert(triplet.id.clone());
                for node in triplet.nodes() {
                    if !report.created_nodes.contains(&node.id) {
                        report.existing_nodes.insert(node.id.clone());
                    }
                }
                continue;
            }

            report.created_triplets.insert(triplet.id.clone());
            new_triplets.push(triplet.clone());

            // Record which endpoints this new triplet brings along
            for node in triplet.nodes() {
                if report.created_nodes.contains(&node.id)
                    || report.existing_nodes.contains(&node.id)
                {
                    continue;
                }
                if self.driver.node_exists(&node.id).await? {
                    report.existing_nodes.insert(node.id.clone());
                } else {
                    report.created_nodes.insert(node.id.clone());
                    new_nodes.push(node.clone());
                }
            }
        }

        if !new_nodes.is_empty() {
            self.driver.create_nodes(&new_nodes).await?;
        }
        if !new_triplets.is_empty() {
            self.driver.create_triplets(&new_triplets).await?;
        }
        Ok(())
    }

    /// Delete triplets, computing a per-triplet plan first. The structural
    /// deletion (edge plus any orphaned endpoint) is applied here; the
    /// returned plans are for the vector store to obey.
    pub async fn delete_triplets(
        &self,
        triplets: &[Triplet],
    ) -> Result<(DeletionReport, Vec<DeletionPlan>)> {
        for triplet in triplets {
            triplet.validate()?;
        }

        // Validate the whole call before writing anything
        for triplet in triplets {
            if !self.driver.triplet_exists(&triplet.id).await? {
                return Err(MemoryError::NotFound(format!(
                    "triplet {} is not stored",
                    triplet.id
                )));
            }
            for node in [&triplet.start, &triplet.end] {
                if !self.driver.node_exists(&node.id).await? {
                    return Err(MemoryError::InvalidInput(format!(
                        "endpoint node {} is not stored",
                        node.id
                    )));
                }
            }
        }

        let mut report = DeletionReport::default();
        let mut plans = Vec::with_capacity(triplets.len());
        let mut seen: HashSet<&str> = HashSet::new();

        for triplet in triplets {
            // Repeated ids in one call are no-ops with an empty plan
            if !seen.insert(triplet.id.as_str()) {
                plans.push(DeletionPlan::default());
                continue;
            }

            let plan = self.plan_deletion(triplet).await?;

            self.driver
                .delete_triplets(std::slice::from_ref(&triplet.id))
                .await?;
            report.deleted_triplets.push(triplet.id.clone());

            let mut orphaned = Vec::new();
            if plan.delete_start_node {
                orphaned.push(triplet.start.id.clone());
            }
            if plan.delete_end_node && triplet.end.id != triplet.start.id {
                orphaned.push(triplet.end.id.clone());
            }
            if !orphaned.is_empty() {
                self.driver.delete_nodes(&orphaned).await?;
                report.deleted_nodes.extend(orphaned);
            }

            plans.push(plan);
        }

        debug!(
            deleted_triplets = report.deleted_triplets.len(),
            deleted_nodes = report.deleted_nodes.len(),
            "graph delete finished"
        );
        Ok((report, plans))
    }

    /// Decide what removing this edge makes deletable, from current state.
    async fn plan_deletion(&self, triplet: &Triplet) -> Result<DeletionPlan> {
        let forward = self
            .driver
            .triplets_between(&triplet.start.id, &triplet.end.id)
            .await?
            .len();
        let backward = if triplet.start.id == triplet.end.id {
            0
        } else {
            self.driver
                .triplets_between(&triplet.end.id, &triplet.start.id)
                .await?
                .len()
        };
        // Removing the edge orphans an endpoint only when its sole neighbor
        // is the other endpoint and no parallel edge remains between them.
        let sole_pair_edge = forward + backward == 1;

        let start_adjacent = self.driver.adjacent_node_ids(&triplet.start.id).await?;
        let delete_start_node = sole_pair_edge
            && start_adjacent.len() == 1
            && start_adjacent[0] == triplet.end.id;

        let end_adjacent = self.driver.adjacent_node_ids(&triplet.end.id).await?;
        let delete_end_node =
            sole_pair_edge && end_adjacent.len() == 1 && end_adjacent[0] == triplet.start.id;

        let delete_relation_mirror = self
            .driver
            .relation_occurrences(&triplet.relation.id)
            .await?
            == 1;

        Ok(DeletionPlan {
            delete_start_node,
            delete_end_node,
            delete_relation_mirror,
        })
    }

    pub async fn count(&self) -> Result<GraphCounts> {
        Ok(self.driver.count().await?)
    }

    pub async fn clear(&self) -> Result<()> {
        Ok(self.driver.clear().await?)
    }
}
