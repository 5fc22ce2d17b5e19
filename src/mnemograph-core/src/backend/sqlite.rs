use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, VecDeque};

use crate::driver::{GraphDriver, TreeDriver, VectorDriver, VectorHit, VectorRecord};
use crate::models::{
    GraphCounts, Node, NodeKind, Relation, RelationKind, TreeCounts, TreeNode, TreeNodeKind,
    Triplet,
};

/// Connect to a database file, creating it if absent.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    let pool = SqlitePool::connect(&format!("sqlite://{}?mode=rwc", path))
        .await
        .context("Failed to connect to database")?;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    Ok(pool)
}

/// In-process database for tests and ephemeral runs. A single connection
/// keeps every caller on the same `:memory:` database.
pub async fn connect_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory database")?;
    Ok(pool)
}

/// SQLite graph backend.
pub struct SqliteGraphBackend {
    pool: SqlitePool,
}

impl SqliteGraphBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn node_map(&self, ids: &[String]) -> Result<HashMap<String, Node>> {
        let nodes = self.read_nodes(ids).await?;
        Ok(nodes.into_iter().map(|n| (n.id.clone(), n)).collect())
    }
}

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Result<Node> {
    let kind: String = row.get("kind");
    let properties_json: String = row.get("properties");
    Ok(Node {
        id: row.get("id"),
        name: row.get("name"),
        kind: NodeKind::parse(&kind).with_context(|| format!("unknown node kind: {}", kind))?,
        properties: serde_json::from_str(&properties_json).unwrap_or_default(),
    })
}

fn row_to_triplet(
    row: &sqlx::sqlite::SqliteRow,
    nodes: &HashMap<String, Node>,
) -> Result<Option<Triplet>> {
    let start_id: String = row.get("start_id");
    let end_id: String = row.get("end_id");
    let time_id: Option<String> = row.get("time_id");

    let (Some(start), Some(end)) = (nodes.get(&start_id), nodes.get(&end_id)) else {
        return Ok(None);
    };
    let time = match &time_id {
        Some(id) => match nodes.get(id) {
            Some(node) => Some(node.clone()),
            None => return Ok(None),
        },
        None => None,
    };

    let relation_kind: String = row.get("relation_kind");
    let relation_properties: String = row.get("relation_properties");
    Ok(Some(Triplet {
        start: start.clone(),
        relation: Relation {
            id: row.get("relation_id"),
            name: row.get("relation_name"),
            kind: RelationKind::parse(&relation_kind)
                .with_context(|| format!("unknown relation kind: {}", relation_kind))?,
            properties: serde_json::from_str(&relation_properties).unwrap_or_default(),
        },
        end: end.clone(),
        time,
        id: row.get("id"),
        stringified: row.get("stringified"),
    }))
}

#[async_trait]
impl GraphDriver for SqliteGraphBackend {
    async fn open(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kg_nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                properties TEXT NOT NULL,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kg_triplets (
                id TEXT PRIMARY KEY,
                start_id TEXT NOT NULL,
                end_id TEXT NOT NULL,
                relation_id TEXT NOT NULL,
                relation_name TEXT NOT NULL,
                relation_kind TEXT NOT NULL,
                relation_properties TEXT NOT NULL,
                time_id TEXT DEFAULT NULL,
                stringified TEXT NOT NULL,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_triplets_start ON kg_triplets(start_id)",
            "CREATE INDEX IF NOT EXISTS idx_triplets_end ON kg_triplets(end_id)",
            "CREATE INDEX IF NOT EXISTS idx_triplets_relation ON kg_triplets(relation_id)",
        ] {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn create_nodes(&self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            let properties_json = serde_json::to_string(&node.properties)?;
            sqlx::query(
                r#"
                INSERT INTO kg_nodes (id, name, kind, properties, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&node.id)
            .bind(&node.name)
            .bind(node.kind.as_str())
            .bind(&properties_json)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn create_triplets(&self, triplets: &[Triplet]) -> Result<()> {
        for triplet in triplets {
            let relation_properties = serde_json::to_string(&triplet.relation.properties)?;
            sqlx::query(
                r#"
                INSERT INTO kg_triplets
                    (id, start_id, end_id, relation_id, relation_name, relation_kind,
                     relation_properties, time_id, stringified, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&triplet.id)
            .bind(&triplet.start.id)
            .bind(&triplet.end.id)
            .bind(&triplet.relation.id)
            .bind(&triplet.relation.name)
            .bind(triplet.relation.kind.as_str())
            .bind(&relation_properties)
            .bind(triplet.time.as_ref().map(|t| t.id.as_str()))
            .bind(&triplet.stringified)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn read_nodes(&self, ids: &[String]) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for id in ids {
            let row = sqlx::query(
                "SELECT id, name, kind, properties FROM kg_nodes WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                nodes.push(row_to_node(&row)?);
            }
        }
        Ok(nodes)
    }

    async fn update_nodes(&self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            let row = sqlx::query("SELECT properties FROM kg_nodes WHERE id = ?")
                .bind(&node.id)
                .fetch_optional(&self.pool)
                .await?
                .with_context(|| format!("node {} not stored", node.id))?;

            let properties_json: String = row.get("properties");
            let mut properties: HashMap<String, serde_json::Value> =
                serde_json::from_str(&properties_json).unwrap_or_default();
            properties.extend(node.properties.iter().map(|(k, v)| (k.clone(), v.clone())));

            sqlx::query("UPDATE kg_nodes SET properties = ? WHERE id = ?")
                .bind(serde_json::to_string(&properties)?)
                .bind(&node.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn delete_nodes(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM kg_triplets WHERE start_id = ? OR end_id = ?")
                .bind(id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM kg_nodes WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn delete_triplets(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM kg_triplets WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn count(&self) -> Result<GraphCounts> {
        let nodes: i64 = sqlx::query("SELECT COUNT(*) AS count FROM kg_nodes")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        let triplets: i64 = sqlx::query("SELECT COUNT(*) AS count FROM kg_triplets")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        Ok(GraphCounts {
            nodes: nodes as usize,
            triplets: triplets as usize,
        })
    }

    async fn node_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM kg_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn triplet_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM kg_triplets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM kg_triplets")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM kg_nodes")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn adjacent_node_ids(&self, node_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT end_id AS neighbor FROM kg_triplets WHERE start_id = ?
            UNION
            SELECT start_id AS neighbor FROM kg_triplets WHERE end_id = ?
            "#,
        )
        .bind(node_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("neighbor")).collect())
    }

    async fn triplets_between(&self, start_id: &str, end_id: &str) -> Result<Vec<Triplet>> {
        let rows = sqlx::query(
            r#"
            SELECT id, start_id, end_id, relation_id, relation_name, relation_kind,
                   relation_properties, time_id, stringified
            FROM kg_triplets
            WHERE start_id = ? AND end_id = ?
            "#,
        )
        .bind(start_id)
        .bind(end_id)
        .fetch_all(&self.pool)
        .await?;

        let mut node_ids = vec![start_id.to_string(), end_id.to_string()];
        for row in &rows {
            let time_id: Option<String> = row.get("time_id");
            if let Some(id) = time_id {
                node_ids.push(id);
            }
        }
        let nodes = self.node_map(&node_ids).await?;

        let mut triplets = Vec::new();
        for row in &rows {
            if let Some(triplet) = row_to_triplet(row, &nodes)? {
                triplets.push(triplet);
            }
        }
        Ok(triplets)
    }

    async fn node_kind(&self, id: &str) -> Result<Option<NodeKind>> {
        let row = sqlx::query("SELECT kind FROM kg_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let kind: String = row.get("kind");
                Ok(NodeKind::parse(&kind))
            }
            None => Ok(None),
        }
    }

    async fn relation_occurrences(&self, relation_id: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM kg_triplets WHERE relation_id = ?")
                .bind(relation_id)
                .fetch_one(&self.pool)
                .await?
                .get("count");
        Ok(count as usize)
    }
}

/// SQLite vector backend with brute-force cosine scoring.
pub struct SqliteVectorBackend {
    pool: SqlitePool,
}

impl SqliteVectorBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorDriver for SqliteVectorBackend {
    async fn open(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                text TEXT NOT NULL,
                vector BLOB NOT NULL,
                created_at DATETIME NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO vector_records (collection, id, text, vector, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    text = excluded.text,
                    vector = excluded.vector,
                    created_at = excluded.created_at
                "#,
            )
            .bind(collection)
            .bind(&record.id)
            .bind(&record.text)
            .bind(serialize_vector(&record.vector))
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn read(&self, collection: &str, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let mut records = Vec::new();
        for id in ids {
            let row = sqlx::query(
                "SELECT id, text, vector FROM vector_records WHERE collection = ? AND id = ?",
            )
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                let vector_bytes: Vec<u8> = row.get("vector");
                records.push(VectorRecord {
                    id: row.get("id"),
                    text: row.get("text"),
                    vector: deserialize_vector(&vector_bytes),
                });
            }
        }
        Ok(records)
    }

    async fn update(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        self.create(collection, records).await
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM vector_records WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM vector_records WHERE collection = ?")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?
                .get("count");
        Ok(count as usize)
    }

    async fn item_exists(&self, collection: &str, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM vector_records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM vector_records")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query("SELECT id, text, vector FROM vector_records WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::new();
        for row in rows {
            let vector_bytes: Vec<u8> = row.get("vector");
            let stored = deserialize_vector(&vector_bytes);
            let similarity = super::memory::cosine_similarity(vector, &stored);
            hits.push(VectorHit {
                id: row.get("id"),
                text: row.get("text"),
                distance: 1.0 - similarity,
            });
        }

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
        let mut embeddings = HashMap::new();
        for id in ids {
            let row = sqlx::query(
                "SELECT vector FROM vector_records WHERE collection = ? AND id = ?",
            )
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                let vector_bytes: Vec<u8> = row.get("vector");
                embeddings.insert(id.clone(), deserialize_vector(&vector_bytes));
            }
        }
        Ok(embeddings)
    }
}

/// SQLite tree backend.
pub struct SqliteTreeBackend {
    pool: SqlitePool,
}

impl SqliteTreeBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_tree_node(row: &sqlx::sqlite::SqliteRow) -> Result<TreeNode> {
    let kind: String = row.get("kind");
    let depth: i64 = row.get("depth");
    let descendants_num: i64 = row.get("descendants_num");
    Ok(TreeNode {
        id: row.get("id"),
        text: row.get("text"),
        kind: TreeNodeKind::parse(&kind)
            .with_context(|| format!("unknown tree node kind: {}", kind))?,
        parent_id: row.get("parent_id"),
        str_id: row.get("str_id"),
        depth: depth as usize,
        descendants_num: descendants_num as usize,
    })
}

const TREE_NODE_COLUMNS: &str = "id, parent_id, kind, text, str_id, depth, descendants_num";

#[async_trait]
impl TreeDriver for SqliteTreeBackend {
    async fn open(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tree_nodes (
                id TEXT PRIMARY KEY,
                parent_id TEXT DEFAULT NULL,
                kind TEXT NOT NULL,
                text TEXT NOT NULL,
                str_id TEXT DEFAULT NULL,
                depth INTEGER NOT NULL,
                descendants_num INTEGER NOT NULL,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_tree_parent ON tree_nodes(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_tree_str_id ON tree_nodes(str_id) WHERE str_id IS NOT NULL",
        ] {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, nodes: &[TreeNode]) -> Result<()> {
        for node in nodes {
            if node.kind == TreeNodeKind::Root && self.root().await?.is_some() {
                anyhow::bail!("tree already has a root");
            }
            sqlx::query(
                r#"
                INSERT INTO tree_nodes
                    (id, parent_id, kind, text, str_id, depth, descendants_num, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.id)
            .bind(&node.parent_id)
            .bind(node.kind.as_str())
            .bind(&node.text)
            .bind(&node.str_id)
            .bind(node.depth as i64)
            .bind(node.descendants_num as i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn read(&self, ids: &[String]) -> Result<Vec<TreeNode>> {
        let mut nodes = Vec::new();
        for id in ids {
            let sql = format!("SELECT {} FROM tree_nodes WHERE id = ?", TREE_NODE_COLUMNS);
            let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
            if let Some(row) = row {
                nodes.push(row_to_tree_node(&row)?);
            }
        }
        Ok(nodes)
    }

    async fn update(&self, nodes: &[TreeNode]) -> Result<()> {
        for node in nodes {
            let result = sqlx::query(
                r#"
                UPDATE tree_nodes
                SET parent_id = ?, kind = ?, text = ?, str_id = ?, depth = ?, descendants_num = ?
                WHERE id = ?
                "#,
            )
            .bind(&node.parent_id)
            .bind(node.kind.as_str())
            .bind(&node.text)
            .bind(&node.str_id)
            .bind(node.depth as i64)
            .bind(node.descendants_num as i64)
            .bind(&node.id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                anyhow::bail!("tree node {} not stored", node.id);
            }
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM tree_nodes WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn count(&self) -> Result<TreeCounts> {
        let rows = sqlx::query("SELECT kind, COUNT(*) AS count FROM tree_nodes GROUP BY kind")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = TreeCounts::default();
        for row in rows {
            let kind: String = row.get("kind");
            let count: i64 = row.get("count");
            match TreeNodeKind::parse(&kind) {
                Some(TreeNodeKind::Root) => counts.roots = count as usize,
                Some(TreeNodeKind::Leaf) => counts.leaves = count as usize,
                Some(TreeNodeKind::Summarized) => counts.summarized = count as usize,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn item_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM tree_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM tree_nodes")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn root(&self) -> Result<Option<TreeNode>> {
        let sql = format!(
            "SELECT {} FROM tree_nodes WHERE kind = 'root' LIMIT 1",
            TREE_NODE_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.map(|r| row_to_tree_node(&r)).transpose()
    }

    async fn child_nodes(&self, parent_id: &str) -> Result<Vec<TreeNode>> {
        let sql = format!(
            "SELECT {} FROM tree_nodes WHERE parent_id = ? ORDER BY created_at ASC",
            TREE_NODE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_tree_node).collect()
    }

    async fn leaf_descendants(&self, id: &str) -> Result<Vec<TreeNode>> {
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(id.to_string());
        let mut leaves = Vec::new();
        while let Some(current) = queue.pop_front() {
            for child in self.child_nodes(&current).await? {
                match child.kind {
                    TreeNodeKind::Leaf => leaves.push(child),
                    _ => queue.push_back(child.id),
                }
            }
        }
        Ok(leaves)
    }

    async fn max_depth(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COALESCE(MAX(depth), 0) AS depth FROM tree_nodes")
            .fetch_one(&self.pool)
            .await?;
        let depth: i64 = row.get("depth");
        Ok(depth as usize)
    }

    async fn find_by_str_id(&self, str_id: &str) -> Result<Option<TreeNode>> {
        let sql = format!(
            "SELECT {} FROM tree_nodes WHERE str_id = ? LIMIT 1",
            TREE_NODE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(str_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_tree_node(&r)).transpose()
    }
}

/// Serialize vector to bytes (little-endian Float32).
fn serialize_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Deserialize vector from bytes.
fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    let mut vector = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        vector.push(value);
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn graph_backend() -> SqliteGraphBackend {
        let backend = SqliteGraphBackend::new(connect_memory().await.unwrap());
        backend.open().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_graph_roundtrip() {
        let backend = graph_backend().await;
        let triplet = Triplet::simple("Paris", "capital_of", "France");
        let nodes: Vec<Node> = triplet.nodes().cloned().collect();

        backend.create_nodes(&nodes).await.unwrap();
        backend
            .create_triplets(std::slice::from_ref(&triplet))
            .await
            .unwrap();

        assert!(backend.node_exists(&triplet.start.id).await.unwrap());
        assert!(backend.triplet_exists(&triplet.id).await.unwrap());
        assert_eq!(
            backend.count().await.unwrap(),
            GraphCounts {
                nodes: 2,
                triplets: 1
            }
        );

        let between = backend
            .triplets_between(&triplet.start.id, &triplet.end.id)
            .await
            .unwrap();
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].id, triplet.id);
        assert_eq!(between[0].stringified, triplet.stringified);

        assert_eq!(
            backend.adjacent_node_ids(&triplet.start.id).await.unwrap(),
            vec![triplet.end.id.clone()]
        );
        assert_eq!(
            backend
                .relation_occurrences(&triplet.relation.id)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            backend.node_kind(&triplet.start.id).await.unwrap(),
            Some(NodeKind::Object)
        );
    }

    #[tokio::test]
    async fn test_graph_create_is_idempotent_per_id() {
        let backend = graph_backend().await;
        let triplet = Triplet::simple("Paris", "capital_of", "France");
        let nodes: Vec<Node> = triplet.nodes().cloned().collect();

        for _ in 0..2 {
            backend.create_nodes(&nodes).await.unwrap();
            backend
                .create_triplets(std::slice::from_ref(&triplet))
                .await
                .unwrap();
        }

        assert_eq!(
            backend.count().await.unwrap(),
            GraphCounts {
                nodes: 2,
                triplets: 1
            }
        );
    }

    #[tokio::test]
    async fn test_graph_persists_across_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let path = path.to_str().unwrap();

        let triplet = Triplet::simple("Paris", "capital_of", "France");
        {
            let backend = SqliteGraphBackend::new(connect(path).await.unwrap());
            backend.open().await.unwrap();
            let nodes: Vec<Node> = triplet.nodes().cloned().collect();
            backend.create_nodes(&nodes).await.unwrap();
            backend
                .create_triplets(std::slice::from_ref(&triplet))
                .await
                .unwrap();
        }

        let backend = SqliteGraphBackend::new(connect(path).await.unwrap());
        backend.open().await.unwrap();
        assert!(backend.triplet_exists(&triplet.id).await.unwrap());
        assert_eq!(backend.count().await.unwrap().nodes, 2);
    }

    #[tokio::test]
    async fn test_update_nodes_merges_properties() {
        let backend = graph_backend().await;
        let node = Node::object("Paris").with_property("population", serde_json::json!(2102650));
        backend
            .create_nodes(std::slice::from_ref(&node))
            .await
            .unwrap();

        let update =
            Node::object("Paris").with_property("country", serde_json::json!("France"));
        backend
            .update_nodes(std::slice::from_ref(&update))
            .await
            .unwrap();

        let stored = backend
            .read_nodes(std::slice::from_ref(&node.id))
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(stored.properties.len(), 2);
        assert_eq!(
            stored.properties.get("population"),
            Some(&serde_json::json!(2102650))
        );
    }

    #[tokio::test]
    async fn test_vector_roundtrip_and_query() {
        let backend = SqliteVectorBackend::new(connect_memory().await.unwrap());
        backend.open().await.unwrap();

        backend
            .create(
                "nodes",
                &[
                    VectorRecord {
                        id: "a".to_string(),
                        text: "alpha".to_string(),
                        vector: vec![1.0, 0.0],
                    },
                    VectorRecord {
                        id: "b".to_string(),
                        text: "beta".to_string(),
                        vector: vec![0.0, 1.0],
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(backend.count("nodes").await.unwrap(), 2);
        assert!(backend.item_exists("nodes", "a").await.unwrap());
        assert!(!backend.item_exists("relations", "a").await.unwrap());

        let hits = backend.query("nodes", &[0.9, 0.1], 1).await.unwrap();
        assert_eq!(hits[0].id, "a");

        let embeddings = backend
            .read_embeddings("nodes", &["b".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings["b"], vec![0.0, 1.0]);

        backend.delete("nodes", &["a".to_string()]).await.unwrap();
        assert_eq!(backend.count("nodes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tree_structure_roundtrip() {
        let backend = SqliteTreeBackend::new(connect_memory().await.unwrap());
        backend.open().await.unwrap();

        let root = TreeNode::root();
        backend.create(std::slice::from_ref(&root)).await.unwrap();
        assert!(backend.create(&[TreeNode::root()]).await.is_err());

        let mut branch = TreeNode::leaf(&root.id, "n1", "branch", 1);
        branch.kind = TreeNodeKind::Summarized;
        branch.str_id = None;
        branch.descendants_num = 2;
        backend.create(std::slice::from_ref(&branch)).await.unwrap();

        let leaf_a = TreeNode::leaf(&branch.id, "n2", "a", 2);
        let leaf_b = TreeNode::leaf(&branch.id, "n3", "b", 2);
        backend
            .create(&[leaf_a.clone(), leaf_b.clone()])
            .await
            .unwrap();

        let counts = backend.count().await.unwrap();
        assert_eq!(counts.roots, 1);
        assert_eq!(counts.summarized, 1);
        assert_eq!(counts.leaves, 2);

        assert_eq!(backend.child_nodes(&branch.id).await.unwrap().len(), 2);
        assert_eq!(backend.leaf_descendants(&root.id).await.unwrap().len(), 2);
        assert_eq!(backend.max_depth().await.unwrap(), 2);

        let found = backend.find_by_str_id("n3").await.unwrap().unwrap();
        assert_eq!(found.id, leaf_b.id);

        backend.delete(&[leaf_b.id.clone()]).await.unwrap();
        assert!(backend.find_by_str_id("n3").await.unwrap().is_none());
    }
}
