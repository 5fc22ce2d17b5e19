use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{MemoryError, Result};
use crate::ident::{canonicalize, content_id};

/// Node category in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Object,
    Hyper,
    Episodic,
    Time,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Object => "object",
            NodeKind::Hyper => "hyper",
            NodeKind::Episodic => "episodic",
            NodeKind::Time => "time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "object" => Some(NodeKind::Object),
            "hyper" => Some(NodeKind::Hyper),
            "episodic" => Some(NodeKind::Episodic),
            "time" => Some(NodeKind::Time),
            _ => None,
        }
    }
}

/// Relation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Simple,
    Hyper,
    Episodic,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Simple => "simple",
            RelationKind::Hyper => "hyper",
            RelationKind::Episodic => "episodic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(RelationKind::Simple),
            "hyper" => Some(RelationKind::Hyper),
            "episodic" => Some(RelationKind::Episodic),
            _ => None,
        }
    }
}

/// A graph node. The id is content-addressed from the canonical name and
/// kind, so the same entity always resolves to the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        let name = name.into();
        let id = content_id(&format!("{}|{}", kind.as_str(), canonicalize(&name)));
        Self {
            id,
            name,
            kind,
            properties: HashMap::new(),
        }
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Object)
    }

    pub fn time(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Time)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MemoryError::InvalidInput("node name is empty".to_string()));
        }
        if self.id.is_empty() {
            return Err(MemoryError::InvalidInput("node id is empty".to_string()));
        }
        Ok(())
    }
}

/// A relation between two nodes.
///
/// The id is the content hash of the canonical triplet string, so every
/// triplet expressing the same fact shares one relation id. It is assigned
/// when the relation is assembled into a [`Triplet`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub name: String,
    pub kind: RelationKind,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl Relation {
    pub fn new(name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            kind,
            properties: HashMap::new(),
        }
    }

    pub fn simple(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::Simple)
    }
}

/// Property key under which a relation references its time node.
pub const TIME_PROPERTY: &str = "time_id";

/// The unit of write and delete: `(start, relation, end)` plus an optional
/// time node. Callers never mutate nodes or relations directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triplet {
    pub start: Node,
    pub relation: Relation,
    pub end: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Node>,
    /// Structural id: distinct per (start id, relation id, end id, time id).
    pub id: String,
    /// Cached canonical form, also the relation id's hash input.
    pub stringified: String,
}

impl Triplet {
    pub fn new(start: Node, mut relation: Relation, end: Node, time: Option<Node>) -> Self {
        let stringified = format!(
            "{} {} {}",
            canonicalize(&start.name),
            canonicalize(&relation.name),
            canonicalize(&end.name)
        );
        relation.id = content_id(&stringified);
        if let Some(t) = &time {
            relation
                .properties
                .insert(TIME_PROPERTY.to_string(), serde_json::json!(t.id));
        }
        let time_id = time.as_ref().map(|t| t.id.as_str()).unwrap_or("");
        let id = content_id(&format!(
            "{}|{}|{}|{}",
            start.id, relation.id, end.id, time_id
        ));
        Self {
            start,
            relation,
            end,
            time,
            id,
            stringified,
        }
    }

    /// Convenience constructor for an object-to-object fact.
    pub fn simple(
        start: impl Into<String>,
        relation: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self::new(
            Node::object(start),
            Relation::simple(relation),
            Node::object(end),
            None,
        )
    }

    /// All nodes carried by this triplet, time node included.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        [&self.start, &self.end]
            .into_iter()
            .chain(self.time.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        self.start.validate()?;
        self.end.validate()?;
        if let Some(t) = &self.time {
            t.validate()?;
        }
        if self.relation.name.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "relation name is empty".to_string(),
            ));
        }
        if self.id.is_empty() || self.relation.id.is_empty() {
            return Err(MemoryError::InvalidInput(
                "triplet was not constructed via Triplet::new".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tree entry category in the semantic index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeNodeKind {
    Root,
    Leaf,
    Summarized,
}

impl TreeNodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeNodeKind::Root => "root",
            TreeNodeKind::Leaf => "leaf",
            TreeNodeKind::Summarized => "summarized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(TreeNodeKind::Root),
            "leaf" => Some(TreeNodeKind::Leaf),
            "summarized" => Some(TreeNodeKind::Summarized),
            _ => None,
        }
    }
}

/// An entry in the semantic tree. Ids are opaque and internal; leaves carry
/// the domain node id they represent in `str_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub text: String,
    pub kind: TreeNodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str_id: Option<String>,
    #[serde(default)]
    pub depth: usize,
    /// Number of leaf descendants. Only meaningful on summarized nodes.
    #[serde(default)]
    pub descendants_num: usize,
}

impl TreeNode {
    pub fn root() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: String::new(),
            kind: TreeNodeKind::Root,
            parent_id: None,
            str_id: None,
            depth: 0,
            descendants_num: 0,
        }
    }

    pub fn leaf(parent_id: &str, str_id: &str, text: &str, depth: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            kind: TreeNodeKind::Leaf,
            parent_id: Some(parent_id.to_string()),
            str_id: Some(str_id.to_string()),
            depth,
            descendants_num: 0,
        }
    }
}

/// What a batched create actually did, as id sets. "Existed" is the
/// idempotent classification, not a failure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreationReport {
    pub created_triplets: HashSet<String>,
    pub existing_triplets: HashSet<String>,
    pub created_nodes: HashSet<String>,
    pub existing_nodes: HashSet<String>,
}

/// Per-triplet deletion decisions computed by the graph store and obeyed by
/// the vector store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionPlan {
    /// The start node's only adjacency was the end node; removing the edge
    /// orphans it.
    pub delete_start_node: bool,
    pub delete_end_node: bool,
    /// This was the last structural occurrence of the relation's canonical
    /// id, so its vector mirror goes too.
    pub delete_relation_mirror: bool,
}

/// Structural deletions already applied to the graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeletionReport {
    pub deleted_triplets: Vec<String>,
    pub deleted_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub nodes: usize,
    pub triplets: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VectorCounts {
    pub nodes: usize,
    pub relations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeCounts {
    pub roots: usize,
    pub leaves: usize,
    pub summarized: usize,
}

/// Aggregate view across all three layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryCounts {
    pub graph: GraphCounts,
    pub vector: VectorCounts,
    pub tree: TreeCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_content_addressed() {
        let a = Node::object("Paris");
        let b = Node::object("  paris ");
        assert_eq!(a.id, b.id);

        // Kind participates in the id
        let c = Node::new("Paris", NodeKind::Episodic);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_relation_id_shared_across_structural_variants() {
        let t1 = Triplet::simple("Paris", "capital_of", "France");
        let t2 = Triplet::new(
            Node::new("Paris", NodeKind::Episodic),
            Relation::simple("capital_of"),
            Node::object("France"),
            None,
        );

        // Same canonical string, same relation id
        assert_eq!(t1.relation.id, t2.relation.id);
        assert_eq!(t1.stringified, "paris capital_of france");

        // Different start node ids, different structural ids
        assert_ne!(t1.start.id, t2.start.id);
        assert_ne!(t1.id, t2.id);
    }

    #[test]
    fn test_triplet_idempotent_id() {
        let t1 = Triplet::simple("Paris", "capital_of", "France");
        let t2 = Triplet::simple("paris", "Capital_Of", "FRANCE");
        assert_eq!(t1.id, t2.id);
    }

    #[test]
    fn test_time_node_referenced_from_relation() {
        let time = Node::time("2024-01-01");
        let t = Triplet::new(
            Node::object("Alice"),
            Relation::new("visited", RelationKind::Episodic),
            Node::object("Paris"),
            Some(time.clone()),
        );
        assert_eq!(
            t.relation.properties.get(TIME_PROPERTY),
            Some(&serde_json::json!(time.id))
        );
        assert_eq!(t.nodes().count(), 3);

        // The time node participates in the structural id
        let untimed = Triplet::simple("Alice", "visited", "Paris");
        assert_ne!(t.id, untimed.id);
        assert_eq!(t.relation.id, untimed.relation.id);
    }

    #[test]
    fn test_validate_rejects_empty_names() {
        let t = Triplet::simple("", "capital_of", "France");
        assert!(matches!(
            t.validate(),
            Err(crate::error::MemoryError::InvalidInput(_))
        ));
    }
}
