pub mod index;
pub mod memory;
pub mod sqlite;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::driver::{GraphDriver, TreeDriver, VectorDriver};

/// Backend selection, made at construction time.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite {
        path: String,
    },
}

/// The three driver handles the engine is built from.
#[derive(Clone)]
pub struct Backends {
    pub graph: Arc<dyn GraphDriver>,
    pub vector: Arc<dyn VectorDriver>,
    pub tree: Arc<dyn TreeDriver>,
}

impl Backends {
    pub async fn build(kind: &BackendKind) -> Result<Self> {
        let backends = match kind {
            BackendKind::Memory => Self {
                graph: Arc::new(memory::MemoryGraphBackend::new()),
                vector: Arc::new(memory::MemoryVectorBackend::new()),
                tree: Arc::new(memory::MemoryTreeBackend::new()),
            },
            BackendKind::Sqlite { path } => {
                let pool = sqlite::connect(path).await?;
                Self {
                    graph: Arc::new(sqlite::SqliteGraphBackend::new(pool.clone())),
                    vector: Arc::new(sqlite::SqliteVectorBackend::new(pool.clone())),
                    tree: Arc::new(sqlite::SqliteTreeBackend::new(pool)),
                }
            }
        };

        backends.graph.open().await?;
        backends.vector.open().await?;
        backends.tree.open().await?;

        Ok(backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_deserialization() {
        let kind: BackendKind = serde_json::from_str(r#"{"kind": "memory"}"#).unwrap();
        assert!(matches!(kind, BackendKind::Memory));

        let kind: BackendKind =
            serde_json::from_str(r#"{"kind": "sqlite", "path": "./data/memory.db"}"#).unwrap();
        assert!(matches!(kind, BackendKind::Sqlite { path } if path == "./data/memory.db"));
    }

    #[tokio::test]
    async fn test_build_memory_backends() {
        let backends = Backends::build(&BackendKind::Memory).await.unwrap();
        assert_eq!(backends.graph.count().await.unwrap().nodes, 0);
        assert_eq!(backends.vector.count("nodes").await.unwrap(), 0);
        assert_eq!(backends.tree.count().await.unwrap().roots, 0);
    }
}
