use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Triplets per write batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Feed object nodes into the semantic tree index on writes.
    #[serde(default = "default_true")]
    pub index_objects: bool,

    #[serde(default)]
    pub tree: TreeConfig,
}

fn default_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            index_objects: true,
            tree: TreeConfig::default(),
        }
    }
}

/// Tuning surface for the semantic tree. The similarity constants are
/// empirical; treat them as configuration, not algorithm.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TreeConfig {
    /// Base similarity threshold for descending into a child.
    #[serde(default = "default_sim_threshold")]
    pub sim_threshold: f32,

    /// Exponent rate at which the descent threshold tightens with depth.
    #[serde(default = "default_depth_rate")]
    pub depth_rate: f32,

    /// Maximum cosine distance for an entity match to count at all.
    #[serde(default = "default_match_distance")]
    pub match_distance: f32,

    /// Candidates fetched per vector collection during matching.
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,

    /// Maximum leaves returned when a summarized branch wins a match.
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
}

fn default_sim_threshold() -> f32 {
    0.55
}

fn default_depth_rate() -> f32 {
    1.0
}

fn default_match_distance() -> f32 {
    0.35
}

fn default_fetch_k() -> usize {
    16
}

fn default_max_matches() -> usize {
    8
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            sim_threshold: default_sim_threshold(),
            depth_rate: default_depth_rate(),
            match_distance: default_match_distance(),
            fetch_k: default_fetch_k(),
            max_matches: default_max_matches(),
        }
    }
}

/// Connection settings for an OpenAI-compatible embedding endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub dimensions: usize,

    /// Instruction prefix for query-mode encoding (asymmetric models).
    #[serde(default = "default_query_prefix")]
    pub query_prefix: String,

    /// Instruction prefix for passage-mode encoding.
    #[serde(default = "default_passage_prefix")]
    pub passage_prefix: String,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_model() -> String {
    "default".to_string()
}

fn default_query_prefix() -> String {
    "query: ".to_string()
}

fn default_passage_prefix() -> String {
    "passage: ".to_string()
}

/// Connection settings for an OpenAI-compatible chat endpoint used for
/// summary merging.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeConfig {
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl EngineConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }
}
