use serde::{Deserialize, Serialize};

/// A document submitted for ingestion. `blocks` are the original segments
/// (e.g. PDF pages); they are the unit of citation, not retrieval, and are
/// only persisted in chunked form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    pub index: String,
    pub source: String,
    pub name: String,
    pub blocks: Vec<String>,
}

/// Ingestion progress of a bundle. A bundle can always be re-posted; the
/// pipeline resumes from the last recorded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Pending,
    Chunked,
    Completed,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Pending => "pending",
            BundleStatus::Chunked => "chunked",
            BundleStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BundleStatus::Pending),
            "chunked" => Some(BundleStatus::Chunked),
            "completed" => Some(BundleStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bundle row as stored in the metadata database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRow {
    pub id: String,
    pub index: String,
    pub source: String,
    pub name: String,
    pub created: String,
    pub status: BundleStatus,
}

/// A retrievable unit of text. `block_ref` names the block or block range
/// the chunk spans, e.g. `"3"` or `"3-4"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: i64,
    pub index: String,
    pub bundle_id: String,
    pub content: String,
    #[serde(rename = "ref")]
    pub block_ref: String,
    pub chunk_order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub q: String,
    pub index: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub id: i64,
    pub bundle_id: String,
    pub content: String,
    #[serde(rename = "ref")]
    pub block_ref: String,
    pub chunk_order: u32,
    pub score: f32,
}

/// Fused query result. `gini` reports the inequality of the fused score
/// distribution and serves as a ranking-quality signal for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub gini: f32,
    pub hits: Vec<Hit>,
}
