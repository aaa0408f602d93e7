use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Engine configuration, read from the environment with sensible local
/// defaults. All state lives under `data_dir`:
///
/// - `<data_dir>/metadata.db` — relational metadata store
/// - `<data_dir>/sparse/<index>` — one inverted-index directory per index
/// - `<data_dir>/dense` — vector database (unless `vector_db_uri` points
///   elsewhere)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub vector_db_uri: String,
    pub model_dir: PathBuf,
    /// Embedding vector dimension. Must match the model.
    pub dimension: usize,
    /// Token budget per chunk.
    pub chunk_tokens: usize,
    /// Pieces shorter than this many bytes are discarded by the chunker.
    pub min_chunk_bytes: usize,
    pub debug: bool,
}

impl Config {
    /// Build a config from `SANGAM_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(data) = std::env::var("SANGAM_DATA") {
            config.data_dir = PathBuf::from(data);
            config.vector_db_uri = config.data_dir.join("dense").display().to_string();
        }
        if let Ok(uri) = std::env::var("SANGAM_VECTOR_DB_URI") {
            config.vector_db_uri = uri;
        }
        if let Ok(dir) = std::env::var("SANGAM_MODEL_DIR") {
            config.model_dir = PathBuf::from(dir);
        }
        if let Ok(debug) = std::env::var("SANGAM_DEBUG") {
            config.debug = debug.eq_ignore_ascii_case("true") || debug == "1";
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(Error::Validation("dimension must be > 0".into()));
        }
        if self.chunk_tokens < 16 {
            return Err(Error::Validation("chunk_tokens must be >= 16".into()));
        }
        if self.min_chunk_bytes == 0 {
            return Err(Error::Validation("min_chunk_bytes must be > 0".into()));
        }
        Ok(())
    }

    /// Create the on-disk layout the stores expect.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.sparse_dir())?;
        Ok(())
    }

    pub fn sparse_dir(&self) -> PathBuf {
        self.data_dir.join("sparse")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            vector_db_uri: data_dir.join("dense").display().to_string(),
            model_dir: data_dir.join("models"),
            data_dir,
            dimension: 384,
            chunk_tokens: 512,
            min_chunk_bytes: 12,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dimension, 384);
        assert_eq!(config.chunk_tokens, 512);
    }

    #[test]
    fn zero_dimension_rejected() {
        let config = Config {
            dimension: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sparse_dir_is_under_data_dir() {
        let config = Config::default();
        assert!(config.sparse_dir().starts_with(&config.data_dir));
    }
}
