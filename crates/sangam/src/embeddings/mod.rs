pub mod bge;
pub mod worker;

use crate::error::Result;

/// Seam for the embedding model. Implementations return one L2-normalized
/// vector per input text, in input order, all with the same fixed
/// dimension.
pub trait EmbeddingModel: Send {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

pub use bge::{BgeConfig, BgeEmbeddings};
pub use worker::EmbeddingService;
