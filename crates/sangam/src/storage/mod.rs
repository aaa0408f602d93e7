pub mod dense;
pub mod metadata;

pub use dense::{DenseHit, DenseStore, VectorPoint};
pub use metadata::Metadata;
