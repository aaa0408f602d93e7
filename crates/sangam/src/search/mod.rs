pub mod hybrid;
pub mod keywords;
pub mod text_search;

pub use hybrid::{adaptive_fusion, gini};
pub use text_search::{QueryOp, SparseDoc, SparseHit, StemLanguage, TextSearch};
