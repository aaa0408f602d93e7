pub mod chunker;

pub use chunker::{BlockChunker, ChunkPiece};
