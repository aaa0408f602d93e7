use text_splitter::{ChunkConfig, ChunkSizer, TextSplitter};
use tiktoken_rs::CoreBPE;

use crate::error::{Error, Result};

/// Sizes chunks by `cl100k_base` token count.
struct TokenSizer(CoreBPE);

impl ChunkSizer for TokenSizer {
    fn size(&self, chunk: &str) -> usize {
        self.0.encode_ordinary(chunk).len()
    }
}

/// Separator inserted between blocks before splitting. Two bytes, so block
/// boundaries never merge into a single word.
const BLOCK_SEPARATOR: &str = "\n ";

/// A chunk produced from a bundle's blocks, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub content: String,
    /// Block or block range this piece spans, e.g. `"3"` or `"3-4"`.
    pub block_ref: String,
    /// 1-based position within the bundle.
    pub chunk_order: u32,
}

/// Splits a bundle's blocks into token-bounded chunks while keeping a
/// mapping from every chunk back to the block range it came from.
///
/// Blocks are joined with [`BLOCK_SEPARATOR`] and handed to a recursive
/// splitter sized by the `cl100k_base` byte-pair tokenizer. The splitter
/// yields byte offsets into the joined text; those offsets are resolved
/// against the recorded per-block ranges to produce the `ref` labels.
/// Pieces shorter than the configured minimum are merged into a
/// neighboring chunk rather than discarded, so no block content is lost.
pub struct BlockChunker {
    splitter: TextSplitter<TokenSizer>,
    min_chunk_bytes: usize,
}

impl BlockChunker {
    pub fn new(chunk_tokens: usize, min_chunk_bytes: usize) -> Result<Self> {
        let tokenizer = tiktoken_rs::cl100k_base()
            .map_err(|e| Error::Chunking(format!("tokenizer init failed: {e}")))?;
        let sizer = TokenSizer(tokenizer);
        Ok(Self {
            splitter: TextSplitter::new(ChunkConfig::new(chunk_tokens).with_sizer(sizer)),
            min_chunk_bytes,
        })
    }

    pub fn chunk_blocks(&self, blocks: &[String]) -> Result<Vec<ChunkPiece>> {
        let combined = blocks.join(BLOCK_SEPARATOR);

        // Inclusive byte range of each block within the joined text. Empty
        // blocks get no range and therefore never match a lookup.
        let mut block_ranges: Vec<(usize, usize, usize)> = Vec::with_capacity(blocks.len());
        let mut pos = 0usize;
        for (number, block) in blocks.iter().enumerate() {
            if !block.is_empty() {
                block_ranges.push((pos, pos + block.len() - 1, number + 1));
            }
            pos += block.len() + BLOCK_SEPARATOR.len();
        }

        let find_block = |idx: usize| -> Option<usize> {
            block_ranges
                .iter()
                .find(|(start, end, _)| *start <= idx && idx <= *end)
                .map(|(_, _, number)| *number)
        };

        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut cursor = 0usize;
        for (offset, text) in self.splitter.chunk_indices(&combined) {
            if text.is_empty() {
                continue;
            }
            // Offsets must advance monotonically; anything else means the
            // splitter reordered or duplicated content and the block refs
            // would be wrong.
            if offset < cursor {
                return Err(Error::Chunking(format!(
                    "chunk at byte {offset} precedes cursor {cursor}"
                )));
            }
            let end = offset + text.len() - 1;
            cursor = end + 1;
            spans.push((offset, end));
        }

        // Fold undersized splits into their neighbor instead of dropping
        // them. A merged span covers everything between its endpoints, so
        // each chunk stays a contiguous slice of the joined text. Only a
        // whole input shorter than the minimum survives undersized.
        let mut merged: Vec<(usize, usize)> = Vec::new();
        for (start, end) in spans {
            if let Some(prev) = merged.last_mut() {
                let undersized = end - start + 1 < self.min_chunk_bytes
                    || prev.1 - prev.0 + 1 < self.min_chunk_bytes;
                if undersized {
                    prev.1 = end;
                    continue;
                }
            }
            merged.push((start, end));
        }

        let mut produced = Vec::with_capacity(merged.len());
        for (order, (start, end)) in merged.into_iter().enumerate() {
            let start_block = find_block(start);
            let end_block = find_block(end);
            let (start_block, end_block) = match (start_block, end_block) {
                (Some(s), Some(e)) => (s, e),
                _ => {
                    return Err(Error::Chunking(format!(
                        "unable to locate chunk #{} in source blocks",
                        order + 1
                    )))
                }
            };

            let block_ref = if start_block == end_block {
                format!("{start_block}")
            } else {
                format!("{start_block}-{end_block}")
            };
            produced.push(ChunkPiece {
                content: combined[start..=end].to_string(),
                block_ref,
                chunk_order: order as u32 + 1,
            });
        }

        Ok(produced)
    }
}
