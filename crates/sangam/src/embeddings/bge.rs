use std::path::{Path, PathBuf};

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use tokenizers::Tokenizer;

use super::EmbeddingModel;
use crate::error::{Error, Result};

const MAX_SEQUENCE: usize = 512;
const MAX_BATCH: usize = 8;

#[derive(Debug, Clone)]
pub struct BgeConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub dimension: usize,
}

impl BgeConfig {
    /// Standard layout: `model.onnx` + `tokenizer.json` inside one model
    /// directory (bge-small-en-v1.5, 384 dimensions).
    pub fn from_dir(model_dir: &Path) -> Self {
        Self {
            model_path: model_dir.join("model.onnx"),
            tokenizer_path: model_dir.join("tokenizer.json"),
            dimension: 384,
        }
    }
}

/// ONNX sentence embedder. Mean-pools the final hidden states under the
/// attention mask and L2-normalizes, so cosine similarity is a plain dot
/// product downstream.
pub struct BgeEmbeddings {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimension: usize,
    needs_token_types: bool,
}

impl BgeEmbeddings {
    pub fn new(config: BgeConfig) -> Result<Self> {
        ort::init().with_name("sangam_embeddings").commit();

        if !config.model_path.exists() {
            return Err(Error::Embedding(format!(
                "model file not found at {}",
                config.model_path.display()
            )));
        }
        let model_bytes = std::fs::read(&config.model_path)?;

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let session = Session::builder()
            .map_err(|e| Error::Embedding(format!("session builder: {e:?}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| Error::Embedding(format!("optimization level: {e:?}")))?
            .with_intra_threads(num_threads)
            .map_err(|e| Error::Embedding(format!("intra threads: {e:?}")))?
            .with_inter_threads(1)
            .map_err(|e| Error::Embedding(format!("inter threads: {e:?}")))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| Error::Embedding(format!("failed to load model: {e:?}")))?;

        let tokenizer = Tokenizer::from_file(&config.tokenizer_path)
            .map_err(|e| Error::Embedding(format!("failed to load tokenizer: {e}")))?;

        let needs_token_types = session
            .inputs()
            .iter()
            .any(|input| input.name() == "token_type_ids");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimension: config.dimension,
            needs_token_types,
        })
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::Embedding(format!("tokenization failed: {e}")))?;

        let mut token_batches: Vec<Vec<i64>> = Vec::with_capacity(encodings.len());
        let mut padded_len = 0usize;
        for encoding in &encodings {
            let mut ids: Vec<i64> = encoding.get_ids().iter().map(|id| *id as i64).collect();
            ids.truncate(MAX_SEQUENCE);
            padded_len = padded_len.max(ids.len());
            token_batches.push(ids);
        }
        let padded_len = padded_len.max(1);
        let batch_size = token_batches.len();

        let mut input_ids = Vec::with_capacity(batch_size * padded_len);
        let mut attention_mask = Vec::with_capacity(batch_size * padded_len);
        for ids in &token_batches {
            for id in ids {
                input_ids.push(*id);
                attention_mask.push(1i64);
            }
            for _ in ids.len()..padded_len {
                input_ids.push(0i64);
                attention_mask.push(0i64);
            }
        }

        let shape = vec![batch_size, padded_len];
        let ids_tensor = Value::from_array((shape.clone(), input_ids))
            .map_err(|e| Error::Embedding(format!("input_ids tensor: {e:?}")))?;
        let mask_tensor = Value::from_array((shape.clone(), attention_mask.clone()))
            .map_err(|e| Error::Embedding(format!("attention_mask tensor: {e:?}")))?;

        let mut session = self.session.lock();
        let outputs = if self.needs_token_types {
            let types_tensor =
                Value::from_array((shape, vec![0i64; batch_size * padded_len]))
                    .map_err(|e| Error::Embedding(format!("token_type_ids tensor: {e:?}")))?;
            session.run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
                "token_type_ids" => types_tensor,
            ])
        } else {
            session.run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
            ])
        }
        .map_err(|e| Error::Embedding(format!("inference failed: {e:?}")))?;

        let (out_shape, data) = outputs["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Embedding(format!("failed to extract output: {e:?}")))?;
        let seq_len = out_shape[1] as usize;
        let hidden_dim = out_shape[2] as usize;

        let mut vectors = Vec::with_capacity(batch_size);
        for sample in 0..batch_size {
            let mask_offset = sample * padded_len;
            let sample_offset = sample * seq_len * hidden_dim;
            let mut pooled = vec![0.0f32; hidden_dim];
            let mut mask_sum = 0.0f32;

            for pos in 0..seq_len {
                let mask = if mask_offset + pos < attention_mask.len() {
                    attention_mask[mask_offset + pos] as f32
                } else {
                    0.0
                };
                if mask > 0.0 {
                    mask_sum += mask;
                    let offset = sample_offset + pos * hidden_dim;
                    for dim in 0..hidden_dim {
                        pooled[dim] += data[offset + dim] * mask;
                    }
                }
            }
            if mask_sum > 0.0 {
                for value in &mut pooled {
                    *value /= mask_sum;
                }
            }

            vectors.push(normalize(pooled));
        }
        Ok(vectors)
    }
}

impl EmbeddingModel for BgeEmbeddings {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            let refs: Vec<&str> = batch.iter().map(|t| t.as_str()).collect();
            all.extend(self.embed_batch(&refs)?);
        }
        Ok(all)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}
