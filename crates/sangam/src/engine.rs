use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::embeddings::{EmbeddingModel, EmbeddingService};
use crate::error::{Error, Result};
use crate::processing::chunker::BlockChunker;
use crate::search::hybrid::{adaptive_fusion, gini};
use crate::search::keywords;
use crate::search::text_search::{QueryOp, SparseDoc, StemLanguage, TextSearch};
use crate::storage::dense::{DenseStore, VectorPoint};
use crate::storage::metadata::Metadata;
use crate::types::{Bundle, BundleRow, BundleStatus, ChunkRow, Hit, Query, SearchResult};

/// The retrieval engine: owns the metadata store, both index backends, the
/// embedding service, and the chunker, and drives ingestion, querying, and
/// lifecycle across them.
///
/// All services are constructed here and injected into nothing global; the
/// application root holds one `Engine` and hands out references.
pub struct Engine {
    config: Config,
    metadata: Arc<Metadata>,
    sparse: Arc<TextSearch>,
    dense: DenseStore,
    embedder: Arc<EmbeddingService>,
    chunker: Arc<BlockChunker>,
    bundle_locks: DashMap<(String, String), Arc<AsyncMutex<()>>>,
    index_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl Engine {
    pub async fn new(config: Config, model: Box<dyn EmbeddingModel>) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;
        if model.dimension() != config.dimension {
            return Err(Error::Validation(format!(
                "model dimension {} does not match configured dimension {}",
                model.dimension(),
                config.dimension
            )));
        }

        let metadata = Arc::new(Metadata::open(&config.metadata_path())?);
        let sparse = Arc::new(TextSearch::new(config.sparse_dir(), StemLanguage::English));
        let dense = DenseStore::connect(&config.vector_db_uri).await?;
        let embedder = Arc::new(EmbeddingService::spawn(model)?);
        let chunker = Arc::new(BlockChunker::new(
            config.chunk_tokens,
            config.min_chunk_bytes,
        )?);

        Ok(Self {
            config,
            metadata,
            sparse,
            dense,
            embedder,
            chunker,
            bundle_locks: DashMap::new(),
            index_locks: DashMap::new(),
        })
    }

    /// Stop the embedding worker. Call once when the application exits.
    pub fn shutdown(&self) {
        self.embedder.shutdown();
    }

    // Ingestion -----

    /// Drive a bundle through its status machine. Safe to call repeatedly
    /// with the same bundle: a completed bundle is a no-op, a partially
    /// ingested one resumes where it left off.
    pub async fn ingest_bundle(&self, bundle: Bundle) -> Result<BundleStatus> {
        if bundle.id.trim().is_empty() {
            return Err(Error::Validation("bundle id must be non-empty".into()));
        }
        validate_index_name(&bundle.index)?;

        // Serialize concurrent posts of the same bundle.
        let lock = self.bundle_lock(&bundle.id, &bundle.index);
        let _guard = lock.lock().await;

        self.ensure_index(&bundle.index).await?;

        let mut status = {
            let (id, index) = (bundle.id.clone(), bundle.index.clone());
            match self
                .with_metadata(move |m| m.bundle_status_get(&id, &index))
                .await?
            {
                Some(status) => status,
                None => {
                    info!(
                        "inserting new bundle '{}' into index '{}'",
                        bundle.id, bundle.index
                    );
                    let record = bundle.clone();
                    self.with_metadata(move |m| m.bundle_add(&record)).await?;
                    BundleStatus::Pending
                }
            }
        };

        if status == BundleStatus::Pending {
            let chunker = self.chunker.clone();
            let blocks = bundle.blocks.clone();
            let pieces =
                tokio::task::spawn_blocking(move || chunker.chunk_blocks(&blocks)).await??;

            info!("inserting {} chunks for bundle '{}'", pieces.len(), bundle.id);
            let (id, index) = (bundle.id.clone(), bundle.index.clone());
            self.with_metadata(move |m| {
                m.in_txn(|tx| {
                    tx.chunks_add(&index, &id, &pieces)?;
                    tx.bundle_status_set(&id, &index, BundleStatus::Chunked)
                })
            })
            .await?;
            status = BundleStatus::Chunked;
        }

        if status != BundleStatus::Completed {
            let rows = {
                let (id, index) = (bundle.id.clone(), bundle.index.clone());
                self.with_metadata(move |m| m.chunks_get_by_bundle_id(&index, &id))
                    .await?
            };
            info!("indexing {} chunks for bundle '{}'", rows.len(), bundle.id);

            let texts: Vec<String> = rows.iter().map(|r| r.content.clone()).collect();
            let embeddings = self.embedder.embed(texts).await?;

            let docs: Vec<SparseDoc> = rows
                .iter()
                .map(|r| SparseDoc {
                    id: r.id,
                    content: r.content.clone(),
                })
                .collect();
            let points: Vec<VectorPoint> = rows
                .iter()
                .zip(embeddings)
                .map(|(r, vector)| VectorPoint { id: r.id, vector })
                .collect();
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();

            let sparse = self.sparse.clone();
            let index = bundle.index.clone();
            let sparse_task =
                tokio::task::spawn_blocking(move || sparse.add_docs(&index, &docs));
            let dense_task = self.dense.add_vectors(&bundle.index, &points);
            let (sparse_res, dense_res) = tokio::join!(sparse_task, dense_task);
            let sparse_res = sparse_res.map_err(Error::from).and_then(|r| r);

            if let Err(e) = sparse_res.and(dense_res) {
                warn!("indexing failed for bundle '{}': {e}", bundle.id);
                // Compensate so no backend keeps entries for chunks the
                // other side rejected; metadata stays at `chunked` and a
                // retry resumes from the indexing phase.
                remove_from_backends(
                    self.sparse.clone(),
                    self.dense.clone(),
                    bundle.index.clone(),
                    ids,
                )
                .await;
                return Err(e);
            }

            let (id, index) = (bundle.id.clone(), bundle.index.clone());
            self.with_metadata(move |m| {
                m.bundle_status_set(&id, &index, BundleStatus::Completed)
            })
            .await?;
            status = BundleStatus::Completed;
        }

        Ok(status)
    }

    // Query -----

    /// Fused retrieval across both backends, rehydrated from the metadata
    /// store in fused order and truncated to the requested limit.
    pub async fn query(&self, query: Query) -> Result<SearchResult> {
        if query.q.trim().is_empty() {
            return Err(Error::Validation("query string must be non-empty".into()));
        }
        if query.limit == 0 {
            return Err(Error::Validation("limit must be > 0".into()));
        }
        validate_index_name(&query.index)?;

        // Headroom so fusion can reorder before truncation.
        let overfetch = query.limit * 2 + 5;

        let query_keywords = keywords::extract(&query.q).join(" ");
        let embedding = self
            .embedder
            .embed(vec![query.q.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("embedder returned an empty batch".into()))?;

        let sparse = self.sparse.clone();
        let sparse_index = query.index.clone();
        let sparse_task = tokio::task::spawn_blocking(move || {
            sparse.query(&sparse_index, &query_keywords, overfetch, None, QueryOp::Or)
        });
        let dense_task = self.dense.query(&query.index, &embedding, overfetch, None);
        let (sparse_res, dense_res) = tokio::join!(sparse_task, dense_task);

        let as_query_err = |e: Error| {
            Error::Query(format!(
                "index '{}' may be missing or empty: {e}",
                query.index
            ))
        };
        let hits_sparse = sparse_res
            .map_err(Error::from)
            .and_then(|r| r)
            .map_err(as_query_err)?;
        let hits_dense = dense_res.map_err(as_query_err)?;

        let dense_pairs: Vec<(i64, f32)> = hits_dense.iter().map(|h| (h.id, h.score)).collect();
        let sparse_pairs: Vec<(i64, f32)> = hits_sparse.iter().map(|h| (h.id, h.score)).collect();
        let fused = adaptive_fusion(&dense_pairs, &sparse_pairs)?;
        if fused.is_empty() {
            return Ok(SearchResult {
                gini: 0.0,
                hits: Vec::new(),
            });
        }

        let scores: Vec<f32> = fused.iter().map(|(_, score)| *score).collect();
        let ranking_gini = gini(&scores)?;

        let ids: Vec<i64> = fused.iter().map(|(id, _)| *id).collect();
        let rows = {
            let ids = ids.clone();
            self.with_metadata(move |m| m.chunks_get(&ids)).await?
        };
        let by_id: HashMap<i64, ChunkRow> = rows.into_iter().map(|r| (r.id, r)).collect();

        let mut hits = Vec::with_capacity(query.limit);
        for (id, score) in &fused {
            // A backend can briefly hold entries for deleted chunks; those
            // ids have no row anymore and are skipped.
            let Some(row) = by_id.get(id) else { continue };
            hits.push(Hit {
                id: *id,
                bundle_id: row.bundle_id.clone(),
                content: row.content.clone(),
                block_ref: row.block_ref.clone(),
                chunk_order: row.chunk_order,
                score: *score,
            });
            if hits.len() == query.limit {
                break;
            }
        }

        Ok(SearchResult {
            gini: ranking_gini,
            hits,
        })
    }

    // Lifecycle -----

    pub async fn get_index(&self, name: &str) -> Result<String> {
        let lookup = name.to_string();
        self.with_metadata(move |m| m.index_get(&lookup))
            .await?
            .ok_or_else(|| Error::NotFound(format!("index '{name}'")))
    }

    pub async fn list_indexes(&self, page: usize, items: usize) -> Result<Vec<String>> {
        self.with_metadata(move |m| m.index_list(page, items)).await
    }

    /// Delete an index with everything in it. The metadata row (and, by
    /// cascade, its bundles and chunks) goes away together with the sparse
    /// directory in one unit of work; the dense collection is dropped
    /// asynchronously, best-effort.
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        validate_index_name(name)?;
        self.get_index(name).await?;

        let metadata = self.metadata.clone();
        let sparse = self.sparse.clone();
        let target = name.to_string();
        tokio::task::spawn_blocking(move || {
            metadata.in_txn(|tx| {
                tx.index_del(&target)?;
                sparse.delete(&target)
            })
        })
        .await??;
        info!("deleted index '{name}'");

        let dense = self.dense.clone();
        let target = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = dense.delete(&target).await {
                warn!("dense collection cleanup failed for index '{target}': {e}");
            }
        });
        Ok(())
    }

    pub async fn get_bundle(&self, index: &str, bundle_id: &str) -> Result<BundleRow> {
        let (id, lookup) = (bundle_id.to_string(), index.to_string());
        self.with_metadata(move |m| m.bundle_get(&id, &lookup))
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("bundle '{bundle_id}' in index '{index}'"))
            })
    }

    pub async fn list_bundles(
        &self,
        index: &str,
        page: usize,
        items: usize,
    ) -> Result<Vec<BundleRow>> {
        let lookup = index.to_string();
        self.with_metadata(move |m| m.bundle_list(&lookup, page, items))
            .await
    }

    /// Page through the raw vectors stored for an index.
    pub async fn list_vectors(
        &self,
        index: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<VectorPoint>, Option<usize>)> {
        validate_index_name(index)?;
        self.get_index(index).await?;
        self.dense.list_vectors(index, offset, limit).await
    }

    /// Delete a bundle: the metadata row goes synchronously (cascading to
    /// its chunks), backend entries are cleaned up asynchronously. Queries
    /// racing the cleanup drop the stale ids during rehydration.
    pub async fn delete_bundle(&self, index: &str, bundle_id: &str) -> Result<()> {
        self.get_bundle(index, bundle_id).await?;

        let ids: Vec<i64> = {
            let (id, lookup) = (bundle_id.to_string(), index.to_string());
            self.with_metadata(move |m| m.chunks_get_by_bundle_id(&lookup, &id))
                .await?
                .into_iter()
                .map(|r| r.id)
                .collect()
        };

        let (id, lookup) = (bundle_id.to_string(), index.to_string());
        self.with_metadata(move |m| m.bundle_del(&id, &lookup))
            .await?;
        info!("deleted bundle '{bundle_id}' from index '{index}'");

        tokio::spawn(remove_from_backends(
            self.sparse.clone(),
            self.dense.clone(),
            index.to_string(),
            ids,
        ));
        Ok(())
    }

    // Helpers -----

    /// Create the metadata row and both backend stores for a fresh index,
    /// exactly once even under racing ingestions.
    async fn ensure_index(&self, name: &str) -> Result<()> {
        let lookup = name.to_string();
        if self
            .with_metadata(move |m| m.index_get(&lookup))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let lock = self.index_lock(name);
        let _guard = lock.lock().await;

        let lookup = name.to_string();
        if self
            .with_metadata(move |m| m.index_get(&lookup))
            .await?
            .is_some()
        {
            return Ok(());
        }

        info!("creating index '{name}'");
        let sparse = self.sparse.clone();
        let target = name.to_string();
        let sparse_task = tokio::task::spawn_blocking(move || sparse.create(&target));
        let dense_task = self.dense.create(name, self.config.dimension);
        let (sparse_res, dense_res) = tokio::join!(sparse_task, dense_task);
        let sparse_res = sparse_res.map_err(Error::from).and_then(|r| r);

        if let Err(e) = sparse_res.and(dense_res) {
            // Roll back whichever side made it so a retry starts clean.
            let sparse = self.sparse.clone();
            let target = name.to_string();
            let _ = tokio::task::spawn_blocking(move || sparse.delete(&target)).await;
            let _ = self.dense.delete(name).await;
            return Err(e);
        }

        let target = name.to_string();
        self.with_metadata(move |m| m.index_add(&target)).await?;
        Ok(())
    }

    async fn with_metadata<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Metadata) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let metadata = self.metadata.clone();
        tokio::task::spawn_blocking(move || f(&metadata)).await?
    }

    fn bundle_lock(&self, bundle_id: &str, index: &str) -> Arc<AsyncMutex<()>> {
        self.bundle_locks
            .entry((bundle_id.to_string(), index.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn index_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.index_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Best-effort removal of chunk entries from both backends. Each side is
/// attempted regardless of the other; failures are logged and swallowed.
async fn remove_from_backends(
    sparse: Arc<TextSearch>,
    dense: DenseStore,
    index: String,
    ids: Vec<i64>,
) {
    let sparse_index = index.clone();
    let sparse_ids = ids.clone();
    let sparse_task =
        tokio::task::spawn_blocking(move || sparse.remove_docs(&sparse_index, &sparse_ids));
    let dense_task = dense.remove_vectors(&index, &ids);
    let (sparse_res, dense_res) = tokio::join!(sparse_task, dense_task);

    match sparse_res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("sparse cleanup failed for index '{index}': {e}"),
        Err(e) => warn!("sparse cleanup task failed for index '{index}': {e}"),
    }
    if let Err(e) = dense_res {
        warn!("dense cleanup failed for index '{index}': {e}");
    }
}

fn validate_index_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(Error::Validation(format!("invalid index name '{name}'")));
    }
    Ok(())
}
