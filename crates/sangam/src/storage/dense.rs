use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use crate::error::{Error, Result};

/// A stored vector keyed by chunk id.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: i64,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseHit {
    pub id: i64,
    pub score: f32,
}

/// Semantic index adapter: one vector collection per index, backed by a
/// LanceDB database at the configured URI.
///
/// Scores are cosine similarity with negatives clipped to zero, so the
/// fusion stage always sees non-negative input.
#[derive(Clone)]
pub struct DenseStore {
    db: lancedb::Connection,
}

impl DenseStore {
    pub async fn connect(uri: &str) -> Result<Self> {
        if !uri.contains("://") {
            std::fs::create_dir_all(uri).ok();
        }
        let db = lancedb::connect(uri).execute().await?;
        Ok(Self { db })
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let names = self.db.table_names().execute().await?;
        Ok(names.contains(&name.to_string()))
    }

    /// Create a collection for `dim`-sized vectors. Fails if it exists.
    ///
    /// LanceDB derives a table's schema from its first batch, so the table
    /// is seeded with a throwaway row that is deleted right away.
    pub async fn create(&self, name: &str, dim: usize) -> Result<()> {
        if self.exists(name).await? {
            return Err(Error::Validation(format!(
                "dense collection '{name}' already exists"
            )));
        }

        let schema = collection_schema(dim);
        let seed = batch_from_points(
            &[VectorPoint {
                id: -1,
                vector: vec![0.0; dim],
            }],
            dim,
        )?;
        let batches = RecordBatchIterator::new(vec![Ok(seed)], schema);
        self.db
            .create_table(name, Box::new(batches))
            .execute()
            .await?;

        let table = self.db.open_table(name).execute().await?;
        table.delete("id = -1").await?;
        Ok(())
    }

    /// Drop the collection. Idempotent.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            self.db.drop_table(name, &[]).await?;
        }
        Ok(())
    }

    /// Upsert vectors by id.
    pub async fn add_vectors(&self, name: &str, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let dim = points[0].vector.len();
        if let Some(bad) = points.iter().find(|p| p.vector.len() != dim) {
            return Err(Error::Validation(format!(
                "vector for id {} has dimension {} != {dim}",
                bad.id,
                bad.vector.len()
            )));
        }

        let table = self.db.open_table(name).execute().await?;

        // Replace any existing rows for these ids before appending.
        let ids: Vec<i64> = points.iter().map(|p| p.id).collect();
        table.delete(&id_predicate(&ids)).await?;

        let schema = collection_schema(dim);
        let batch = batch_from_points(points, dim)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await?;
        Ok(())
    }

    /// Delete vectors by id. Missing ids are ignored.
    pub async fn remove_vectors(&self, name: &str, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = self.db.open_table(name).execute().await?;
        table.delete(&id_predicate(ids)).await?;
        Ok(())
    }

    /// Top-`limit` cosine neighbours of `vector`, optionally restricted to
    /// an id allowlist.
    pub async fn query(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter_ids: Option<&[i64]>,
    ) -> Result<Vec<DenseHit>> {
        let table = self.db.open_table(name).execute().await?;

        let mut query = table
            .query()
            .nearest_to(vector)?
            .distance_type(DistanceType::Cosine)
            .limit(limit);
        if let Some(ids) = filter_ids {
            query = query.only_if(id_predicate(ids));
        }

        let results = query.execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut hits = Vec::new();
        for batch in &batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
            let (Some(ids), Some(distances)) = (ids, distances) else {
                continue;
            };
            for i in 0..batch.num_rows() {
                hits.push(DenseHit {
                    id: ids.value(i),
                    score: (1.0 - distances.value(i)).max(0.0),
                });
            }
        }
        Ok(hits)
    }

    /// Scan stored vectors in id-agnostic order with offset pagination.
    /// Returns the page and the offset of the next one, if any.
    pub async fn list_vectors(
        &self,
        name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<VectorPoint>, Option<usize>)> {
        let table = self.db.open_table(name).execute().await?;
        let results = table.query().limit(offset + limit + 1).execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut points = Vec::new();
        for batch in &batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let vectors = batch
                .column_by_name("vector")
                .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());
            let (Some(ids), Some(vectors)) = (ids, vectors) else {
                continue;
            };
            for i in 0..batch.num_rows() {
                let values = vectors.value(i);
                let vector = values
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .map(|a| a.values().to_vec())
                    .unwrap_or_default();
                points.push(VectorPoint {
                    id: ids.value(i),
                    vector,
                });
            }
        }

        let has_more = points.len() > offset + limit;
        let page: Vec<VectorPoint> = points.into_iter().skip(offset).take(limit).collect();
        let next_offset = has_more.then_some(offset + limit);
        Ok((page, next_offset))
    }
}

fn collection_schema(dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dim as i32,
            ),
            true,
        ),
    ]))
}

fn batch_from_points(points: &[VectorPoint], dim: usize) -> Result<RecordBatch> {
    let ids: Vec<i64> = points.iter().map(|p| p.id).collect();
    let flat: Vec<f32> = points.iter().flat_map(|p| p.vector.iter().copied()).collect();
    let values = Float32Array::from(flat);
    let vector_array = FixedSizeListArray::new(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dim as i32,
        Arc::new(values) as Arc<dyn Array>,
        None,
    );

    let batch = RecordBatch::try_new(
        collection_schema(dim),
        vec![
            Arc::new(Int64Array::from(ids)) as Arc<dyn Array>,
            Arc::new(vector_array) as Arc<dyn Array>,
        ],
    )?;
    Ok(batch)
}

fn id_predicate(ids: &[i64]) -> String {
    let list: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("id IN ({})", list.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, DenseStore) {
        let dir = TempDir::new().unwrap();
        let store = DenseStore::connect(dir.path().join("dense").to_str().unwrap())
            .await
            .unwrap();
        (dir, store)
    }

    fn unit(x: f32, y: f32, z: f32) -> Vec<f32> {
        let norm = (x * x + y * y + z * z).sqrt().max(1e-12);
        vec![x / norm, y / norm, z / norm]
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let (_dir, store) = store().await;
        store.create("ix", 3).await.unwrap();
        assert!(store.create("ix", 3).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store().await;
        store.create("ix", 3).await.unwrap();
        store.delete("ix").await.unwrap();
        store.delete("ix").await.unwrap();
        assert!(!store.exists("ix").await.unwrap());
    }

    #[tokio::test]
    async fn cosine_query_orders_by_similarity() {
        let (_dir, store) = store().await;
        store.create("ix", 3).await.unwrap();
        store
            .add_vectors(
                "ix",
                &[
                    VectorPoint { id: 1, vector: unit(1.0, 0.0, 0.0) },
                    VectorPoint { id: 2, vector: unit(0.7, 0.7, 0.0) },
                    VectorPoint { id: 3, vector: unit(0.0, 0.0, 1.0) },
                ],
            )
            .await
            .unwrap();

        let hits = store.query("ix", &unit(1.0, 0.0, 0.0), 3, None).await.unwrap();
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[1].id, 2);
        for hit in &hits {
            assert!(hit.score >= 0.0);
        }
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn filter_ids_restricts_results() {
        let (_dir, store) = store().await;
        store.create("ix", 3).await.unwrap();
        store
            .add_vectors(
                "ix",
                &[
                    VectorPoint { id: 1, vector: unit(1.0, 0.0, 0.0) },
                    VectorPoint { id: 2, vector: unit(0.9, 0.1, 0.0) },
                ],
            )
            .await
            .unwrap();

        let hits = store
            .query("ix", &unit(1.0, 0.0, 0.0), 5, Some(&[2]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[tokio::test]
    async fn upsert_replaces_vector_for_id() {
        let (_dir, store) = store().await;
        store.create("ix", 3).await.unwrap();
        store
            .add_vectors("ix", &[VectorPoint { id: 1, vector: unit(1.0, 0.0, 0.0) }])
            .await
            .unwrap();
        store
            .add_vectors("ix", &[VectorPoint { id: 1, vector: unit(0.0, 1.0, 0.0) }])
            .await
            .unwrap();

        let (points, next) = store.list_vectors("ix", 0, 10).await.unwrap();
        assert_eq!(points.len(), 1);
        assert!(next.is_none());
        assert!((points[0].vector[1] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn remove_vectors_deletes_rows() {
        let (_dir, store) = store().await;
        store.create("ix", 3).await.unwrap();
        store
            .add_vectors(
                "ix",
                &[
                    VectorPoint { id: 1, vector: unit(1.0, 0.0, 0.0) },
                    VectorPoint { id: 2, vector: unit(0.0, 1.0, 0.0) },
                ],
            )
            .await
            .unwrap();
        store.remove_vectors("ix", &[1]).await.unwrap();

        let (points, _) = store.list_vectors("ix", 0, 10).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].id, 2);
    }
}
