use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use tracing::debug;

use crate::error::AppError;
use crate::storage::types::passage::Passage;

use super::{AccessFilter, ScoredPassage, VectorStore};

const SCROLL_PAGE: u32 = 1024;

/// Qdrant-backed vector store. Filterable payload fields are stored
/// natively; the full passage travels as a JSON string for hydration.
pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
    dimension: AtomicUsize,
}

impl QdrantVectorStore {
    /// Connects and makes sure the collection exists with `dimension`.
    pub async fn connect(url: &str, collection: &str, dimension: usize) -> Result<Self, AppError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| AppError::Internal(format!("qdrant connection to {url} failed: {e}")))?;

        let store = Self {
            client,
            collection: collection.to_string(),
            dimension: AtomicUsize::new(dimension),
        };
        store.ensure_collection(dimension).await?;
        Ok(store)
    }

    async fn ensure_collection(&self, dimension: usize) -> Result<(), AppError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| AppError::Internal(format!("qdrant collection check failed: {e}")))?;

        if !exists {
            debug!(collection = %self.collection, dimension, "creating qdrant collection");
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine))
                        .on_disk_payload(true),
                )
                .await
                .map_err(|e| AppError::Internal(format!("qdrant create collection failed: {e}")))?;
        }
        Ok(())
    }

    fn payload_for(passage: &Passage) -> Result<Payload, AppError> {
        let groups: Vec<String> = passage.group_ids.iter().cloned().collect();
        let passage_json = serde_json::to_string(passage)
            .map_err(|e| AppError::Internal(format!("passage serialization failed: {e}")))?;
        let value = serde_json::json!({
            "entry_id": passage.entry_id,
            "owner_id": passage.owner_id,
            "visibility": passage.visibility,
            "group_ids": groups,
            "passage": passage_json,
        });
        Payload::try_from(value)
            .map_err(|e| AppError::Internal(format!("payload conversion failed: {e}")))
    }

    fn passage_from_payload(
        payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
    ) -> Option<Passage> {
        let raw = payload.get("passage")?.as_str()?;
        serde_json::from_str(raw).ok()
    }

    /// Translates the predicate filter into a native qdrant filter. The
    /// base disjunction becomes `should` clauses; a group restriction is a
    /// conjunctive `must`.
    fn native_filter(filter: &AccessFilter) -> Option<Filter> {
        match filter {
            AccessFilter::Unbounded => None,
            AccessFilter::Ids(ids) => {
                let mut sorted: Vec<String> = ids.iter().cloned().collect();
                sorted.sort();
                Some(Filter::must([Condition::has_id(
                    sorted
                        .into_iter()
                        .map(Into::<qdrant_client::qdrant::PointId>::into)
                        .collect::<Vec<_>>(),
                )]))
            }
            AccessFilter::Scoped(scoped) => {
                let mut should = Vec::new();
                if let Some(owner) = &scoped.owner_id {
                    should.push(Condition::matches("owner_id", owner.clone()));
                }
                if scoped.include_public {
                    should.push(Condition::matches("visibility", "public".to_string()));
                }
                if !scoped.readable_group_ids.is_empty() {
                    let mut groups: Vec<String> =
                        scoped.readable_group_ids.iter().cloned().collect();
                    groups.sort();
                    should.push(Condition::matches("group_ids", groups));
                }

                let mut must = Vec::new();
                if let Some(restrict) = &scoped.restrict_to_group_ids {
                    let mut groups: Vec<String> = restrict.iter().cloned().collect();
                    groups.sort();
                    must.push(Condition::matches("group_ids", groups));
                }

                Some(Filter {
                    should,
                    must,
                    ..Filter::default()
                })
            }
        }
    }

    async fn scroll_passages(&self, filter: Filter) -> Result<Vec<Passage>, AppError> {
        let mut passages = Vec::new();
        let mut offset = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(&self.collection)
                .filter(filter.clone())
                .limit(SCROLL_PAGE)
                .with_payload(true);
            if let Some(next) = offset {
                builder = builder.offset(next);
            }

            let response = self
                .client
                .scroll(builder)
                .await
                .map_err(|e| AppError::Internal(format!("qdrant scroll failed: {e}")))?;

            for point in &response.result {
                if let Some(passage) = Self::passage_from_payload(&point.payload) {
                    passages.push(passage);
                }
            }

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(passages)
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, passage: &Passage, vector: Vec<f32>) -> Result<(), AppError> {
        let expected = self.dimension.load(Ordering::Relaxed);
        if vector.len() != expected {
            return Err(AppError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        let point = PointStruct::new(passage.id.clone(), vector, Self::payload_for(passage)?);
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(|e| AppError::Internal(format!("qdrant upsert failed: {e}")))?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &AccessFilter,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        let expected = self.dimension.load(Ordering::Relaxed);
        if query.len() != expected {
            return Err(AppError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }

        let mut builder =
            SearchPointsBuilder::new(&self.collection, query.to_vec(), k as u64).with_payload(true);
        if let Some(native) = Self::native_filter(filter) {
            builder = builder.filter(native);
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| AppError::Internal(format!("qdrant search failed: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                Self::passage_from_payload(&point.payload).map(|passage| ScoredPassage {
                    passage,
                    score: point.score,
                })
            })
            .collect())
    }

    async fn delete(&self, passage_ids: &[String]) -> Result<(), AppError> {
        if passage_ids.is_empty() {
            return Ok(());
        }

        let selector = PointsIdsList {
            ids: passage_ids.iter().cloned().map(Into::into).collect(),
        };
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(selector)
                    .wait(true),
            )
            .await
            .map_err(|e| AppError::Internal(format!("qdrant delete failed: {e}")))?;
        Ok(())
    }

    async fn delete_by_entry(&self, entry_id: &str) -> Result<Vec<String>, AppError> {
        let filter = Filter::must([Condition::matches("entry_id", entry_id.to_string())]);
        let passages = self.scroll_passages(filter).await?;
        let ids: Vec<String> = passages.into_iter().map(|p| p.id).collect();
        self.delete(&ids).await?;
        Ok(ids)
    }

    async fn list_by_entry(&self, entry_id: &str) -> Result<Vec<Passage>, AppError> {
        let filter = Filter::must([Condition::matches("entry_id", entry_id.to_string())]);
        self.scroll_passages(filter).await
    }

    async fn strip_group(&self, group_id: &str) -> Result<(), AppError> {
        let filter = Filter::must([Condition::matches(
            "group_ids",
            vec![group_id.to_string()],
        )]);
        let passages = self.scroll_passages(filter).await?;

        // Rewrite affected payloads without the deleted group. Vectors are
        // unchanged, so fetch them back page by page and re-upsert.
        for mut passage in passages {
            passage.group_ids.remove(group_id);

            let points = self
                .client
                .get_points(
                    qdrant_client::qdrant::GetPointsBuilder::new(
                        &self.collection,
                        vec![passage.id.clone().into()],
                    )
                    .with_vectors(true),
                )
                .await
                .map_err(|e| AppError::Internal(format!("qdrant get point failed: {e}")))?;

            let Some(vector) = points.result.into_iter().next().and_then(|point| {
                point.vectors.and_then(|vectors| match vectors.vectors_options {
                    Some(qdrant_client::qdrant::vectors_output::VectorsOptions::Vector(v)) => {
                        Some(v.data)
                    }
                    _ => None,
                })
            }) else {
                continue;
            };

            let point = PointStruct::new(passage.id.clone(), vector, Self::payload_for(&passage)?);
            self.client
                .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
                .await
                .map_err(|e| AppError::Internal(format!("qdrant payload rewrite failed: {e}")))?;
        }
        Ok(())
    }

    async fn recreate(&self, dimension: usize) -> Result<(), AppError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| AppError::Internal(format!("qdrant collection check failed: {e}")))?;
        if exists {
            self.client
                .delete_collection(&self.collection)
                .await
                .map_err(|e| AppError::Internal(format!("qdrant drop collection failed: {e}")))?;
        }
        self.dimension.store(dimension, Ordering::Relaxed);
        self.ensure_collection(dimension).await
    }

    async fn dimension(&self) -> Result<usize, AppError> {
        Ok(self.dimension.load(Ordering::Relaxed))
    }
}
