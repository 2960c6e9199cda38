use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, PointStruct, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use uuid::Uuid;

use crate::Error;

/// One chunk ready for the collection: the dense vector plus the payload
/// the query side filters on.
#[derive(Debug, Clone)]
pub struct ChunkPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub conversation_id: Uuid,
    pub speakers: Vec<String>,
    pub turn_range: (String, String),
    pub trace_id: Uuid,
    pub chunk_index: usize,
    pub text: String,
}

/// The `conversations` vector collection. Shared across workers; the
/// client is threadsafe.
pub struct VectorIndex {
    client: Qdrant,
    collection: String,
    dimension: u64,
}

impl VectorIndex {
    pub fn connect(url: &str, collection: String, dimension: usize) -> Result<Self, Error> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|err| Error::VectorIndex(err.into()))?;
        Ok(Self {
            client,
            collection,
            dimension: dimension as u64,
        })
    }

    /// Create the collection (cosine distance, declared dimension) and its
    /// payload indexes if they do not exist. Invoked on the first write of
    /// each job; a no-op afterwards.
    pub async fn ensure_collection(&self) -> Result<(), Error> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|err| Error::VectorIndex(err.into()))?;
        if exists {
            return Ok(());
        }

        tracing::info!(collection = %self.collection, dimension = self.dimension, "creating vector collection");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(self.dimension, Distance::Cosine)),
            )
            .await
            .map_err(|err| Error::VectorIndex(err.into()))?;

        for field in ["conversation_id", "speakers", "trace_id"] {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection,
                    field,
                    FieldType::Keyword,
                ))
                .await
                .map_err(|err| Error::VectorIndex(err.into()))?;
        }
        Ok(())
    }

    /// Upsert the job's points as one ordered batch. `wait` is set so a
    /// successful return means the points are durably applied; the caller
    /// only marks the job completed after this resolves.
    pub async fn upsert_chunks(&self, points: Vec<ChunkPoint>) -> Result<(), Error> {
        if points.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload: Payload = serde_json::json!({
                    "conversation_id": point.conversation_id.to_string(),
                    "speakers": point.speakers,
                    "turn_range": [point.turn_range.0, point.turn_range.1],
                    "trace_id": point.trace_id.to_string(),
                    "chunk_index": point.chunk_index,
                    "text": point.text,
                })
                .try_into()
                .expect("chunk payload is a JSON object");
                PointStruct::new(point.id.to_string(), point.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|err| Error::VectorIndex(err.into()))?;
        Ok(())
    }

    /// Compensating delete: drop every point of one conversation, used
    /// when a later stage fails after vectors were written.
    pub async fn delete_conversation(&self, conversation_id: Uuid) -> Result<(), Error> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Filter::must([Condition::matches(
                        "conversation_id",
                        conversation_id.to_string(),
                    )]))
                    .wait(true),
            )
            .await
            .map_err(|err| Error::VectorIndex(err.into()))?;
        Ok(())
    }

    pub async fn count_for_conversation(&self, conversation_id: Uuid) -> Result<u64, Error> {
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(Filter::must([Condition::matches(
                        "conversation_id",
                        conversation_id.to_string(),
                    )]))
                    .exact(true),
            )
            .await
            .map_err(|err| Error::VectorIndex(err.into()))?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }
}
