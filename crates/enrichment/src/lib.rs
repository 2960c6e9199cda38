//! Enrichment of validated conversations: chunking, dense embedding,
//! vector indexing, and sentiment/entity annotation with its upstream
//! and local variants.

mod aggregates;
mod chunk;
mod embed;
mod engine;
mod index;
mod nlp;

pub use aggregates::{aggregate_annotations, full_histogram, ConversationAggregates};
pub use chunk::{chunk_conversation, choose_strategy, Chunk, ChunkingStrategy};
pub use embed::{EmbeddingClient, EmbeddingConfig, Embedder};
pub use engine::{EnrichmentEngine, EnrichmentOutput, TurnAnnotation};
pub use index::{ChunkPoint, VectorIndex};
pub use nlp::{NlpClient, NlpConfig};

use models::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("embedding provider call failed")]
    Embedding(#[source] anyhow::Error),
    #[error("embedding provider returned {actual} dimensions, expected {expected}")]
    EmbeddingDimension { expected: usize, actual: usize },
    #[error("vector index write failed")]
    VectorIndex(#[source] anyhow::Error),
    #[error("annotation model call failed")]
    Annotation(#[source] anyhow::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            // Chunking and embedding failures fail the job as generic,
            // retryable processing failures.
            Error::Embedding(_) | Error::EmbeddingDimension { .. } => ErrorCode::ProcessingFailure,
            Error::VectorIndex(_) => ErrorCode::VectorIndexFailure,
            // Contained by the engine; surfaces as nlp_partial, never as
            // a job failure.
            Error::Annotation(_) => ErrorCode::NlpPartial,
        }
    }
}
