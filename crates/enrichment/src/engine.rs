use models::{ConversationDoc, Entity, NlpSource, SentimentAnnotation};
use std::sync::Arc;
use std::time::Instant;

use crate::aggregates::{aggregate_annotations, ConversationAggregates};
use crate::chunk::{chunk_conversation, Chunk, ChunkingStrategy};
use crate::embed::Embedder;
use crate::nlp::NlpClient;
use crate::Error;

/// Annotations for one segment, whichever branch produced them.
#[derive(Debug, Clone, Default)]
pub struct TurnAnnotation {
    pub sentiment: Option<SentimentAnnotation>,
    pub entities: Vec<Entity>,
}

/// Everything C6 derives from a validated conversation. Vector points are
/// built from `chunks` x `embeddings`, which are index-aligned.
#[derive(Debug)]
pub struct EnrichmentOutput {
    pub strategy: ChunkingStrategy,
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<Vec<f32>>,
    pub nlp_source: NlpSource,
    /// Set when local annotation calls failed; never fails the job.
    pub nlp_partial: bool,
    pub nlp_errors: Vec<String>,
    /// One entry per segment, empty-annotated where nothing was produced.
    pub turn_annotations: Vec<TurnAnnotation>,
    pub aggregates: Option<ConversationAggregates>,
    pub nlp_seconds: f64,
}

/// Chunking, embedding, and the enriched/legacy annotation branch.
/// Vector indexing is composed around this by the pipeline so the engine
/// stays free of store handles.
pub struct EnrichmentEngine {
    embedder: Arc<dyn Embedder>,
    /// Local models; `None` disables the legacy fallback.
    nlp: Option<NlpClient>,
}

impl EnrichmentEngine {
    pub fn new(embedder: Arc<dyn Embedder>, nlp: Option<NlpClient>) -> Self {
        Self { embedder, nlp }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Decide between consuming upstream annotations and computing local
    /// ones. Upstream requires a v1.1+ document that actually carries
    /// annotations on at least one segment.
    pub fn detect_mode(&self, doc: &ConversationDoc) -> NlpSource {
        let upstream = doc.schema_version >= models::SchemaVersion::V1_1
            && doc.segments.iter().any(|s| s.has_upstream_annotations());
        if upstream {
            NlpSource::Upstream
        } else if self.nlp.is_some() {
            NlpSource::Local
        } else {
            NlpSource::None
        }
    }

    #[tracing::instrument(skip_all, fields(segments = doc.segments.len()))]
    pub async fn enrich(&self, doc: &ConversationDoc) -> Result<EnrichmentOutput, Error> {
        let nlp_source = self.detect_mode(doc);

        // Chunking always runs and always precedes everything else.
        let (strategy, chunks) =
            chunk_conversation(doc.participants.len(), &doc.segments, self.embedder.as_ref())
                .await?;
        tracing::debug!(strategy = strategy.as_str(), chunks = chunks.len(), "chunked conversation");

        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        // Embedding and the annotation branch are independent; run them
        // concurrently. Annotation failures are contained, embedding
        // failures are not.
        let nlp_started = Instant::now();
        let (embeddings, annotation_outcome) = futures::join!(
            self.embedder.embed(&chunk_texts),
            self.annotate(doc, nlp_source),
        );
        let embeddings = embeddings?;
        let (turn_annotations, nlp_partial, nlp_errors) = annotation_outcome;
        let nlp_seconds = nlp_started.elapsed().as_secs_f64();

        let aggregates = match nlp_source {
            NlpSource::None => None,
            _ => Some(aggregate_annotations(&turn_annotations)),
        };

        Ok(EnrichmentOutput {
            strategy,
            chunks,
            embeddings,
            nlp_source,
            nlp_partial,
            nlp_errors,
            turn_annotations,
            aggregates,
            nlp_seconds,
        })
    }

    async fn annotate(
        &self,
        doc: &ConversationDoc,
        nlp_source: NlpSource,
    ) -> (Vec<TurnAnnotation>, bool, Vec<String>) {
        match nlp_source {
            NlpSource::Upstream => (upstream_annotations(doc), false, Vec::new()),
            NlpSource::Local => {
                let nlp = self.nlp.as_ref().expect("local mode implies a client");
                local_annotations(nlp, doc).await
            }
            NlpSource::None => {
                tracing::warn!("no upstream annotations and local models disabled; skipping NLP");
                (
                    vec![TurnAnnotation::default(); doc.segments.len()],
                    false,
                    Vec::new(),
                )
            }
        }
    }
}

fn upstream_annotations(doc: &ConversationDoc) -> Vec<TurnAnnotation> {
    doc.segments
        .iter()
        .map(|segment| match &segment.annotations {
            Some(annotations) => TurnAnnotation {
                sentiment: annotations.sentiment.clone(),
                entities: annotations.entities.clone(),
            },
            None => TurnAnnotation::default(),
        })
        .collect()
}

/// Run sentiment and NER over segment batches. The two models proceed
/// concurrently with each other; a failed batch marks the conversation
/// `nlp_partial` and leaves its turns unannotated rather than failing
/// the job.
async fn local_annotations(
    nlp: &NlpClient,
    doc: &ConversationDoc,
) -> (Vec<TurnAnnotation>, bool, Vec<String>) {
    let texts: Vec<String> = doc.segments.iter().map(|s| s.text.clone()).collect();
    let batch_size = nlp.batch_size();

    let sentiment_task = async {
        let mut results: Vec<Option<SentimentAnnotation>> = Vec::with_capacity(texts.len());
        let mut errors = Vec::new();
        for batch in texts.chunks(batch_size) {
            match nlp.sentiment(batch).await {
                Ok(batch_results) => results.extend(batch_results.into_iter().map(Some)),
                Err(err) => {
                    errors.push(format!("sentiment: {:#}", anyhow::Error::from(err)));
                    results.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
            }
        }
        (results, errors)
    };

    let ner_task = async {
        let mut results: Vec<Vec<Entity>> = Vec::with_capacity(texts.len());
        let mut errors = Vec::new();
        for batch in texts.chunks(batch_size) {
            match nlp.entities(batch).await {
                Ok(batch_results) => results.extend(batch_results),
                Err(err) => {
                    errors.push(format!("ner: {:#}", anyhow::Error::from(err)));
                    results.extend(std::iter::repeat_with(Vec::new).take(batch.len()));
                }
            }
        }
        (results, errors)
    };

    let ((sentiments, mut errors), (entities, ner_errors)) =
        futures::join!(sentiment_task, ner_task);
    errors.extend(ner_errors);

    let turns = sentiments
        .into_iter()
        .zip(entities)
        .map(|(sentiment, entities)| TurnAnnotation {
            sentiment,
            entities,
        })
        .collect();
    let partial = !errors.is_empty();
    (turns, partial, errors)
}
