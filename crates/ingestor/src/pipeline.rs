use models::{Envelope, ErrorCode, JobStatus, NlpSource, PipelineError, Stage, CHECKSUM_RE};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::context::AppContext;
use crate::metrics;
use crate::validation::validate_document;

/// Per-stage deadlines. A stage that overruns maps to the retryable
/// `ingestion_timeout`. Embedding and annotation transports carry their
/// own tighter timeouts inside the enrichment clients.
const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(60);
const CHECKSUM_DEADLINE: Duration = Duration::from_secs(30);
const VALIDATE_DEADLINE: Duration = Duration::from_secs(5);
const ENRICH_DEADLINE: Duration = Duration::from_secs(180);
const VECTOR_WRITE_DEADLINE: Duration = Duration::from_secs(30);
const PERSIST_DEADLINE: Duration = Duration::from_secs(10);

/// A successfully processed (or deliberately skipped) event.
#[derive(Debug)]
pub enum Outcome {
    Completed(CompletedStats),
    /// The job row was already terminal; nothing was written.
    Duplicate { envelope: Envelope },
}

#[derive(Debug)]
pub struct CompletedStats {
    pub envelope: Envelope,
    pub job_id: Uuid,
    pub conversation_id: Uuid,
    pub segments: usize,
    pub chunks: usize,
    pub nlp_source: NlpSource,
    pub nlp_partial: bool,
}

/// A classified failure plus whatever identity was established before it
/// happened; the Error Router needs both.
#[derive(Debug)]
pub struct EventFailure {
    pub error: PipelineError,
    pub envelope: Option<Envelope>,
    pub job_id: Option<Uuid>,
}

async fn with_deadline<T, F>(
    stage: Stage,
    deadline: Duration,
    work: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::timeout(stage, deadline)),
    }
}

fn sql_error(stage: Stage, err: sqlx::Error) -> PipelineError {
    PipelineError::new(ErrorCode::PersistenceFailure, stage, err)
}

/// Run one event through the full pipeline. The flat `fields` mapping is
/// exactly what the broker delivered.
pub async fn process_event(
    ctx: &AppContext,
    fields: &BTreeMap<String, String>,
    attempt_count: u32,
) -> Result<Outcome, EventFailure> {
    let mut envelope_slot: Option<Envelope> = None;
    let mut job_slot: Option<Uuid> = None;

    match run_stages(ctx, fields, attempt_count, &mut envelope_slot, &mut job_slot).await {
        Ok(outcome) => Ok(outcome),
        Err(error) => Err(EventFailure {
            error,
            envelope: envelope_slot,
            job_id: job_slot,
        }),
    }
}

#[tracing::instrument(
    skip_all,
    fields(external_event_id = tracing::field::Empty, trace_id = tracing::field::Empty)
)]
async fn run_stages(
    ctx: &AppContext,
    fields: &BTreeMap<String, String>,
    attempt_count: u32,
    envelope_slot: &mut Option<Envelope>,
    job_slot: &mut Option<Uuid>,
) -> Result<Outcome, PipelineError> {
    let started = Instant::now();

    // C2: decode and validate the envelope. Pure CPU, no deadline needed.
    let envelope = Envelope::parse(fields, &ctx.known_majors)
        .map_err(|err| PipelineError::new(err.code(), Stage::Parse, err))?;
    tracing::Span::current()
        .record("external_event_id", envelope.external_event_id.as_str())
        .record("trace_id", tracing::field::display(envelope.trace_id));
    metrics::TRACE_ID_PRESENT_TOTAL.inc();

    if let Some(expected) = &ctx.ingestion_bucket {
        if &envelope.package_uri.bucket != expected {
            return Err(PipelineError::new(
                ErrorCode::ValidationError,
                Stage::Parse,
                anyhow::anyhow!(
                    "package bucket {} is not the ingestion bucket {}",
                    envelope.package_uri.bucket,
                    expected
                ),
            ));
        }
    }
    *envelope_slot = Some(envelope.clone());

    // Deduplication: one job row per external event id, forever.
    let job = ingestor_sql::jobs::create_or_fetch(&envelope, &ctx.pool)
        .await
        .map_err(|err| sql_error(Stage::Parse, err))?;
    *job_slot = Some(job.id);
    let job_status = job
        .status()
        .map_err(|err| PipelineError::new(ErrorCode::ProcessingFailure, Stage::Parse, err))?;
    if job_status.is_terminal() {
        tracing::info!(status = %job_status, "job already terminal; skipping duplicate");
        return Ok(Outcome::Duplicate { envelope });
    }

    let update_status = |status: JobStatus| async move {
        ingestor_sql::jobs::update_status(job.id, status, attempt_count.saturating_sub(1), &ctx.pool)
            .await
            .map_err(|err| sql_error(Stage::Persist, err))
    };
    update_status(JobStatus::Parsed).await?;

    // C3: fetch and unpack into a job-scoped directory. The TempDir
    // guard removes it on success, failure, and cancellation alike.
    update_status(JobStatus::Downloading).await?;
    let scratch = tempfile::TempDir::new_in(ctx.temp_parent.path())
        .map_err(|err| PipelineError::new(ErrorCode::ProcessingFailure, Stage::Download, err))?;

    let (archive_path, archive_bytes) = with_deadline(Stage::Download, DOWNLOAD_DEADLINE, async {
        ctx.object_store
            .download(
                &envelope.package_uri.bucket,
                &envelope.package_uri.key,
                scratch.path(),
            )
            .await
            .map_err(|err| PipelineError::new(err.code(), Stage::Download, err))
    })
    .await?;
    metrics::DOWNLOAD_SIZE_BYTES.observe(archive_bytes as f64);

    // C4: the three-level checksum chain, then extraction.
    let checksum_timer = metrics::CHECKSUM_VALIDATION_DURATION_SECONDS.start_timer();

    // Level 1: re-assert the envelope digest shape before trusting it.
    let prefixed = format!("sha256:{}", envelope.checksum);
    if !CHECKSUM_RE.is_match(&prefixed) {
        return Err(PipelineError::new(
            ErrorCode::ChecksumMismatch,
            Stage::Verify,
            anyhow::anyhow!("envelope digest lost its shape between parse and verify"),
        ));
    }

    // Level 2: the archive must hash to the envelope digest.
    let expected = envelope.checksum.clone();
    let verify_archive = {
        let archive_path = archive_path.clone();
        run_blocking(Stage::Verify, move || {
            packages::verify_archive_checksum(&archive_path, &expected)
        })
    };
    with_deadline(Stage::Verify, CHECKSUM_DEADLINE, verify_archive).await?;

    update_status(JobStatus::Normalizing).await?;
    let extracted = {
        let archive_path = archive_path.clone();
        let extract_root = scratch.path().join("extracted");
        std::fs::create_dir(&extract_root)
            .map_err(|err| PipelineError::new(ErrorCode::ProcessingFailure, Stage::Verify, err))?;
        with_deadline(
            Stage::Verify,
            DOWNLOAD_DEADLINE,
            run_blocking(Stage::Verify, move || {
                packages::extract_archive(&archive_path, &extract_root)
            }),
        )
        .await?
    };

    // Level 3: the internal manifest must cover the extracted tree.
    let verify_manifest = {
        let package_dir = extracted.package_dir();
        let require_self = ctx.manifest_require_self;
        run_blocking(Stage::Verify, move || {
            packages::verify_manifest(&package_dir, require_self)
        })
    };
    with_deadline(Stage::Verify, CHECKSUM_DEADLINE, verify_manifest).await?;
    checksum_timer.observe_duration();

    // C5: structural and semantic validation of the document.
    let validation_timer = metrics::VALIDATION_DURATION_SECONDS.start_timer();
    let validated = with_deadline(Stage::Validate, VALIDATE_DEADLINE, async {
        let package_dir = extracted.package_dir();
        let top_dir = extracted.top_dir.clone();
        let envelope = envelope.clone();
        run_blocking(Stage::Validate, move || {
            validate_document(&package_dir, &top_dir, &envelope)
                .map_err(|err| (ErrorCode::ValidationError, err))
        })
        .await
    })
    .await?;
    validation_timer.observe_duration();
    for warning in &validated.warnings {
        tracing::warn!(%warning, "payload validation warning");
    }
    let doc = validated.doc;
    metrics::CONVERSATION_SEGMENTS.observe(doc.segments.len() as f64);
    metrics::CONVERSATION_PARTICIPANTS.observe(doc.participants.len() as f64);

    // C6: chunk, embed, annotate.
    update_status(JobStatus::Embedding).await?;
    let output = with_deadline(Stage::Enrich, ENRICH_DEADLINE, async {
        ctx.engine
            .enrich(&doc)
            .await
            .map_err(|err| PipelineError::new(err.code(), Stage::Enrich, err))
    })
    .await?;
    metrics::NLP_DURATION_SECONDS
        .with_label_values(&[output.nlp_source.as_str()])
        .observe(output.nlp_seconds);

    // Vector indexing: ordered batch upsert; once any point is written,
    // every later failure compensates by deleting the conversation's
    // points before the event is released or dead-lettered.
    let conversation_id = Uuid::new_v4();
    let points: Vec<enrichment::ChunkPoint> = output
        .chunks
        .iter()
        .zip(&output.embeddings)
        .map(|(chunk, vector)| enrichment::ChunkPoint {
            id: Uuid::new_v4(),
            vector: vector.clone(),
            conversation_id,
            speakers: chunk.speaker_ids.clone(),
            turn_range: chunk.turn_range.clone(),
            trace_id: envelope.trace_id,
            chunk_index: chunk.chunk_index,
            text: chunk.text.clone(),
        })
        .collect();
    let point_ids: Vec<Uuid> = points.iter().map(|p| p.id).collect();

    with_deadline(Stage::Enrich, VECTOR_WRITE_DEADLINE, async {
        ctx.vector_index
            .ensure_collection()
            .await
            .map_err(|err| PipelineError::new(err.code(), Stage::Enrich, err))?;
        ctx.vector_index
            .upsert_chunks(points)
            .await
            .map_err(|err| PipelineError::new(err.code(), Stage::Enrich, err))
    })
    .await?;

    // C7: transactional relational write, then the terminal transition.
    let persisted = with_deadline(Stage::Persist, PERSIST_DEADLINE, async {
        let conversation = build_conversation_insert(
            conversation_id,
            job.id,
            &envelope,
            &doc,
            &output,
            &point_ids,
        );
        let turns = build_turn_inserts(&doc, &output, &point_ids);
        ingestor_sql::conversations::insert_conversation_with_turns(&conversation, &turns, &ctx.pool)
            .await
            .map_err(|err| sql_error(Stage::Persist, err))
    })
    .await;

    if let Err(error) = persisted {
        compensate_vectors(ctx, conversation_id).await;
        return Err(error);
    }

    let processing_metadata = serde_json::json!({
        "segment_count": doc.segments.len(),
        "chunk_count": output.chunks.len(),
        "chunking_strategy": output.strategy.as_str(),
        "nlp_source": output.nlp_source.as_str(),
        "nlp_partial": output.nlp_partial,
        "nlp_errors": output.nlp_errors,
        "top_persons": output.aggregates.as_ref().map(|a| &a.top_persons),
        "uncompressed_bytes": extracted.uncompressed_bytes,
        "processing_ms": started.elapsed().as_millis() as u64,
    });
    let completed = ingestor_sql::jobs::mark_completed(job.id, &processing_metadata, &ctx.pool)
        .await
        .map_err(|err| sql_error(Stage::Persist, err))?;
    if !completed {
        // Lost a race with another worker; our writes stand, theirs won.
        tracing::warn!("job reached a terminal state concurrently");
    }
    metrics::NLP_SOURCE_TOTAL
        .with_label_values(&[output.nlp_source.as_str()])
        .inc();

    Ok(Outcome::Completed(CompletedStats {
        envelope,
        job_id: job.id,
        conversation_id,
        segments: doc.segments.len(),
        chunks: output.chunks.len(),
        nlp_source: output.nlp_source,
        nlp_partial: output.nlp_partial,
    }))
}

/// Best-effort compensating delete; the job is failing anyway, so a
/// delete failure only means orphans until the next successful attempt
/// overwrites them.
async fn compensate_vectors(ctx: &AppContext, conversation_id: Uuid) {
    if let Err(err) = ctx.vector_index.delete_conversation(conversation_id).await {
        tracing::error!(
            %conversation_id,
            error = %err,
            "compensating vector delete failed; orphan points remain"
        );
    }
}

/// Run CPU- or disk-bound work off the async runtime, mapping both panics
/// and the work's typed error into a pipeline classification.
async fn run_blocking<T, E, F>(stage: Stage, work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    E: Into<ClassifiedError> + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            let classified: ClassifiedError = err.into();
            Err(PipelineError::new(classified.0, stage, classified.1))
        }
        Err(join_err) => Err(PipelineError::new(
            ErrorCode::ProcessingFailure,
            stage,
            join_err,
        )),
    }
}

/// `(code, cause)` pair produced by blocking stage work.
struct ClassifiedError(ErrorCode, anyhow::Error);

impl From<packages::Error> for ClassifiedError {
    fn from(err: packages::Error) -> Self {
        ClassifiedError(err.code(), err.into())
    }
}

impl From<(ErrorCode, crate::validation::DocumentError)> for ClassifiedError {
    fn from((code, err): (ErrorCode, crate::validation::DocumentError)) -> Self {
        ClassifiedError(code, err.into())
    }
}

fn build_conversation_insert(
    conversation_id: Uuid,
    job_id: Uuid,
    envelope: &Envelope,
    doc: &models::ConversationDoc,
    output: &enrichment::EnrichmentOutput,
    point_ids: &[Uuid],
) -> ingestor_sql::conversations::ConversationInsert {
    let aggregates = output.aggregates.as_ref();
    // Entity surface forms double as coarse topics for the query side.
    let topics = aggregates.map(|a| {
        serde_json::json!(a
            .top_persons
            .iter()
            .map(|(person, _)| person.clone())
            .collect::<Vec<_>>())
    });

    ingestor_sql::conversations::ConversationInsert {
        id: conversation_id,
        job_id,
        external_event_id: doc.external_event_id.clone(),
        source_system: doc.source_system.clone(),
        title: doc.meeting_metadata.title.clone(),
        date: doc.meeting_metadata.scheduled_start.date_naive(),
        created_at: doc.created_at,
        scheduled_start: doc.meeting_metadata.scheduled_start,
        duration_sec: doc
            .meeting_metadata
            .duration_sec
            .map(|secs| secs as i64)
            .or_else(|| {
                doc.meeting_metadata.end_at.map(|end| {
                    (end - doc.meeting_metadata.scheduled_start).num_seconds()
                })
            }),
        participants: serde_json::json!(doc.participants),
        topics,
        segment_count: doc.segments.len() as i32,
        chunk_count: output.chunks.len() as i32,
        nlp_source: output.nlp_source.as_str().to_string(),
        nlp_partial: output.nlp_partial,
        sentiment_histogram: aggregates.map(|a| serde_json::json!(a.sentiment_histogram)),
        top_persons: aggregates.map(|a| serde_json::json!(a.top_persons)),
        entity_type_counts: aggregates.map(|a| serde_json::json!(a.entity_type_counts)),
        vector_point_ids: serde_json::json!(point_ids),
        trace_id: envelope.trace_id,
    }
}

fn build_turn_inserts(
    doc: &models::ConversationDoc,
    output: &enrichment::EnrichmentOutput,
    point_ids: &[Uuid],
) -> Vec<ingestor_sql::conversations::TurnInsert> {
    doc.segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            let annotation = output.turn_annotations.get(index);
            let sentiment = annotation.and_then(|a| a.sentiment.as_ref());
            let entities = annotation
                .filter(|a| !a.entities.is_empty())
                .map(|a| serde_json::json!(a.entities));

            // The chunk covering this segment, if any, links the turn to
            // its vector point.
            let vector_point_id = output
                .chunks
                .iter()
                .position(|chunk| {
                    chunk.segment_range.0 <= index && index <= chunk.segment_range.1
                })
                .and_then(|chunk_index| point_ids.get(chunk_index))
                .copied();

            ingestor_sql::conversations::TurnInsert {
                id: Uuid::new_v4(),
                turn_index: index as i32,
                segment_id: segment.segment_id.clone(),
                speaker_id: segment.speaker_id.clone(),
                start_ms: segment.start_ms as i64,
                end_ms: segment.end_ms as i64,
                text: segment.text.clone(),
                language: segment.language.clone(),
                confidence: segment.confidence,
                sentiment_label: sentiment.map(|s| s.label.as_str().to_string()),
                sentiment_stars: sentiment.map(|s| s.label.stars()),
                entities,
                vector_point_id,
            }
        })
        .collect()
}

/// Attempt accounting: the envelope's producer-side counter and the
/// broker's delivery counter both witness prior attempts; trust the
/// larger. The result is 1-based.
pub fn attempt_count(envelope_retry_count: Option<u32>, delivery_count: u64) -> u32 {
    let from_broker = delivery_count.max(1) as u32;
    let from_envelope = envelope_retry_count.unwrap_or(0) + 1;
    from_broker.max(from_envelope)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attempt_count_takes_the_larger_witness() {
        assert_eq!(attempt_count(Some(0), 1), 1);
        assert_eq!(attempt_count(Some(2), 1), 3);
        assert_eq!(attempt_count(Some(0), 4), 4);
        assert_eq!(attempt_count(None, 0), 1);
    }
}
