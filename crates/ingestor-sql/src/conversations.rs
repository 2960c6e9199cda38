use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Uuid;

/// Everything persisted for one validated, enriched conversation. Written
/// together with its turns in a single transaction.
#[derive(Debug, Clone)]
pub struct ConversationInsert {
    pub id: Uuid,
    pub job_id: Uuid,
    pub external_event_id: String,
    pub source_system: String,
    pub title: Option<String>,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub scheduled_start: DateTime<Utc>,
    pub duration_sec: Option<i64>,
    pub participants: serde_json::Value,
    pub topics: Option<serde_json::Value>,
    pub segment_count: i32,
    pub chunk_count: i32,
    pub nlp_source: String,
    pub nlp_partial: bool,
    pub sentiment_histogram: Option<serde_json::Value>,
    pub top_persons: Option<serde_json::Value>,
    pub entity_type_counts: Option<serde_json::Value>,
    pub vector_point_ids: serde_json::Value,
    pub trace_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct TurnInsert {
    pub id: Uuid,
    pub turn_index: i32,
    pub segment_id: String,
    pub speaker_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub language: String,
    pub confidence: f64,
    pub sentiment_label: Option<String>,
    pub sentiment_stars: Option<i16>,
    pub entities: Option<serde_json::Value>,
    pub vector_point_id: Option<Uuid>,
}

/// Transactionally write the conversation row and all of its turn rows.
/// Either everything commits or nothing does; the caller maps a rollback
/// into `persistence_failure`.
pub async fn insert_conversation_with_turns(
    conversation: &ConversationInsert,
    turns: &[TurnInsert],
    pool: &sqlx::PgPool,
) -> sqlx::Result<()> {
    let mut txn = pool.begin().await?;

    sqlx::query(
        r#"
        insert into conversations (
            id, job_id, external_event_id, source_system, title, date,
            created_at, scheduled_start, duration_sec, participants, topics,
            segment_count, chunk_count, nlp_source, nlp_partial,
            sentiment_histogram, top_persons, entity_type_counts,
            vector_point_ids, trace_id
        )
        values (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
        )
        "#,
    )
    .bind(conversation.id)
    .bind(conversation.job_id)
    .bind(&conversation.external_event_id)
    .bind(&conversation.source_system)
    .bind(&conversation.title)
    .bind(conversation.date)
    .bind(conversation.created_at)
    .bind(conversation.scheduled_start)
    .bind(conversation.duration_sec)
    .bind(&conversation.participants)
    .bind(&conversation.topics)
    .bind(conversation.segment_count)
    .bind(conversation.chunk_count)
    .bind(&conversation.nlp_source)
    .bind(conversation.nlp_partial)
    .bind(&conversation.sentiment_histogram)
    .bind(&conversation.top_persons)
    .bind(&conversation.entity_type_counts)
    .bind(&conversation.vector_point_ids)
    .bind(conversation.trace_id)
    .execute(&mut *txn)
    .await?;

    for turn in turns {
        sqlx::query(
            r#"
            insert into conversation_turns (
                id, conversation_id, turn_index, segment_id, speaker_id,
                start_ms, end_ms, text, language, confidence,
                sentiment_label, sentiment_stars, entities, vector_point_id
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(turn.id)
        .bind(conversation.id)
        .bind(turn.turn_index)
        .bind(&turn.segment_id)
        .bind(&turn.speaker_id)
        .bind(turn.start_ms)
        .bind(turn.end_ms)
        .bind(&turn.text)
        .bind(&turn.language)
        .bind(turn.confidence)
        .bind(&turn.sentiment_label)
        .bind(turn.sentiment_stars)
        .bind(&turn.entities)
        .bind(turn.vector_point_id)
        .execute(&mut *txn)
        .await?;
    }

    txn.commit().await
}

pub async fn count_turns(conversation_id: Uuid, pool: &sqlx::PgPool) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"select count(*) from conversation_turns where conversation_id = $1"#,
    )
    .bind(conversation_id)
    .fetch_one(pool)
    .await
}

pub async fn fetch_by_job_id(
    job_id: Uuid,
    pool: &sqlx::PgPool,
) -> sqlx::Result<Option<Uuid>> {
    sqlx::query_scalar::<_, Uuid>(r#"select id from conversations where job_id = $1"#)
        .bind(job_id)
        .fetch_optional(pool)
        .await
}
