//! End-to-end scenarios against a local stack (postgres, redis, minio,
//! qdrant, and an embedding server). Run with:
//!
//!   cargo test -p ingestor --test end_to_end -- --ignored
//!
//! The fixed URLs match the development docker-compose defaults.

use clap::Parser;
use ingestor::config::Cli;
use ingestor::context::AppContext;
use ingestor::pipeline::{self, Outcome};
use models::JobStatus;
use std::collections::BTreeMap;

const EVENT_ID: &str = "rec-20251003T091500Z-aaaa1111";
const TRACE_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

fn local_cli() -> Cli {
    Cli::parse_from([
        "ingestor",
        "--minio-access-key",
        "minioadmin",
        "--minio-secret-key",
        "minioadmin",
    ])
}

fn fields_for(event_id: &str, checksum_hex: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for (k, v) in [
        ("external_event_id", event_id),
        (
            "package_uri",
            &format!("s3://ingestion/packages/{event_id}.tar.gz") as &str,
        ),
        ("schema_version", "1.1"),
        ("retry_count", "0"),
        ("produced_at", "2025-10-03T09:16:02Z"),
        (
            "producer",
            r#"{"service":"transcriber","instance":"transcriber-1"}"#,
        ),
        ("priority", "normal"),
    ] {
        fields.insert(k.to_string(), v.to_string());
    }
    fields.insert("checksum".to_string(), format!("sha256:{checksum_hex}"));
    fields.insert(
        "metadata".to_string(),
        format!(r#"{{"trace_id":"{TRACE_ID}"}}"#),
    );
    fields
}

/// Happy path for an upstream-enriched v1.1 package that was previously
/// uploaded to the local object store, followed by a duplicate
/// re-delivery of the same event.
#[tokio::test]
#[ignore]
async fn enriched_package_completes_then_deduplicates() {
    let ctx = AppContext::init(&local_cli()).await.unwrap();
    let checksum = std::env::var("E2E_PACKAGE_CHECKSUM")
        .expect("set E2E_PACKAGE_CHECKSUM to the uploaded package digest");
    let fields = fields_for(EVENT_ID, &checksum);

    let outcome = pipeline::process_event(&ctx, &fields, 1).await.unwrap();
    let stats = match outcome {
        Outcome::Completed(stats) => stats,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(stats.nlp_source, models::NlpSource::Upstream);

    // Job row is terminal with a conversation and one turn per segment.
    let job = ingestor_sql::jobs::fetch_by_event_id(EVENT_ID, &ctx.pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status().unwrap(), JobStatus::Completed);
    let conversation_id = ingestor_sql::conversations::fetch_by_job_id(job.id, &ctx.pool)
        .await
        .unwrap()
        .unwrap();
    let turns = ingestor_sql::conversations::count_turns(conversation_id, &ctx.pool)
        .await
        .unwrap();
    assert_eq!(turns as usize, stats.segments);

    // Vector points for every chunk.
    let points = ctx
        .vector_index
        .count_for_conversation(stats.conversation_id)
        .await
        .unwrap();
    assert_eq!(points as usize, stats.chunks);

    // Re-delivery short-circuits without further writes.
    let second = pipeline::process_event(&ctx, &fields, 2).await.unwrap();
    assert!(matches!(second, Outcome::Duplicate { .. }));
}

/// A mismatched envelope digest is terminal: the pipeline classifies it
/// as checksum_mismatch before anything is enriched or persisted.
#[tokio::test]
#[ignore]
async fn wrong_checksum_is_terminal() {
    let ctx = AppContext::init(&local_cli()).await.unwrap();

    // Same uploaded object as the happy path, but the envelope claims a
    // digest of all zeroes. The chain breaks at level 2.
    let mut fields = fields_for("rec-20251003T091500Z-bbbb2222", &"0".repeat(64));
    fields.insert(
        "package_uri".to_string(),
        format!("s3://ingestion/packages/{EVENT_ID}.tar.gz"),
    );

    let failure = pipeline::process_event(&ctx, &fields, 1).await.unwrap_err();
    assert_eq!(failure.error.code, models::ErrorCode::ChecksumMismatch);
    assert!(!failure.error.code.is_retryable());
}
