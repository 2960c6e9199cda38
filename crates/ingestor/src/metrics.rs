//! Instrumentation registry. Counters and gauges are lock-free; all
//! instruments register against the default registry rendered by the
//! metrics server.
//!
//! The validation and checksum durations are histograms rather than
//! quantile summaries: the prometheus crate deliberately omits
//! client-side summaries, and buckets aggregate across workers anyway.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref MESSAGES_TOTAL: IntCounter = register_int_counter!(
        "audio_ingest_messages_total",
        "Events read from the ingestion stream"
    )
    .unwrap();
    pub static ref FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "audio_ingest_failures_total",
        "Failed events by classification; duplicates are counted separately",
        &["reason"]
    )
    .unwrap();
    pub static ref MESSAGES_INFLIGHT: IntGauge = register_int_gauge!(
        "audio_ingest_messages_inflight",
        "Events currently being processed"
    )
    .unwrap();
    pub static ref ACK_LATENCY_SECONDS: Histogram = register_histogram!(
        "audio_ingest_ack_latency_seconds",
        "Receipt-to-ack latency per event",
        vec![0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0]
    )
    .unwrap();
    pub static ref VALIDATION_DURATION_SECONDS: Histogram = register_histogram!(
        "audio_ingest_validation_duration_seconds",
        "Payload validation duration"
    )
    .unwrap();
    pub static ref CHECKSUM_VALIDATION_DURATION_SECONDS: Histogram = register_histogram!(
        "audio_ingest_checksum_validation_duration_seconds",
        "Archive and manifest checksum verification duration"
    )
    .unwrap();
    pub static ref PROCESSING_DURATION_SECONDS: Histogram = register_histogram!(
        "audio_ingest_processing_duration_seconds",
        "End-to-end pipeline duration per event",
        prometheus::exponential_buckets(0.05, 2.0, 12).unwrap()
    )
    .unwrap();
    pub static ref NLP_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "audio_ingest_nlp_duration_seconds",
        "Annotation phase duration by source",
        &["source"]
    )
    .unwrap();
    pub static ref DOWNLOAD_SIZE_BYTES: Histogram = register_histogram!(
        "audio_ingest_download_size_bytes",
        "Compressed package archive size",
        prometheus::exponential_buckets(1024.0, 4.0, 12).unwrap()
    )
    .unwrap();
    pub static ref CONVERSATION_SEGMENTS: Histogram = register_histogram!(
        "audio_ingest_conversation_segments",
        "Segments per validated conversation",
        prometheus::exponential_buckets(1.0, 2.0, 12).unwrap()
    )
    .unwrap();
    pub static ref CONVERSATION_PARTICIPANTS: Histogram = register_histogram!(
        "audio_ingest_conversation_participants",
        "Participants per validated conversation",
        vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 20.0]
    )
    .unwrap();
    pub static ref TRACE_ID_PRESENT_TOTAL: IntCounter = register_int_counter!(
        "audio_ingest_trace_id_present_total",
        "Envelopes carrying a valid trace_id"
    )
    .unwrap();
    pub static ref DLQ_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        "audio_ingest_dlq_published_total",
        "Records appended to the dead-letter stream"
    )
    .unwrap();
    pub static ref RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "audio_ingest_retries_total",
        "Events released for broker re-delivery by failure reason",
        &["reason"]
    )
    .unwrap();
    pub static ref NLP_SOURCE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "audio_ingest_nlp_source_total",
        "Completed jobs by annotation source",
        &["source"]
    )
    .unwrap();
    pub static ref DUPLICATES_TOTAL: IntCounter = register_int_counter!(
        "audio_ingest_duplicates_total",
        "Re-deliveries of already-completed events, acked without effect"
    )
    .unwrap();
    pub static ref RECLAIMED_TOTAL: IntCounter = register_int_counter!(
        "audio_ingest_reclaimed_total",
        "Pending entries reclaimed from idle consumers"
    )
    .unwrap();
}
