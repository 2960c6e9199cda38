use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages, used for span naming, deadline attribution, and error
/// context. Strictly ordered for a single event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Receive,
    Parse,
    Download,
    Verify,
    Validate,
    Enrich,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Receive => "receive",
            Stage::Parse => "parse",
            Stage::Download => "download",
            Stage::Verify => "verify",
            Stage::Validate => "validate",
            Stage::Enrich => "enrich",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed classification of every way an event can fail. The Error
/// Router is the only component that turns one of these into a
/// retry-or-DLQ decision; stage code merely produces them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    ChecksumMismatch,
    UnknownSchemaMajor,
    DuplicateEvent,
    ObjectNotFound,
    PayloadTooLarge,
    ObjectStoreUnavailable,
    PersistenceFailure,
    VectorIndexFailure,
    NlpPartial,
    IngestionTimeout,
    ProcessingFailure,
    Cancelled,
    RetryExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::ChecksumMismatch => "checksum_mismatch",
            ErrorCode::UnknownSchemaMajor => "unknown_schema_major",
            ErrorCode::DuplicateEvent => "duplicate_event",
            ErrorCode::ObjectNotFound => "object_not_found",
            ErrorCode::PayloadTooLarge => "payload_too_large",
            ErrorCode::ObjectStoreUnavailable => "object_store_unavailable",
            ErrorCode::PersistenceFailure => "persistence_failure",
            ErrorCode::VectorIndexFailure => "vector_index_failure",
            ErrorCode::NlpPartial => "nlp_partial",
            ErrorCode::IngestionTimeout => "ingestion_timeout",
            ErrorCode::ProcessingFailure => "processing_failure",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::RetryExhausted => "retry_exhausted",
        }
    }

    /// Whether the broker should re-deliver the event for another attempt.
    /// Non-retryable failures are acked and dead-lettered instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorCode::ObjectStoreUnavailable
            | ErrorCode::PersistenceFailure
            | ErrorCode::VectorIndexFailure
            | ErrorCode::IngestionTimeout
            | ErrorCode::ProcessingFailure => true,

            ErrorCode::ValidationError
            | ErrorCode::ChecksumMismatch
            | ErrorCode::UnknownSchemaMajor
            | ErrorCode::DuplicateEvent
            | ErrorCode::ObjectNotFound
            | ErrorCode::PayloadTooLarge
            | ErrorCode::NlpPartial
            | ErrorCode::Cancelled
            | ErrorCode::RetryExhausted => false,
        }
    }

    /// Triage pointer for operators reading the DLQ: who owns the fix.
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => {
                "Producer: envelope or document violates the schema contract; fix and republish"
            }
            ErrorCode::ChecksumMismatch => "Producer: rebuild archive and republish",
            ErrorCode::UnknownSchemaMajor => {
                "Producer or ingestion: align schema_version with KNOWN_SCHEMA_MAJORS"
            }
            ErrorCode::DuplicateEvent => "No action: event was already ingested",
            ErrorCode::ObjectNotFound => {
                "Producer: package missing from the object store; re-upload and republish"
            }
            ErrorCode::PayloadTooLarge => {
                "Producer: archive exceeds size caps; split the conversation and republish"
            }
            ErrorCode::ObjectStoreUnavailable => {
                "Infrastructure: object store unreachable; check endpoint and credentials"
            }
            ErrorCode::PersistenceFailure => {
                "Infrastructure: relational store write failed; check database health"
            }
            ErrorCode::VectorIndexFailure => {
                "Infrastructure: vector store write failed; check collection health"
            }
            ErrorCode::NlpPartial => {
                "Ingestion: annotation models failed for some segments; re-run enrichment"
            }
            ErrorCode::IngestionTimeout => {
                "Infrastructure: a stage exceeded its deadline; check downstream latency"
            }
            ErrorCode::ProcessingFailure => "Ingestion: uncategorized failure; inspect worker logs",
            ErrorCode::Cancelled => "No action: worker shut down mid-flight; event is re-delivered",
            ErrorCode::RetryExhausted => {
                "Ingestion: retry budget exhausted; inspect the underlying cause and re-publish"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified stage failure: the error code, the stage that produced it,
/// and the underlying cause. This is the single error type that crosses
/// stage boundaries on the way to the Error Router.
#[derive(Debug, thiserror::Error)]
#[error("{stage}: {code}")]
pub struct PipelineError {
    pub code: ErrorCode,
    pub stage: Stage,
    #[source]
    pub cause: anyhow::Error,
}

impl PipelineError {
    pub fn new(code: ErrorCode, stage: Stage, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            code,
            stage,
            cause: cause.into(),
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(
            ErrorCode::Cancelled,
            stage,
            anyhow::anyhow!("shutdown observed"),
        )
    }

    pub fn timeout(stage: Stage, deadline: std::time::Duration) -> Self {
        Self::new(
            ErrorCode::IngestionTimeout,
            stage,
            anyhow::anyhow!("stage exceeded its {deadline:?} deadline"),
        )
    }

    /// The operator-facing message persisted to the job row and DLQ record.
    pub fn detail(&self) -> String {
        format!("{:#}", self.cause)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_partition_is_exact() {
        use ErrorCode::*;

        let retryable = [
            ObjectStoreUnavailable,
            PersistenceFailure,
            VectorIndexFailure,
            IngestionTimeout,
            ProcessingFailure,
        ];
        let terminal = [
            ValidationError,
            ChecksumMismatch,
            UnknownSchemaMajor,
            DuplicateEvent,
            ObjectNotFound,
            PayloadTooLarge,
            NlpPartial,
            Cancelled,
            RetryExhausted,
        ];
        assert_eq!(retryable.len() + terminal.len(), 14);
        assert!(retryable.iter().all(ErrorCode::is_retryable));
        assert!(!terminal.iter().any(ErrorCode::is_retryable));
    }

    #[test]
    fn codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::ChecksumMismatch).unwrap(),
            r#""checksum_mismatch""#
        );
        assert_eq!(ErrorCode::RetryExhausted.as_str(), "retry_exhausted");
    }

    #[test]
    fn every_code_has_a_remediation_hint() {
        use ErrorCode::*;
        for code in [
            ValidationError,
            ChecksumMismatch,
            UnknownSchemaMajor,
            DuplicateEvent,
            ObjectNotFound,
            PayloadTooLarge,
            ObjectStoreUnavailable,
            PersistenceFailure,
            VectorIndexFailure,
            NlpPartial,
            IngestionTimeout,
            ProcessingFailure,
            Cancelled,
            RetryExhausted,
        ] {
            assert!(!code.remediation_hint().is_empty());
        }
    }
}
