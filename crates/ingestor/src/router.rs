use models::{ErrorCode, PipelineError};
use std::collections::BTreeMap;

use crate::context::AppContext;
use crate::metrics;
use crate::pipeline::EventFailure;

/// What the consumer should do with the stream entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckDecision {
    /// Acknowledge: the event is done, successfully or terminally.
    Ack,
    /// Leave unacked; the broker re-delivers after the visibility window.
    Release,
}

/// The single place that turns a classified failure into a retry-or-DLQ
/// decision, with its metric, job-row, and dead-letter side effects.
#[tracing::instrument(skip_all, fields(code = %failure.error.code, stage = %failure.error.stage))]
pub async fn route_failure(
    ctx: &AppContext,
    original_fields: &BTreeMap<String, String>,
    failure: EventFailure,
    attempt_count: u32,
) -> AckDecision {
    let EventFailure {
        error,
        envelope,
        job_id,
    } = failure;

    // Shutdown is not a failure: release the entry untouched so the next
    // consumer (or our own restart) picks it up.
    if error.code == ErrorCode::Cancelled {
        tracing::info!("releasing event for re-delivery after shutdown");
        return AckDecision::Release;
    }

    let retries_so_far = attempt_count.saturating_sub(1);
    let (code, detail) = if error.code.is_retryable() && retries_so_far >= ctx.max_retries {
        // The retry budget is spent; the final classification names the
        // exhaustion and the message keeps the cause.
        (
            ErrorCode::RetryExhausted,
            format!("{}: {}", error.code, error.detail()),
        )
    } else {
        (error.code, error.detail())
    };

    metrics::FAILURES_TOTAL.with_label_values(&[code.as_str()]).inc();

    if code.is_retryable() {
        tracing::warn!(
            error = detail,
            attempt = attempt_count,
            max_retries = ctx.max_retries,
            "retryable failure; leaving event for re-delivery"
        );
        metrics::RETRIES_TOTAL.with_label_values(&[code.as_str()]).inc();
        if let Some(job_id) = job_id {
            if let Err(err) =
                ingestor_sql::jobs::record_attempt_error(job_id, code, &detail, &ctx.pool).await
            {
                tracing::error!(error = %err, "failed to record attempt error on job row");
            }
        }
        return AckDecision::Release;
    }

    tracing::error!(error = detail, "terminal failure; dead-lettering event");
    if let Some(job_id) = job_id {
        if let Err(err) = ingestor_sql::jobs::mark_failed(job_id, code, &detail, &ctx.pool).await {
            tracing::error!(error = %err, "failed to mark job failed");
        }
    }

    // Best-effort: a DLQ outage is logged but never blocks the ack.
    let letter = broker::DeadLetter {
        original: original_fields,
        code,
        message: detail,
        attempt_count,
        trace_id: envelope.as_ref().map(|e| e.trace_id),
    };
    match ctx.dlq.publish(letter).await {
        Ok(entry_id) => {
            metrics::DLQ_PUBLISHED_TOTAL.inc();
            tracing::info!(dlq_entry = entry_id, "dead letter published");
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to publish dead letter; acking anyway");
        }
    }

    AckDecision::Ack
}

#[cfg(test)]
mod test {
    use super::*;
    use models::Stage;

    // Decision-table checks that do not need live stores exercise the
    // classification arithmetic via the same predicates the router uses.

    fn retryable_error() -> PipelineError {
        PipelineError::new(
            ErrorCode::PersistenceFailure,
            Stage::Persist,
            anyhow::anyhow!("connection reset"),
        )
    }

    #[test]
    fn exhaustion_upgrade_keeps_the_cause_in_the_message() {
        let error = retryable_error();
        let detail = format!("{}: {}", error.code, error.detail());
        assert!(detail.starts_with("persistence_failure:"));
        assert!(detail.contains("connection reset"));
    }

    #[test]
    fn exhaustion_threshold_matches_the_retry_budget() {
        let max_retries = 3u32;
        // Attempts 1..=3 keep retrying; attempt 4 has spent the budget.
        for attempt in 1..=3u32 {
            assert!(attempt.saturating_sub(1) < max_retries, "{attempt}");
        }
        assert!(4u32.saturating_sub(1) >= max_retries);
    }

    #[test]
    fn retry_exhausted_is_terminal_and_dead_letters() {
        assert!(!ErrorCode::RetryExhausted.is_retryable());
        assert!(!ErrorCode::RetryExhausted.remediation_hint().is_empty());
    }
}
