use chrono::Utc;
use models::ErrorCode;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::Error;

/// A terminally failed event bound for the dead-letter stream: the
/// original envelope fields plus the classification.
#[derive(Debug)]
pub struct DeadLetter<'a> {
    pub original: &'a BTreeMap<String, String>,
    pub code: ErrorCode,
    pub message: String,
    pub attempt_count: u32,
    pub trace_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct DlqPublisher {
    conn: ConnectionManager,
    stream: String,
}

impl DlqPublisher {
    pub fn new(conn: ConnectionManager, stream: String) -> Self {
        Self { conn, stream }
    }

    /// Append one record. Callers treat failures as log-and-continue: a
    /// DLQ outage must never block the ack decision.
    pub async fn publish(&self, letter: DeadLetter<'_>) -> Result<String, Error> {
        let mut fields: Vec<(String, String)> = letter
            .original
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        fields.push(("error_code".to_string(), letter.code.as_str().to_string()));
        fields.push(("error_message".to_string(), letter.message.clone()));
        fields.push((
            "remediation_hint".to_string(),
            letter.code.remediation_hint().to_string(),
        ));
        fields.push(("failed_at".to_string(), Utc::now().to_rfc3339()));
        fields.push((
            "attempt_count".to_string(),
            letter.attempt_count.to_string(),
        ));
        if let Some(trace_id) = letter.trace_id {
            fields.push(("trace_id".to_string(), trace_id.to_string()));
        }

        let mut conn = self.conn.clone();
        let id: String = conn.xadd(&self.stream, "*", &fields).await?;
        Ok(id)
    }
}
