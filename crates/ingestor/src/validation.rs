use chrono::{Duration, Utc};
use models::{ConversationDoc, Envelope};
use std::path::Path;

/// Primary language subtags the pipeline accepts. Regional variants
/// (`en-US`, `pt-BR`) match on their primary subtag.
const KNOWN_LANGUAGES: &[&str] = &[
    "ar", "cs", "da", "de", "en", "es", "fi", "fr", "hi", "it", "ja", "ko", "nl", "no", "pl",
    "pt", "ru", "sv", "tr", "uk", "zh",
];

/// Event identifiers dated further into the future than this are flagged
/// as clock skew but still accepted.
const MAX_FUTURE_SKEW_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
#[error("conversation document rejected: {0}")]
pub struct DocumentError(pub String);

#[derive(Debug)]
pub struct ValidatedDocument {
    pub doc: ConversationDoc,
    /// Non-fatal findings, logged by the caller.
    pub warnings: Vec<String>,
}

/// Structural and semantic validation of `conversation.json` against the
/// envelope it arrived under. Every rejection maps to
/// `validation_error`; warnings never reject.
pub fn validate_document(
    package_dir: &Path,
    top_dir: &str,
    envelope: &Envelope,
) -> Result<ValidatedDocument, DocumentError> {
    let path = package_dir.join("conversation.json");
    let bytes = std::fs::read(&path)
        .map_err(|err| DocumentError(format!("conversation.json is unreadable: {err}")))?;

    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Err(DocumentError(
            "conversation.json must be UTF-8 without a byte order mark".to_string(),
        ));
    }
    let doc: ConversationDoc = serde_json::from_slice(&bytes)
        .map_err(|err| DocumentError(format!("conversation.json does not match the schema: {err}")))?;

    let mut warnings = Vec::new();

    // Identity chain: envelope, archive layout, and document must agree.
    if doc.external_event_id != envelope.external_event_id.as_str() {
        return Err(DocumentError(format!(
            "document external_event_id {} does not match envelope {}",
            doc.external_event_id, envelope.external_event_id
        )));
    }
    if top_dir != doc.external_event_id {
        return Err(DocumentError(format!(
            "archive root directory {} does not match external_event_id {}",
            top_dir, doc.external_event_id
        )));
    }
    if doc.schema_version != envelope.schema_version {
        return Err(DocumentError(format!(
            "document schema_version {} does not match envelope {}",
            doc.schema_version, envelope.schema_version
        )));
    }

    if doc.meeting_metadata.duration_sec.is_none() && doc.meeting_metadata.end_at.is_none() {
        return Err(DocumentError(
            "meeting_metadata requires duration_sec or end_at".to_string(),
        ));
    }

    if doc.participants.is_empty() {
        return Err(DocumentError("participants must not be empty".to_string()));
    }
    if doc.segments.is_empty() {
        return Err(DocumentError("segments must not be empty".to_string()));
    }

    let speaker_ids: std::collections::BTreeSet<&str> = doc
        .participants
        .iter()
        .map(|p| p.speaker_id.as_str())
        .collect();

    for segment in &doc.segments {
        let id = &segment.segment_id;
        if segment.start_ms > segment.end_ms {
            return Err(DocumentError(format!(
                "segment {id}: start_ms {} exceeds end_ms {}",
                segment.start_ms, segment.end_ms
            )));
        }
        if !(0.0..=1.0).contains(&segment.confidence) {
            return Err(DocumentError(format!(
                "segment {id}: confidence {} is outside [0, 1]",
                segment.confidence
            )));
        }
        if segment.text.trim().is_empty() {
            return Err(DocumentError(format!("segment {id}: text is empty")));
        }
        if !known_language(&segment.language) {
            return Err(DocumentError(format!(
                "segment {id}: unknown language code {:?}",
                segment.language
            )));
        }
        if !speaker_ids.contains(segment.speaker_id.as_str()) {
            return Err(DocumentError(format!(
                "segment {id}: speaker {} is not listed in participants",
                segment.speaker_id
            )));
        }
    }

    // Accepted with a warning: producers with skewed clocks are a known
    // reality and rejecting them loses data.
    if let Some(recorded_at) = envelope.external_event_id.recorded_at() {
        if recorded_at > Utc::now() + Duration::hours(MAX_FUTURE_SKEW_HOURS) {
            warnings.push(format!(
                "external_event_id timestamp {recorded_at} is more than {MAX_FUTURE_SKEW_HOURS}h in the future"
            ));
        }
    }

    for key in doc.extra.keys() {
        warnings.push(format!("unknown top-level key {key:?} preserved"));
    }

    Ok(ValidatedDocument { doc, warnings })
}

fn known_language(code: &str) -> bool {
    let primary = code.split('-').next().unwrap_or_default();
    KNOWN_LANGUAGES.contains(&primary.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    const EVENT_ID: &str = "rec-20251003T091500Z-3f9c4241";

    fn envelope() -> Envelope {
        let mut fields = BTreeMap::new();
        for (k, v) in [
            ("external_event_id", EVENT_ID),
            ("package_uri", "s3://ingestion/packages/p.tar.gz"),
            ("schema_version", "1.1"),
            ("retry_count", "0"),
            ("produced_at", "2025-10-03T09:16:02Z"),
            (
                "producer",
                r#"{"service":"transcriber","instance":"transcriber-1"}"#,
            ),
            ("priority", "normal"),
            (
                "metadata",
                r#"{"trace_id":"550e8400-e29b-41d4-a716-446655440000"}"#,
            ),
        ] {
            fields.insert(k.to_string(), v.to_string());
        }
        fields.insert(
            "checksum".to_string(),
            format!("sha256:{}", "ab".repeat(32)),
        );
        Envelope::parse(&fields, &[1]).unwrap()
    }

    fn base_doc() -> serde_json::Value {
        serde_json::json!({
            "schema_version": "1.1",
            "external_event_id": EVENT_ID,
            "source_system": "transcriber",
            "created_at": "2025-10-03T09:20:00Z",
            "meeting_metadata": {
                "scheduled_start": "2025-10-03T09:00:00Z",
                "duration_sec": 1800
            },
            "participants": [{"speaker_id": "spk-1"}],
            "segments": [{
                "segment_id": "seg-1",
                "speaker_id": "spk-1",
                "start_ms": 100,
                "end_ms": 100,
                "text": "hello",
                "language": "en-US",
                "confidence": 1.0
            }]
        })
    }

    fn write_doc(dir: &Path, doc: &serde_json::Value) {
        std::fs::create_dir_all(dir.join(EVENT_ID)).unwrap();
        std::fs::write(
            dir.join(EVENT_ID).join("conversation.json"),
            serde_json::to_vec(doc).unwrap(),
        )
        .unwrap();
    }

    fn validate(doc: &serde_json::Value) -> Result<ValidatedDocument, DocumentError> {
        let tmp = tempfile::tempdir().unwrap();
        write_doc(tmp.path(), doc);
        validate_document(&tmp.path().join(EVENT_ID), EVENT_ID, &envelope())
    }

    #[test]
    fn accepts_minimal_document_with_zero_length_segment() {
        // start_ms == end_ms is legal; regional language codes match on
        // their primary subtag.
        let validated = validate(&base_doc()).unwrap();
        assert!(validated.warnings.is_empty());
        assert_eq!(validated.doc.segments.len(), 1);
    }

    #[test]
    fn warns_on_unknown_top_level_keys() {
        let mut doc = base_doc();
        doc["recorder_firmware"] = serde_json::json!("2.4.1");
        let validated = validate(&doc).unwrap();
        assert_eq!(validated.warnings.len(), 1);
        assert!(validated.warnings[0].contains("recorder_firmware"));
        // Preserved for downstream consumers.
        assert!(validated.doc.extra.contains_key("recorder_firmware"));
    }

    #[test]
    fn rejects_inverted_segment_bounds() {
        let mut doc = base_doc();
        doc["segments"][0]["start_ms"] = serde_json::json!(200);
        doc["segments"][0]["end_ms"] = serde_json::json!(100);
        assert!(validate(&doc).unwrap_err().0.contains("exceeds end_ms"));
    }

    #[test]
    fn rejects_semantic_violations() {
        let cases: Vec<(serde_json::Value, &str)> = vec![
            {
                let mut d = base_doc();
                d["segments"][0]["confidence"] = serde_json::json!(1.5);
                (d, "confidence")
            },
            {
                let mut d = base_doc();
                d["segments"][0]["text"] = serde_json::json!("   ");
                (d, "text is empty")
            },
            {
                let mut d = base_doc();
                d["segments"][0]["language"] = serde_json::json!("tlh");
                (d, "unknown language")
            },
            {
                let mut d = base_doc();
                d["segments"][0]["speaker_id"] = serde_json::json!("spk-9");
                (d, "not listed in participants")
            },
            {
                let mut d = base_doc();
                d["meeting_metadata"] = serde_json::json!({
                    "scheduled_start": "2025-10-03T09:00:00Z"
                });
                (d, "duration_sec or end_at")
            },
            {
                let mut d = base_doc();
                d["external_event_id"] = serde_json::json!("rec-20251003T091500Z-deadbeef");
                (d, "does not match envelope")
            },
            {
                let mut d = base_doc();
                d["schema_version"] = serde_json::json!("1.0");
                (d, "does not match envelope")
            },
        ];

        for (doc, needle) in cases {
            let err = validate(&doc).unwrap_err();
            assert!(err.0.contains(needle), "expected {needle:?} in {err}");
        }
    }

    #[test]
    fn rejects_byte_order_mark() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(EVENT_ID)).unwrap();
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend(serde_json::to_vec(&base_doc()).unwrap());
        std::fs::write(tmp.path().join(EVENT_ID).join("conversation.json"), bytes).unwrap();

        let err = validate_document(&tmp.path().join(EVENT_ID), EVENT_ID, &envelope()).unwrap_err();
        assert!(err.0.contains("byte order mark"));
    }

    #[test]
    fn rejects_mismatched_archive_root() {
        let tmp = tempfile::tempdir().unwrap();
        write_doc(tmp.path(), &base_doc());
        let err =
            validate_document(&tmp.path().join(EVENT_ID), "rec-other", &envelope()).unwrap_err();
        assert!(err.0.contains("archive root directory"));
    }
}
