use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::SchemaVersion;

/// The canonical conversation document carried in `conversation.json`.
///
/// Unknown top-level keys are collected into `extra` rather than rejected:
/// the validator warns about them and they are preserved for downstream
/// consumers on re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDoc {
    pub schema_version: SchemaVersion,
    pub external_event_id: String,
    pub source_system: String,
    pub created_at: DateTime<Utc>,
    pub meeting_metadata: MeetingMetadata,
    pub participants: Vec<Participant>,
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_flags: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub scheduled_start: DateTime<Utc>,
    /// Either `duration_sec` or `end_at` must be present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub speaker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// One speaker turn with text and time bounds. `start_ms == end_ms` is
/// legal (zero-length interjections occur in real transcripts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: String,
    pub speaker_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub language: String,
    pub confidence: f64,
    /// Present for v1.1+ producers that enrich upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Segment {
    /// True when this segment carries a usable upstream annotation.
    pub fn has_upstream_annotations(&self) -> bool {
        match &self.annotations {
            None => false,
            Some(a) => a.sentiment.is_some() || !a.entities.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<SentimentAnnotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentAnnotation {
    pub label: SentimentLabel,
    pub score: f64,
}

/// Five-label sentiment scale. `stars` maps it onto the 1..=5 scale the
/// turn rows persist.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    VeryNegative,
    Negative,
    Neutral,
    Positive,
    VeryPositive,
}

impl SentimentLabel {
    pub fn stars(&self) -> i16 {
        match self {
            SentimentLabel::VeryNegative => 1,
            SentimentLabel::Negative => 2,
            SentimentLabel::Neutral => 3,
            SentimentLabel::Positive => 4,
            SentimentLabel::VeryPositive => 5,
        }
    }

    pub fn from_stars(stars: i16) -> Option<Self> {
        match stars {
            1 => Some(SentimentLabel::VeryNegative),
            2 => Some(SentimentLabel::Negative),
            3 => Some(SentimentLabel::Neutral),
            4 => Some(SentimentLabel::Positive),
            5 => Some(SentimentLabel::VeryPositive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::VeryNegative => "very_negative",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Positive => "positive",
            SentimentLabel::VeryPositive => "very_positive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The closed entity label set shared by upstream annotations and the
/// local recognizer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Person,
    Location,
    Organization,
    Date,
    Time,
    Money,
    Misc,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Location => "LOCATION",
            EntityType::Organization => "ORGANIZATION",
            EntityType::Date => "DATE",
            EntityType::Time => "TIME",
            EntityType::Money => "MONEY",
            EntityType::Misc => "MISC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    const DOC: &str = r#"{
        "schema_version": "1.1",
        "external_event_id": "rec-20251003T091500Z-3f9c4241",
        "source_system": "transcriber",
        "created_at": "2025-10-03T09:20:00Z",
        "meeting_metadata": {
            "title": "Weekly sync",
            "scheduled_start": "2025-10-03T09:00:00Z",
            "duration_sec": 1800
        },
        "participants": [
            {"speaker_id": "spk-1", "display_name": "Ada"},
            {"speaker_id": "spk-2"}
        ],
        "segments": [
            {
                "segment_id": "seg-1",
                "speaker_id": "spk-1",
                "start_ms": 0,
                "end_ms": 4200,
                "text": "Good morning everyone.",
                "language": "en",
                "confidence": 0.97,
                "annotations": {
                    "sentiment": {"label": "positive", "score": 0.91},
                    "entities": [{"text": "morning", "type": "TIME"}]
                }
            },
            {
                "segment_id": "seg-2",
                "speaker_id": "spk-2",
                "start_ms": 4200,
                "end_ms": 4200,
                "text": "Morning.",
                "language": "en",
                "confidence": 0.88
            }
        ],
        "workspace": "acme"
    }"#;

    #[test]
    fn document_round_trips_and_preserves_unknown_keys() {
        let doc: ConversationDoc = serde_json::from_str(DOC).unwrap();

        assert_eq!(doc.schema_version, SchemaVersion::V1_1);
        assert_eq!(doc.segments.len(), 2);
        assert!(doc.segments[0].has_upstream_annotations());
        assert!(!doc.segments[1].has_upstream_annotations());
        assert_eq!(doc.extra.get("workspace"), Some(&serde_json::json!("acme")));

        let round = serde_json::to_value(&doc).unwrap();
        assert_eq!(round.get("workspace"), Some(&serde_json::json!("acme")));
    }

    #[test]
    fn sentiment_star_mapping_is_total() {
        for label in [
            SentimentLabel::VeryNegative,
            SentimentLabel::Negative,
            SentimentLabel::Neutral,
            SentimentLabel::Positive,
            SentimentLabel::VeryPositive,
        ] {
            assert_eq!(SentimentLabel::from_stars(label.stars()), Some(label));
        }
        assert_eq!(SentimentLabel::from_stars(0), None);
        assert_eq!(SentimentLabel::from_stars(6), None);
    }

    #[test]
    fn entity_types_use_uppercase_wire_form() {
        let entity: Entity =
            serde_json::from_str(r#"{"text": "Berlin", "type": "LOCATION"}"#).unwrap();
        assert_eq!(entity.entity_type, EntityType::Location);
        assert!(serde_json::from_str::<Entity>(r#"{"text": "x", "type": "CITY"}"#).is_err());
    }
}
