use models::{EntityType, SentimentLabel};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::engine::TurnAnnotation;

/// How many top-mentioned persons a conversation records.
const TOP_PERSONS: usize = 5;

/// Conversation-level rollup of per-segment annotations, identical for
/// the upstream and local branches.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ConversationAggregates {
    /// Counts keyed by sentiment label.
    pub sentiment_histogram: BTreeMap<String, u64>,
    /// Up to five `(person, mentions)` pairs, most-mentioned first.
    pub top_persons: Vec<(String, u64)>,
    /// Counts keyed by entity type.
    pub entity_type_counts: BTreeMap<String, u64>,
}

pub fn aggregate_annotations(annotations: &[TurnAnnotation]) -> ConversationAggregates {
    let mut sentiment_histogram: BTreeMap<String, u64> = BTreeMap::new();
    let mut person_mentions: BTreeMap<String, u64> = BTreeMap::new();
    let mut entity_type_counts: BTreeMap<String, u64> = BTreeMap::new();

    for annotation in annotations {
        if let Some(sentiment) = &annotation.sentiment {
            *sentiment_histogram
                .entry(sentiment.label.as_str().to_string())
                .or_default() += 1;
        }
        for entity in &annotation.entities {
            *entity_type_counts
                .entry(entity.entity_type.as_str().to_string())
                .or_default() += 1;
            if entity.entity_type == EntityType::Person {
                *person_mentions.entry(entity.text.clone()).or_default() += 1;
            }
        }
    }

    // Most mentions first; ties resolve alphabetically for stable output.
    let mut top_persons: Vec<(String, u64)> = person_mentions.into_iter().collect();
    top_persons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_persons.truncate(TOP_PERSONS);

    ConversationAggregates {
        sentiment_histogram,
        top_persons,
        entity_type_counts,
    }
}

/// Histogram keys for the full label scale, zero-filled. Useful for
/// dashboards that want all five buckets present.
pub fn full_histogram(histogram: &BTreeMap<String, u64>) -> BTreeMap<String, u64> {
    let mut full = BTreeMap::new();
    for label in [
        SentimentLabel::VeryNegative,
        SentimentLabel::Negative,
        SentimentLabel::Neutral,
        SentimentLabel::Positive,
        SentimentLabel::VeryPositive,
    ] {
        full.insert(
            label.as_str().to_string(),
            histogram.get(label.as_str()).copied().unwrap_or(0),
        );
    }
    full
}
