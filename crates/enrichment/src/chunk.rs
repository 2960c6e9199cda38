use models::Segment;
use serde::{Deserialize, Serialize};

use crate::embed::{cosine, Embedder};
use crate::Error;

/// Sliding windows are sized and overlapped in whitespace tokens.
const WINDOW_TOKENS: usize = 512;
const WINDOW_OVERLAP: usize = 64;
/// Chunks below this size are merged with their neighbor.
const MIN_CHUNK_TOKENS: usize = 32;
/// No strategy emits chunks larger than this.
const MAX_CHUNK_TOKENS: usize = 512;
/// Semantic accumulation breaks when a segment's cosine similarity
/// against the running chunk mean drops below this.
const SEMANTIC_DROP_THRESHOLD: f32 = 0.35;

/// Strategy selection thresholds, in median whitespace tokens per segment.
const SHORT_SEGMENT_MEDIAN: usize = 300;
const LONG_SEGMENT_MEDIAN: usize = 600;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    TurnBased,
    SpeakerGrouped,
    SlidingWindow,
    Semantic,
}

impl ChunkingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingStrategy::TurnBased => "turn_based",
            ChunkingStrategy::SpeakerGrouped => "speaker_grouped",
            ChunkingStrategy::SlidingWindow => "sliding_window",
            ChunkingStrategy::Semantic => "semantic",
        }
    }
}

/// A unit of text assembled from contiguous segments for embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_index: usize,
    pub text: String,
    /// Distinct speakers in encounter order.
    pub speaker_ids: Vec<String>,
    /// `(first_segment_id, last_segment_id)` covered by this chunk.
    pub turn_range: (String, String),
    /// Inclusive indices into the conversation's segment list.
    pub segment_range: (usize, usize),
}

pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Pick the strategy for one conversation. The rules are ordered; the
/// first match wins.
pub fn choose_strategy(participants: usize, median_segment_tokens: usize) -> ChunkingStrategy {
    if participants <= 2 && median_segment_tokens <= SHORT_SEGMENT_MEDIAN {
        ChunkingStrategy::TurnBased
    } else if participants >= 3 {
        ChunkingStrategy::SpeakerGrouped
    } else if median_segment_tokens > LONG_SEGMENT_MEDIAN {
        ChunkingStrategy::SlidingWindow
    } else {
        ChunkingStrategy::Semantic
    }
}

/// Lower median of per-segment token counts.
fn median_segment_tokens(segments: &[Segment]) -> usize {
    let mut counts: Vec<usize> = segments.iter().map(|s| token_count(&s.text)).collect();
    if counts.is_empty() {
        return 0;
    }
    counts.sort_unstable();
    counts[(counts.len() - 1) / 2]
}

/// Chunk one conversation. The embedder is only consulted by the
/// semantic strategy; the other three are pure.
pub async fn chunk_conversation(
    participants: usize,
    segments: &[Segment],
    embedder: &dyn Embedder,
) -> Result<(ChunkingStrategy, Vec<Chunk>), Error> {
    let strategy = choose_strategy(participants, median_segment_tokens(segments));
    let chunks = match strategy {
        ChunkingStrategy::TurnBased => turn_based(segments),
        ChunkingStrategy::SpeakerGrouped => speaker_grouped(segments),
        ChunkingStrategy::SlidingWindow => sliding_window(segments),
        ChunkingStrategy::Semantic => semantic(segments, embedder).await?,
    };
    Ok((strategy, chunks))
}

/// Assemble a chunk from the inclusive segment range `[first, last]`.
fn chunk_from_range(segments: &[Segment], first: usize, last: usize, index: usize) -> Chunk {
    let slice = &segments[first..=last];
    let mut speaker_ids = Vec::new();
    for segment in slice {
        if !speaker_ids.contains(&segment.speaker_id) {
            speaker_ids.push(segment.speaker_id.clone());
        }
    }
    Chunk {
        chunk_index: index,
        text: slice
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        speaker_ids,
        turn_range: (
            slice.first().unwrap().segment_id.clone(),
            slice.last().unwrap().segment_id.clone(),
        ),
        segment_range: (first, last),
    }
}

/// One chunk per segment; undersized segments are merged forward until
/// the minimum is reached.
fn turn_based(segments: &[Segment]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut start = None;
    let mut tokens = 0;

    for (i, segment) in segments.iter().enumerate() {
        let first = *start.get_or_insert(i);
        tokens += token_count(&segment.text);
        if tokens >= MIN_CHUNK_TOKENS {
            chunks.push(chunk_from_range(segments, first, i, chunks.len()));
            start = None;
            tokens = 0;
        }
    }
    if let Some(first) = start {
        // A short tail joins the previous chunk rather than standing alone.
        if let Some(last) = chunks.pop() {
            let index = last.chunk_index;
            chunks.push(chunk_from_range(
                segments,
                last.segment_range.0,
                segments.len() - 1,
                index,
            ));
        } else {
            chunks.push(chunk_from_range(segments, first, segments.len() - 1, 0));
        }
    }
    chunks
}

/// Contiguous run per speaker, split when a run outgrows the cap.
fn speaker_grouped(segments: &[Segment]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut start = None;
    let mut tokens = 0;

    for (i, segment) in segments.iter().enumerate() {
        let segment_tokens = token_count(&segment.text);
        let same_speaker = start
            .map(|first: usize| segments[first].speaker_id == segment.speaker_id)
            .unwrap_or(true);

        if start.is_some() && (!same_speaker || tokens + segment_tokens > MAX_CHUNK_TOKENS) {
            chunks.push(chunk_from_range(segments, start.unwrap(), i - 1, chunks.len()));
            start = None;
            tokens = 0;
        }
        start.get_or_insert(i);
        tokens += segment_tokens;
    }
    if let Some(first) = start {
        chunks.push(chunk_from_range(segments, first, segments.len() - 1, chunks.len()));
    }
    chunks
}

/// Fixed token windows with overlap across segment boundaries. Windows
/// carry the full segment span they touch.
fn sliding_window(segments: &[Segment]) -> Vec<Chunk> {
    // Flatten to (segment index, token) so windows can attribute their
    // first and last token back to segments.
    let mut tokens: Vec<(usize, &str)> = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        for token in segment.text.split_whitespace() {
            tokens.push((i, token));
        }
    }
    if tokens.is_empty() {
        return Vec::new();
    }

    let step = WINDOW_TOKENS - WINDOW_OVERLAP;
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < tokens.len() {
        let window = &tokens[offset..(offset + WINDOW_TOKENS).min(tokens.len())];
        let first_segment = window.first().unwrap().0;
        let last_segment = window.last().unwrap().0;

        let mut chunk = chunk_from_range(segments, first_segment, last_segment, chunks.len());
        // The window text is the exact token span, not whole segments.
        chunk.text = window
            .iter()
            .map(|(_, t)| *t)
            .collect::<Vec<_>>()
            .join(" ");
        chunks.push(chunk);

        if offset + WINDOW_TOKENS >= tokens.len() {
            break;
        }
        offset += step;
    }
    chunks
}

/// Greedy accumulation against a running mean embedding: a segment that
/// no longer resembles the chunk being built starts the next one.
async fn semantic(segments: &[Segment], embedder: &dyn Embedder) -> Result<Vec<Chunk>, Error> {
    let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
    let embeddings = embedder.embed(&texts).await?;

    let mut chunks = Vec::new();
    let mut first = 0;
    let mut tokens = 0;
    let mut mean: Vec<f32> = Vec::new();
    let mut members = 0f32;

    for (i, segment) in segments.iter().enumerate() {
        let segment_tokens = token_count(&segment.text);
        let boundary = members > 0.0
            && (cosine(&embeddings[i], &mean) < SEMANTIC_DROP_THRESHOLD
                || tokens + segment_tokens > MAX_CHUNK_TOKENS);

        if boundary {
            chunks.push(chunk_from_range(segments, first, i - 1, chunks.len()));
            first = i;
            tokens = 0;
            mean.clear();
            members = 0.0;
        }

        if mean.is_empty() {
            mean = embeddings[i].clone();
        } else {
            for (m, x) in mean.iter_mut().zip(&embeddings[i]) {
                *m = (*m * members + x) / (members + 1.0);
            }
        }
        members += 1.0;
        tokens += segment_tokens;
    }
    if !segments.is_empty() {
        chunks.push(chunk_from_range(segments, first, segments.len() - 1, chunks.len()));
    }
    Ok(chunks)
}

#[cfg(test)]
mod test {
    use super::*;

    fn segment(id: &str, speaker: &str, text: &str) -> Segment {
        Segment {
            segment_id: id.to_string(),
            speaker_id: speaker.to_string(),
            start_ms: 0,
            end_ms: 1000,
            text: text.to_string(),
            language: "en".to_string(),
            confidence: 0.9,
            annotations: None,
        }
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn strategy_selection_follows_rule_order() {
        assert_eq!(choose_strategy(2, 100), ChunkingStrategy::TurnBased);
        assert_eq!(choose_strategy(1, 300), ChunkingStrategy::TurnBased);
        assert_eq!(choose_strategy(3, 100), ChunkingStrategy::SpeakerGrouped);
        assert_eq!(choose_strategy(5, 700), ChunkingStrategy::SpeakerGrouped);
        assert_eq!(choose_strategy(2, 601), ChunkingStrategy::SlidingWindow);
        assert_eq!(choose_strategy(2, 400), ChunkingStrategy::Semantic);
    }

    #[test]
    fn turn_based_merges_small_segments() {
        let segments = vec![
            segment("seg-1", "a", &words(40)),
            segment("seg-2", "b", "uh huh"),
            segment("seg-3", "a", &words(40)),
            segment("seg-4", "b", "right"),
        ];
        let chunks = turn_based(&segments);

        // seg-2 is too small on its own and merges forward into seg-3;
        // the trailing seg-4 joins the previous chunk.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].turn_range, ("seg-1".to_string(), "seg-1".to_string()));
        assert_eq!(chunks[1].turn_range, ("seg-2".to_string(), "seg-4".to_string()));
        assert_eq!(chunks[1].speaker_ids, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[test]
    fn speaker_grouping_breaks_on_speaker_change_and_cap() {
        let segments = vec![
            segment("seg-1", "a", &words(300)),
            segment("seg-2", "a", &words(300)),
            segment("seg-3", "b", &words(10)),
            segment("seg-4", "b", &words(10)),
            segment("seg-5", "c", &words(10)),
        ];
        let chunks = speaker_grouped(&segments);

        // Speaker a's run exceeds the cap and splits; b's segments group.
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].turn_range, ("seg-1".to_string(), "seg-1".to_string()));
        assert_eq!(chunks[1].turn_range, ("seg-2".to_string(), "seg-2".to_string()));
        assert_eq!(chunks[2].turn_range, ("seg-3".to_string(), "seg-4".to_string()));
        assert_eq!(chunks[2].speaker_ids, vec!["b".to_string()]);
        assert_eq!(chunks[3].speaker_ids, vec!["c".to_string()]);
    }

    #[test]
    fn sliding_window_overlaps_and_attributes_segments() {
        let segments = vec![
            segment("seg-1", "a", &words(400)),
            segment("seg-2", "b", &words(400)),
        ];
        let chunks = sliding_window(&segments);

        // 800 tokens, window 512, step 448: windows at 0 and 448.
        assert_eq!(chunks.len(), 2);
        assert_eq!(token_count(&chunks[0].text), 512);
        assert_eq!(chunks[0].turn_range, ("seg-1".to_string(), "seg-2".to_string()));
        assert_eq!(token_count(&chunks[1].text), 800 - 448);
        assert_eq!(chunks[1].turn_range, ("seg-2".to_string(), "seg-2".to_string()));
    }

    struct FixedEmbedder(Vec<Vec<f32>>);

    #[async_trait::async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
            Ok(self.0[..texts.len()].to_vec())
        }

        fn dimension(&self) -> usize {
            self.0.first().map(Vec::len).unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn semantic_breaks_on_topic_shift() {
        // Two orthogonal topic clusters.
        let embedder = FixedEmbedder(vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
        ]);
        let segments = vec![
            segment("seg-1", "a", "budget numbers for the quarter"),
            segment("seg-2", "b", "revenue is ahead of plan"),
            segment("seg-3", "a", "switching topics entirely to hiring"),
            segment("seg-4", "b", "two offers went out this week"),
        ];

        let chunks = semantic(&segments, &embedder).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].turn_range, ("seg-1".to_string(), "seg-2".to_string()));
        assert_eq!(chunks[1].turn_range, ("seg-3".to_string(), "seg-4".to_string()));
    }
}
