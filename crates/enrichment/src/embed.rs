use serde::Deserialize;

use crate::Error;

/// Producer of dense vectors. The trait seam keeps the chunker and the
/// engine testable without a live model server.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts` in order, returning one unit-length vector each.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error>;

    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Endpoint of the embedding server, e.g. `http://tei:8080/embeddings`.
    pub url: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
}

/// HTTP client for an OpenAI-compatible embedding endpoint. The model
/// mean-pools over tokens; we batch, verify dimensions, and normalize.
#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(http: reqwest::Client, config: EmbeddingConfig) -> Self {
        Self { http, config }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        let response = self
            .http
            .post(&self.config.url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "input": batch,
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| Error::Embedding(err.into()))?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| Error::Embedding(err.into()))?;
        if parsed.data.len() != batch.len() {
            return Err(Error::Embedding(anyhow::anyhow!(
                "provider returned {} vectors for {} inputs",
                parsed.data.len(),
                batch.len()
            )));
        }

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for datum in parsed.data {
            if datum.embedding.len() != self.config.dimension {
                return Err(Error::EmbeddingDimension {
                    expected: self.config.dimension,
                    actual: datum.embedding.len(),
                });
            }
            vectors.push(normalize(datum.embedding));
        }
        Ok(vectors)
    }
}

#[async_trait::async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

/// Scale to unit length. All-zero vectors stay zero rather than NaN.
pub(crate) fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_produces_unit_vectors() {
        let v = normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn cosine_handles_alignment_and_orthogonality() {
        assert!((cosine(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 5.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0], &[1.0]), 0.0);
    }
}
