use models::{Entity, SentimentAnnotation};
use serde::Deserialize;

use crate::Error;

#[derive(Debug, Clone)]
pub struct NlpConfig {
    /// Base URL of the annotation sidecar serving `/sentiment` and `/ner`.
    pub url: String,
    pub batch_size: usize,
}

/// Client for the local annotation models, used on the legacy branch when
/// the document carries no upstream annotations.
#[derive(Clone)]
pub struct NlpClient {
    http: reqwest::Client,
    config: NlpConfig,
}

#[derive(Deserialize)]
struct SentimentResponse {
    results: Vec<SentimentAnnotation>,
}

#[derive(Deserialize)]
struct NerResponse {
    results: Vec<Vec<Entity>>,
}

impl NlpClient {
    pub fn new(http: reqwest::Client, config: NlpConfig) -> Self {
        Self { http, config }
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Five-label sentiment for each text, in order.
    pub async fn sentiment(&self, texts: &[String]) -> Result<Vec<SentimentAnnotation>, Error> {
        let response: SentimentResponse = self.call("sentiment", texts).await?;
        if response.results.len() != texts.len() {
            return Err(Error::Annotation(anyhow::anyhow!(
                "sentiment model returned {} results for {} inputs",
                response.results.len(),
                texts.len()
            )));
        }
        Ok(response.results)
    }

    /// Named entities for each text, in order. Empty inner vectors are
    /// expected for texts without any recognized entity.
    pub async fn entities(&self, texts: &[String]) -> Result<Vec<Vec<Entity>>, Error> {
        let response: NerResponse = self.call("ner", texts).await?;
        if response.results.len() != texts.len() {
            return Err(Error::Annotation(anyhow::anyhow!(
                "ner model returned {} results for {} inputs",
                response.results.len(),
                texts.len()
            )));
        }
        Ok(response.results)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        route: &str,
        texts: &[String],
    ) -> Result<T, Error> {
        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), route);
        self.http
            .post(url)
            .json(&serde_json::json!({ "texts": texts }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| Error::Annotation(err.into()))?
            .json()
            .await
            .map_err(|err| Error::Annotation(err.into()))
    }
}
