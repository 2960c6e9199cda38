use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one ingestion job. `Completed` and `Failed` are terminal
/// and a job reaches a terminal state at most once.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Received,
    Parsed,
    Downloading,
    Normalizing,
    Embedding,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::Parsed => "parsed",
            JobStatus::Downloading => "downloading",
            JobStatus::Normalizing => "normalizing",
            JobStatus::Embedding => "embedding",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status {0:?}")]
pub struct ParseJobStatusError(String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(JobStatus::Received),
            "parsed" => Ok(JobStatus::Parsed),
            "downloading" => Ok(JobStatus::Downloading),
            "normalizing" => Ok(JobStatus::Normalizing),
            "embedding" => Ok(JobStatus::Embedding),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// Where NLP annotations for a conversation came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NlpSource {
    /// Annotations consumed from the document (v1.1+ producers).
    Upstream,
    /// Annotations computed by the local models.
    Local,
    /// Chunking and embedding only; no annotations.
    None,
}

impl NlpSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NlpSource::Upstream => "upstream",
            NlpSource::Local => "local",
            NlpSource::None => "none",
        }
    }
}

impl fmt::Display for NlpSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NlpSource {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upstream" => Ok(NlpSource::Upstream),
            "local" => Ok(NlpSource::Local),
            "none" => Ok(NlpSource::None),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}
