use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::ErrorCode;

lazy_static! {
    /// External event identifiers look like `rec-20251003T091500Z-3f9c4241`.
    pub static ref EVENT_ID_RE: Regex =
        Regex::new(r"^rec-\d{8}T\d{6}Z-[a-f0-9]{8}$").unwrap();
    /// Envelope checksums are a `sha256:` prefix plus 64 lowercase hex characters.
    pub static ref CHECKSUM_RE: Regex = Regex::new(r"^sha256:[a-f0-9]{64}$").unwrap();
}

/// Metadata maps are bounded; anything larger is a producer bug.
const MAX_METADATA_KEYS: usize = 32;
/// Per-event retry counters are bounded; the DLQ cap kicks in far earlier.
const MAX_RETRY_COUNT: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("required field {0:?} is missing or empty")]
    MissingField(&'static str),
    #[error("external_event_id {0:?} does not match the producer contract")]
    InvalidEventId(String),
    #[error("checksum {0:?} is not `sha256:` plus 64 lowercase hex characters")]
    InvalidChecksum(String),
    #[error("package_uri {0:?} is not of the form <scheme>://<bucket>/<object-key>")]
    InvalidPackageUri(String),
    #[error(transparent)]
    InvalidSchemaVersion(#[from] crate::version::ParseVersionError),
    #[error("schema major version {0} is not accepted by this deployment")]
    UnknownSchemaMajor(u32),
    #[error("retry_count {0:?} is not a non-negative integer")]
    InvalidRetryCount(String),
    #[error("retry_count {0} exceeds the bound of {MAX_RETRY_COUNT}")]
    RetryCountOutOfRange(u32),
    #[error("produced_at {0:?} is not an RFC 3339 instant")]
    InvalidProducedAt(String),
    #[error("producer is not a {{service, instance}} object: {0}")]
    InvalidProducer(#[source] serde_json::Error),
    #[error("priority {0:?} is neither `normal` nor `high`")]
    InvalidPriority(String),
    #[error("metadata is not a JSON object of at most {MAX_METADATA_KEYS} keys")]
    InvalidMetadata,
    #[error("metadata.trace_id is required")]
    MissingTraceId,
    #[error("metadata.trace_id {0:?} is not a UUID")]
    InvalidTraceId(String),
}

impl EnvelopeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EnvelopeError::UnknownSchemaMajor(_) => ErrorCode::UnknownSchemaMajor,
            _ => ErrorCode::ValidationError,
        }
    }
}

/// Validated external event identifier, the deduplication key of the whole
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalEventId(String);

impl ExternalEventId {
    pub fn parse(s: &str) -> Result<Self, EnvelopeError> {
        if !EVENT_ID_RE.is_match(s) {
            return Err(EnvelopeError::InvalidEventId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The recording timestamp embedded in the identifier. The regex
    /// guarantees the shape but not calendar validity, so this can fail.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        let stamp = &self.0[4..20]; // `20251003T091500Z`
        NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%SZ")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl fmt::Display for ExternalEventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExternalEventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A `<scheme>://<bucket>/<object-key>` locator, split for the object store
/// client. The raw form is retained for job rows and DLQ forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUri {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl PackageUri {
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let err = || EnvelopeError::InvalidPackageUri(raw.to_string());

        let (scheme, rest) = raw.split_once("://").ok_or_else(err)?;
        let (bucket, key) = rest.split_once('/').ok_or_else(err)?;
        if scheme.is_empty() || bucket.is_empty() || key.is_empty() {
            return Err(err());
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for PackageUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Producer {
    pub service: String,
    pub instance: String,
}

/// A fully validated event envelope. Construction via [`Envelope::parse`] is
/// the only path, so holding one implies every field-level invariant holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub external_event_id: ExternalEventId,
    pub package_uri: PackageUri,
    /// Lowercase hex SHA-256 digest, without the `sha256:` prefix.
    pub checksum: String,
    pub schema_version: crate::SchemaVersion,
    pub retry_count: u32,
    pub produced_at: DateTime<Utc>,
    pub producer: Producer,
    pub priority: Priority,
    pub trace_id: Uuid,
    /// The full metadata sub-map, `trace_id` included. Unknown keys are
    /// preserved for forwarding but never dispatched on.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Decode and validate the flat field mapping of one stream entry.
    /// Performs no I/O.
    pub fn parse(
        fields: &BTreeMap<String, String>,
        known_majors: &[u32],
    ) -> Result<Envelope, EnvelopeError> {
        let required = |name: &'static str| -> Result<&str, EnvelopeError> {
            match fields.get(name).map(String::as_str) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(EnvelopeError::MissingField(name)),
            }
        };

        let external_event_id = ExternalEventId::parse(required("external_event_id")?)?;
        let package_uri = PackageUri::parse(required("package_uri")?)?;

        let checksum = required("checksum")?;
        if !CHECKSUM_RE.is_match(checksum) {
            return Err(EnvelopeError::InvalidChecksum(checksum.to_string()));
        }
        let checksum = checksum.trim_start_matches("sha256:").to_string();

        let schema_version: crate::SchemaVersion = required("schema_version")?.parse()?;
        if !known_majors.contains(&schema_version.major) {
            return Err(EnvelopeError::UnknownSchemaMajor(schema_version.major));
        }

        let retry_count = required("retry_count")?;
        let retry_count: u32 = retry_count
            .parse()
            .map_err(|_| EnvelopeError::InvalidRetryCount(retry_count.to_string()))?;
        if retry_count > MAX_RETRY_COUNT {
            return Err(EnvelopeError::RetryCountOutOfRange(retry_count));
        }

        let produced_at = required("produced_at")?;
        let produced_at = DateTime::parse_from_rfc3339(produced_at)
            .map_err(|_| EnvelopeError::InvalidProducedAt(produced_at.to_string()))?
            .with_timezone(&Utc);

        let producer: Producer =
            serde_json::from_str(required("producer")?).map_err(EnvelopeError::InvalidProducer)?;

        let priority = match required("priority")? {
            "normal" => Priority::Normal,
            "high" => Priority::High,
            other => return Err(EnvelopeError::InvalidPriority(other.to_string())),
        };

        let metadata: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(required("metadata")?)
                .map_err(|_| EnvelopeError::InvalidMetadata)?;
        if metadata.len() > MAX_METADATA_KEYS {
            return Err(EnvelopeError::InvalidMetadata);
        }

        let trace_id = match metadata.get("trace_id") {
            None => return Err(EnvelopeError::MissingTraceId),
            Some(serde_json::Value::String(s)) => Uuid::parse_str(s)
                .map_err(|_| EnvelopeError::InvalidTraceId(s.to_string()))?,
            Some(other) => return Err(EnvelopeError::InvalidTraceId(other.to_string())),
        };

        Ok(Envelope {
            external_event_id,
            package_uri,
            checksum,
            schema_version,
            retry_count,
            produced_at,
            producer,
            priority,
            trace_id,
            metadata,
        })
    }
}
