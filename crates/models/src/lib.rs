mod document;
mod envelope;
mod errors;
mod job;
mod version;

pub use document::{
    Annotations, Attachment, ConversationDoc, Entity, EntityType, MeetingMetadata, Participant,
    Segment, SentimentAnnotation, SentimentLabel,
};
pub use envelope::{
    Envelope, EnvelopeError, ExternalEventId, PackageUri, Priority, Producer, CHECKSUM_RE,
    EVENT_ID_RE,
};
pub use errors::{ErrorCode, PipelineError, Stage};
pub use job::{JobStatus, NlpSource, ParseJobStatusError};
pub use version::{ParseVersionError, SchemaVersion};
