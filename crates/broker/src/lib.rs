//! Client for the durable event log: a Redis Streams consumer group for
//! the ingestion stream, and a best-effort dead-letter publisher.

mod consumer;
mod dlq;

pub use consumer::{connect, Acker, Consumer, ConsumerConfig, Delivery};
pub use dlq::{DeadLetter, DlqPublisher};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("stream entry {0:?} has a non-string field {1:?}")]
    NonStringField(String, String),
}
