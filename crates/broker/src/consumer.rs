use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::Error;

/// Open a managed connection to the broker. The connection manager
/// transparently reconnects, which is what a long-lived consumer wants.
pub async fn connect(url: &str) -> Result<ConnectionManager, Error> {
    let client = redis::Client::open(url)?;
    Ok(client.get_connection_manager().await?)
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    /// Must be stable across restarts so pending entries can be claimed.
    pub consumer_name: String,
    pub batch_size: usize,
    pub block: Duration,
    /// Pending entries idle at least this long are reclaimed from their
    /// previous consumer and reprocessed.
    pub reclaim_idle: Duration,
}

/// One entry handed to the pipeline: the broker id for acks, the flat
/// field mapping, and how many times the broker has delivered it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub stream_id: String,
    pub fields: BTreeMap<String, String>,
    /// 1 on first delivery; grows on every re-delivery or reclaim.
    pub delivery_count: u64,
    /// True when this entry was taken over from an idle consumer.
    pub reclaimed: bool,
}

/// Ack handle that can be moved into per-event worker tasks while the
/// consumer keeps reading.
#[derive(Clone)]
pub struct Acker {
    conn: ConnectionManager,
    stream: String,
    group: String,
}

impl Acker {
    /// Acknowledge one entry. Called on success, on duplicates, and on
    /// non-retryable failures; never on retryable ones.
    pub async fn ack(&self, stream_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.xack(&self.stream, &self.group, &[stream_id]).await?;
        Ok(())
    }
}

pub struct Consumer {
    conn: ConnectionManager,
    config: ConsumerConfig,
    /// XAUTOCLAIM scan cursor, advanced by each reclaim pass.
    autoclaim_cursor: String,
}

impl Consumer {
    pub async fn new(conn: ConnectionManager, config: ConsumerConfig) -> Result<Self, Error> {
        let mut consumer = Self {
            conn,
            config,
            autoclaim_cursor: "0-0".to_string(),
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    /// Create the consumer group at the start of the stream if it does not
    /// exist yet. `BUSYGROUP` means another instance got there first.
    async fn ensure_group(&mut self) -> Result<(), Error> {
        let created: redis::RedisResult<()> = self
            .conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;

        match created {
            Ok(()) => {
                tracing::info!(
                    stream = %self.config.stream,
                    group = %self.config.group,
                    "created consumer group"
                );
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Pull the next batch: entries reclaimed from dead consumers first,
    /// then fresh entries, blocking up to the configured timeout. `limit`
    /// caps the batch below the configured size when backpressure leaves
    /// fewer worker slots free.
    pub async fn read_batch(&mut self, limit: usize) -> Result<Vec<Delivery>, Error> {
        let limit = limit.min(self.config.batch_size);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut batch = self.reclaim(limit).await?;
        if batch.len() < limit {
            batch.extend(self.read_fresh(limit - batch.len()).await?);
        }
        Ok(batch)
    }

    async fn reclaim(&mut self, limit: usize) -> Result<Vec<Delivery>, Error> {
        let reply: StreamAutoClaimReply = self
            .conn
            .xautoclaim_options(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer_name,
                self.config.reclaim_idle.as_millis() as usize,
                &self.autoclaim_cursor,
                StreamAutoClaimOptions::default().count(limit),
            )
            .await?;
        self.autoclaim_cursor = reply.next_stream_id.clone();

        if reply.claimed.is_empty() {
            return Ok(Vec::new());
        }
        tracing::warn!(
            count = reply.claimed.len(),
            group = %self.config.group,
            "reclaimed pending entries from idle consumers"
        );

        // XAUTOCLAIM does not carry delivery counts; fetch them from the
        // pending entries list so retry accounting survives reclaims.
        let counts = self
            .delivery_counts(&reply.claimed.first().unwrap().id, reply.claimed.len())
            .await?;

        reply
            .claimed
            .into_iter()
            .map(|entry| {
                let delivery_count = counts.get(&entry.id).copied().unwrap_or(1);
                decode_entry(entry, delivery_count, true)
            })
            .collect()
    }

    async fn delivery_counts(
        &mut self,
        start: &str,
        count: usize,
    ) -> Result<BTreeMap<String, u64>, Error> {
        let reply: StreamPendingCountReply = self
            .conn
            .xpending_count(
                &self.config.stream,
                &self.config.group,
                start,
                "+",
                count,
            )
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|pending| (pending.id, pending.times_delivered as u64))
            .collect())
    }

    async fn read_fresh(&mut self, limit: usize) -> Result<Vec<Delivery>, Error> {
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer_name)
            .count(limit)
            .block(self.config.block.as_millis() as usize);

        let reply: StreamReadReply = self
            .conn
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await?;

        let mut batch = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                batch.push(decode_entry(entry, 1, false)?);
            }
        }
        Ok(batch)
    }

    pub fn acker(&self) -> Acker {
        Acker {
            conn: self.conn.clone(),
            stream: self.config.stream.clone(),
            group: self.config.group.clone(),
        }
    }
}

fn decode_entry(entry: StreamId, delivery_count: u64, reclaimed: bool) -> Result<Delivery, Error> {
    let mut fields = BTreeMap::new();
    for (name, value) in entry.map {
        let value: String = redis::from_redis_value(&value)
            .map_err(|_| Error::NonStringField(entry.id.clone(), name.clone()))?;
        fields.insert(name, value);
    }
    Ok(Delivery {
        stream_id: entry.id,
        fields,
        delivery_count,
        reclaimed,
    })
}
