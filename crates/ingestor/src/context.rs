use anyhow::Context as _;
use enrichment::{EmbeddingClient, EmbeddingConfig, EnrichmentEngine, NlpClient, NlpConfig, VectorIndex};
use packages::{ObjectStore, ObjectStoreConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Cli;

/// Per-HTTP-client deadlines; these bound the embed and annotation
/// stages at the transport.
const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(120);
const NLP_TIMEOUT: Duration = Duration::from_secs(60);

/// Every shared handle a worker needs, created once at startup and torn
/// down on every exit path. Nothing in here is a process-wide singleton;
/// components receive the context explicitly.
pub struct AppContext {
    pub pool: sqlx::PgPool,
    pub broker_conn: redis::aio::ConnectionManager,
    pub dlq: broker::DlqPublisher,
    pub object_store: ObjectStore,
    pub vector_index: VectorIndex,
    pub engine: EnrichmentEngine,

    pub known_majors: Vec<u32>,
    pub max_retries: u32,
    pub manifest_require_self: bool,
    /// When set, events referencing another bucket are producer errors.
    pub ingestion_bucket: Option<String>,
    /// Parent of the per-job extraction directories.
    pub temp_parent: tempfile::TempDir,
}

impl AppContext {
    pub async fn init(cli: &Cli) -> anyhow::Result<Arc<Self>> {
        let pool = PgPoolOptions::new()
            // One connection per in-flight worker, plus headroom for the
            // job-row bookkeeping done outside the main transaction.
            .max_connections((cli.parallel_jobs() + 2) as u32)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cli.database_url)
            .await
            .context("connecting to the relational store")?;
        ingestor_sql::migrator()
            .run(&pool)
            .await
            .context("applying schema migrations")?;

        let broker_conn = broker::connect(&cli.redis_url)
            .await
            .context("connecting to the broker")?;
        let dlq = broker::DlqPublisher::new(broker_conn.clone(), cli.dlq_stream.clone());

        let object_store = ObjectStore::connect(&ObjectStoreConfig {
            endpoint: cli.minio_endpoint.clone(),
            access_key: cli.minio_access_key.clone(),
            secret_key: cli.minio_secret_key.clone(),
            region: cli.minio_region.clone(),
        });

        let vector_index = VectorIndex::connect(
            &cli.qdrant_url,
            cli.qdrant_collection.clone(),
            cli.embedding_dim,
        )
        .map_err(|err| anyhow::anyhow!(err))
        .context("connecting to the vector store")?;

        let embedder = EmbeddingClient::new(
            reqwest::Client::builder()
                .timeout(EMBEDDING_TIMEOUT)
                .build()
                .context("building embedding HTTP client")?,
            EmbeddingConfig {
                url: cli.embedding_url.clone(),
                model: cli.embedding_model.clone(),
                dimension: cli.embedding_dim,
                batch_size: cli.embedding_batch,
            },
        );
        let nlp = cli
            .nlp_enable_local
            .then(|| -> anyhow::Result<NlpClient> {
                Ok(NlpClient::new(
                    reqwest::Client::builder()
                        .timeout(NLP_TIMEOUT)
                        .build()
                        .context("building annotation HTTP client")?,
                    NlpConfig {
                        url: cli.nlp_url.clone(),
                        batch_size: cli.nlp_batch,
                    },
                ))
            })
            .transpose()?;
        let engine = EnrichmentEngine::new(Arc::new(embedder), nlp);

        let temp_parent = tempfile::Builder::new()
            .prefix("ingestor-")
            .tempdir()
            .context("creating temporary extraction area")?;

        Ok(Arc::new(Self {
            pool,
            broker_conn,
            dlq,
            object_store,
            vector_index,
            engine,
            known_majors: cli.known_schema_majors.clone(),
            max_retries: cli.max_retries,
            manifest_require_self: cli.manifest_require_self,
            ingestion_bucket: cli.ingestion_bucket.clone(),
            temp_parent,
        }))
    }

    /// Orderly release of shared resources. The extraction area is
    /// removed by `temp_parent`'s drop.
    pub async fn teardown(self: Arc<Self>) {
        if let Ok(context) = Arc::try_unwrap(self).map_err(|_| ()) {
            context.pool.close().await;
        } else {
            tracing::warn!("context still shared at teardown; skipping pool close");
        }
    }
}
