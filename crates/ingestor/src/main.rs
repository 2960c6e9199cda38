use anyhow::Context;
use clap::Parser;
use ingestor::config::Cli;
use ingestor::{context::AppContext, metrics_server, worker};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    // Structured logs to stderr; RUST_LOG controls verbosity.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing default")?;

    let cli = Cli::parse();
    tracing::info!(
        stream = %cli.stream,
        group = %cli.group,
        consumer = %cli.consumer_name(),
        "starting ingestion worker"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async_main(cli));

    if let Err(err) = result.as_ref() {
        tracing::error!(error = ?err, "ingestion worker exited with error");
    }
    result
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let ctx = AppContext::init(&cli).await?;
    let shutdown = CancellationToken::new();

    // SIGINT and SIGTERM both begin a draining shutdown.
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
            tracing::info!("shutdown signal received; draining");
            shutdown.cancel();
        }
    });

    let metrics_task = tokio::spawn(metrics_server::serve(cli.metrics_port, shutdown.clone()));

    let worker_config = worker::WorkerConfig {
        stream: cli.stream.clone(),
        group: cli.group.clone(),
        consumer_name: cli.consumer_name(),
        batch_size: cli.batch_size,
        block: Duration::from_millis(cli.block_ms),
        parallel_jobs: cli.parallel_jobs(),
        shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
    };
    let worker_result = worker::run(ctx.clone(), worker_config, shutdown.clone()).await;

    shutdown.cancel();
    match metrics_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "metrics server exited with error"),
        Err(err) => tracing::warn!(error = %err, "metrics server task failed"),
    }
    ctx.teardown().await;

    worker_result
}
