use anyhow::Context;
use clap::Parser;
use pipestats::cli::Cli;
use pipestats::sketch::SketchMapping;
use pipestats::{
    build_router, AgentMetadata, Languages, PayloadSubmitter, PipelineStatsAggregator,
    PipelineStatsWriter, WindowStore,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    pipestats::native::init_tracing(cli.json);

    let config = cli.resolve_config().map_err(|e| {
        error!(error = %e, "Failed to load config");
        e
    })?;

    let languages = Languages::default();
    let (submitter, payloads) = PayloadSubmitter::channel();

    let writer = PipelineStatsWriter::with_http(&config, payloads, languages.clone())
        .map_err(anyhow::Error::msg)?
        .start();

    let agent = AgentMetadata::new(config.default_env.clone(), config.hostname.clone());
    let store = WindowStore::new(SketchMapping::default(), agent);
    let aggregator = PipelineStatsAggregator::new(store, submitter).start();

    let app = build_router(aggregator.ingester(), languages);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, endpoint = %config.endpoint, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, flushing pipeline stats");
    aggregator.stop().await;
    writer.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
