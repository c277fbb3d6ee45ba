use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mixwatch::pipeline::Pipeline;
use mixwatch::resolver::graphsense::GraphsenseClient;
use mixwatch::settings::Settings;
use mixwatch::source::JsonlSource;

const SETTINGS_PATH: &str = "Settings.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings_path = std::env::args().nth(1).unwrap_or_else(|| SETTINGS_PATH.to_string());
    let settings = Settings::from_toml(&settings_path)
        .with_context(|| format!("loading settings from {settings_path}"))?;

    let api_key =
        std::env::var("GRAPHSENSE_API_KEY").context("GRAPHSENSE_API_KEY must be set")?;
    let service = Arc::new(GraphsenseClient::new(
        &settings.resolver.scheme,
        &settings.resolver.host,
        &settings.resolver.currency,
        api_key,
        Duration::from_secs(settings.resolver.request_timeout_secs),
    )?);

    let pipeline = Pipeline::new(&settings, service)?;
    let source = JsonlSource::new(&settings.pipeline.source_path);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing in-flight work");
            shutdown_tx.send(true).ok();
        }
    });

    let output = pipeline
        .run(&source, &settings.pipeline, shutdown_rx)
        .await?;

    let summary = output.aggregator.summary();
    info!(%summary, "run complete");
    output
        .aggregator
        .export(output.mix_chains, Path::new(&settings.pipeline.dataset_path))?;

    Ok(())
}
