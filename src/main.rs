mod bencode;
mod config;
mod fetch;
mod krpc;
mod node;
mod routing;
mod search;
mod spider;
mod storage;

use anyhow::Context;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = config::Config::load()?;

    std::fs::create_dir_all(&config.data_dir).context("create data dir")?;
    let db = sled::open(config.data_dir.join("sled")).context("open sled db")?;
    let sink = Arc::new(storage::SledSink::new(db));

    // The engine owns all DHT state; metadata fetches run as their own
    // tasks and report back to it.
    let (spider, handle) = spider::Spider::bind(config, sink).await?;
    let engine = tokio::spawn(spider.run());

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutdown requested");
    handle.stop();

    engine.await.context("join engine task")??;
    Ok(())
}
