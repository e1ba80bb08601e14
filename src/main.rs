use anyhow::{Context, Result};
use caterpillar::config::{load_config, CaterpillarConfig};
use caterpillar::directory::Directory;
use caterpillar::dispatch::{Dispatcher, DispatcherSettings, LogObserver};
use caterpillar::elastic::{ElasticBulkSink, ElasticClient, ElasticSources};
use caterpillar::metrics::DisplayStateCaterpillar;
use caterpillar::pipeline::{CaterpillarRegistry, FileCheckpointStore, JobRunner};
use caterpillar::schedule::{HttpScheduleLookup, NoSchedule, ScheduleLookup};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "caterpillar=info".into()),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CATERPILLAR_CONFIG").ok())
        .unwrap_or_else(|| "caterpillar.toml".to_string());

    info!(config = %path, "Caterpillar starting");
    let config = load_config(&path)?;

    let client = Arc::new(ElasticClient::new(&config.elastic)?);
    let directory = Arc::new(Directory::from_config(&config.directory).await?);
    let schedule = schedule_lookup(&config)?;

    let mut registry = CaterpillarRegistry::new();
    DisplayStateCaterpillar::register(&mut registry, directory, schedule);
    info!(types = ?registry.names(), "Registered caterpillar types");

    let dispatcher = Dispatcher::spawn(
        Arc::new(ElasticBulkSink::new(Arc::clone(&client))),
        Arc::new(LogObserver),
        DispatcherSettings::from(&config.dispatch),
    );

    let runner = JobRunner::new(
        Arc::new(registry),
        Arc::new(ElasticSources::new(client)),
        Arc::new(FileCheckpointStore::new(&config.checkpoint.directory)),
        dispatcher.sender(),
        config.feeder.clone(),
    );

    let mut failed = 0;
    for job in &config.jobs {
        if runner.run_job(job).await.is_err() {
            failed += 1;
        }
    }
    drop(runner);

    let status = dispatcher.close().await;
    info!(
        jobs = config.jobs.len(),
        failed,
        flushed_records = status.flushed_records,
        failed_batches = status.failed_batches,
        "Caterpillar finished"
    );

    Ok(())
}

fn schedule_lookup(config: &CaterpillarConfig) -> Result<Arc<dyn ScheduleLookup>> {
    match &config.schedule.url {
        Some(url) => {
            let timeout = Duration::from_secs(config.elastic.timeout_seconds.max(1));
            let lookup = HttpScheduleLookup::new(url, timeout)
                .context("Failed to build class schedule client")?;
            Ok(Arc::new(lookup))
        }
        None => Ok(Arc::new(NoSchedule)),
    }
}
