// Elasticsearch adapters: the feeder's event source and the dispatcher's bulk sink

mod client;

pub use client::{BulkResponse, ElasticClient};

use crate::config::JobConfig;
use crate::dispatch::BulkSink;
use crate::feeder::{EventSource, QueryTemplate, SearchPage};
use crate::pipeline::SourceProvider;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Reads one index (or index pattern) through an [`ElasticClient`].
pub struct ElasticSource {
    client: Arc<ElasticClient>,
    index: String,
}

impl ElasticSource {
    pub fn new(client: Arc<ElasticClient>, index: impl Into<String>) -> Self {
        Self {
            client,
            index: index.into(),
        }
    }
}

#[async_trait]
impl EventSource for ElasticSource {
    async fn count(&self, query: &QueryTemplate) -> anyhow::Result<u64> {
        self.client.count(&self.index, query).await
    }

    async fn search(&self, query: &QueryTemplate) -> anyhow::Result<SearchPage> {
        let response = self.client.search(&self.index, query).await?;
        debug!(
            index = %self.index,
            took_ms = response.took,
            timed_out = response.timed_out,
            hits = response.hits.hits.len(),
            "Search page received"
        );

        Ok(SearchPage {
            total: response.hits.total.value(),
            hits: response.hits.hits.into_iter().map(|hit| hit.source).collect(),
        })
    }
}

/// Hands each job an [`ElasticSource`] over its configured index.
pub struct ElasticSources {
    client: Arc<ElasticClient>,
}

impl ElasticSources {
    pub fn new(client: Arc<ElasticClient>) -> Self {
        Self { client }
    }
}

impl SourceProvider for ElasticSources {
    fn source(&self, job: &JobConfig) -> Arc<dyn EventSource> {
        Arc::new(ElasticSource::new(Arc::clone(&self.client), job.index.as_str()))
    }
}

/// Writes dispatcher batches to the `_bulk` endpoint.
pub struct ElasticBulkSink {
    client: Arc<ElasticClient>,
}

impl ElasticBulkSink {
    pub fn new(client: Arc<ElasticClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BulkSink for ElasticBulkSink {
    async fn write(&self, body: String) -> anyhow::Result<()> {
        let response = self.client.bulk(body).await?;
        debug!(took_ms = response.took, items = response.items.len(), "Bulk write accepted");
        Ok(())
    }
}
