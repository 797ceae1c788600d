#[global_allocator]
static ALLOC: Jemalloc = Jemalloc;

mod config;
mod decoder;
mod error;
mod extract;
mod fetch;
mod models;
mod normalize;
mod pipeline;
mod postgres;
mod writer;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use lambda_runtime::{run, service_fn, Error as LambdaError, LambdaEvent};
use log::{error, info, warn};
use shared::setup_logging;
use tikv_jemallocator::Jemalloc;

use crate::config::IngestConfig;
use crate::fetch::{ObjectFetcher, S3Fetcher};
use crate::models::{into_response, FailureResponse, FileOutcome, SuccessResponse, TriggerEvent};
use crate::pipeline::ingest_source;
use crate::postgres::PostgresStore;

/// Shared across invocations of one warm process.
struct IngestContext {
    config: IngestConfig,
    store: PostgresStore,
    fetcher: Option<S3Fetcher>,
}

#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    setup_logging();

    let config = IngestConfig::from_env()
        .map_err(|e| {
            error!("Invalid configuration: {}", e);
            e
        })
        .context("loading ingest configuration")?;
    info!(
        "Token pattern {}, target offset {}, shape {}, commit mode {:?}",
        config.extractor.token().as_str(),
        config.extractor.zone(),
        config
            .declared_shape
            .map_or("auto".to_string(), |s| s.to_string()),
        config.commit_mode
    );

    let store = PostgresStore::new(config.sql_connection.clone(), config.tables.clone());
    let fetcher = match &config.storage_connection {
        Some(endpoint) => Some(S3Fetcher::connect(endpoint).await),
        None => None,
    };
    let ctx = Arc::new(IngestContext {
        config,
        store,
        fetcher,
    });

    let func = service_fn(move |event| {
        let ctx = ctx.clone();
        async move { handler(&ctx, event).await }
    });
    run(func).await?;

    Ok(())
}

async fn handler(
    ctx: &IngestContext,
    event: LambdaEvent<TriggerEvent>,
) -> Result<SuccessResponse, FailureResponse> {
    let start = Instant::now();
    let req_id = event.context.request_id.clone();

    let sources = event.payload.into_sources();
    if sources.is_empty() {
        warn!("Empty event, returning...");
    }

    let fetcher = ctx.fetcher.as_ref().map(|f| f as &dyn ObjectFetcher);
    let mut files = Vec::with_capacity(sources.len());
    for source in &sources {
        let result = ingest_source(&ctx.config, &ctx.store, fetcher, source).await;
        if let Err(e) = &result {
            error!("Aborted ingest of {}: {}", source.name(), e);
        }
        files.push(FileOutcome::new(source.name(), result));
    }

    info!("Invocation took {:.2?}", start.elapsed());
    into_response(req_id, files)
}
