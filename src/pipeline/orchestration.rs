//! Phase sequencing: populate → order → poll + download → summary.

use std::path::Path;

use tokio::sync::mpsc;

use crate::batcher::{self, BatchLimits, TruncateScope};
use crate::error::Result;
use crate::export;
use crate::rapi::SearchQuery;
use crate::recorder::{self, ResultRecorder, RunMetadata};
use crate::store::RecordStore;
use crate::types::{Event, ImageRecord, RecordStatus, RunSummary};
use crate::utils::is_order_disabled;

use super::context::PipelineContext;
use super::poller::PollOutcome;
use super::{Pipeline, RunRequest, SearchRequest, download, existing, poller, submitter};

/// Failure reason for records of collections that cannot be ordered through the API
pub(crate) const ORDER_DISABLED: &str = "collection cannot be ordered";

pub(super) async fn run(
    pipeline: &Pipeline,
    request: RunRequest,
) -> Result<(RunSummary, RecordStore)> {
    let config = &pipeline.config;

    // Input files are read before anything touches the network
    let initial = match &request {
        RunRequest::DownloadResults(path) => load_results(path, config.download.force)?,
        RunRequest::OrderCsv(path) => RecordStore::from_records(
            export::load_export(path)?.into_iter().map(ImageRecord::new),
        ),
        _ => RecordStore::new(),
    };

    let recorder = ResultRecorder::new(&config.paths.results, metadata_for(&request));
    let ctx = PipelineContext {
        config: config.clone(),
        client: pipeline.client.clone(),
        sleeper: pipeline.sleeper.clone(),
        store: initial.into_shared(),
        recorder,
        event_tx: pipeline.event_tx.clone(),
        cancel: pipeline.cancel.clone(),
    };

    tracing::info!(
        process = request.mode().as_str(),
        results = %ctx.recorder.path().display(),
        "Starting run"
    );

    let timeout = config.rapi.timeout_query;
    ctx.remote("authenticate", timeout, || ctx.client.authenticate())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Cannot reach the archive with these credentials"))?;

    let scope = match &request {
        RunRequest::Full(search) | RunRequest::OrderOnly(search) => {
            search_collections(&ctx, search).await;
            if search.collections.len() > 1 {
                TruncateScope::PerCollection
            } else {
                TruncateScope::Total
            }
        }
        RunRequest::RecordIds(keys) => {
            let mut store = ctx.store.lock().await;
            for key in keys {
                store.insert(ImageRecord::new(key.clone()));
            }
            tracing::info!(records = store.len(), "Loaded records by id");
            TruncateScope::Total
        }
        RunRequest::DownloadResults(_) | RunRequest::OrderCsv(_) => TruncateScope::Total,
        RunRequest::DownloadAvailable { max_orders } => {
            existing::load_available_orders(&ctx, *max_orders).await;
            TruncateScope::Total
        }
    };
    ctx.snapshot().await;

    if !ctx.cancel.is_cancelled() {
        order_phase(&ctx, scope).await;
    }

    if matches!(request, RunRequest::OrderOnly(_)) {
        tracing::info!("Order-only run, skipping status polling and downloads");
    } else if !ctx.cancel.is_cancelled() {
        let outcome = poll_and_download(&ctx).await;
        tracing::debug!(
            cycles = outcome.cycles,
            interrupted = outcome.interrupted,
            "Polling finished"
        );
    }

    let store = ctx.store.lock().await;
    let mut summary = store.summary();
    summary.interrupted = ctx.cancel.is_cancelled();
    summary.results_file = Some(ctx.recorder.path().to_path_buf());
    // The table is the only resume point, so losing it fails the run
    ctx.persist(&store).await.inspect_err(|e| {
        tracing::error!(
            path = %ctx.recorder.path().display(),
            error = %e,
            "Could not write the final results table"
        )
    })?;
    let final_store = store.clone();
    drop(store);

    log_summary(&summary);
    ctx.emit(Event::Finished {
        interrupted: summary.interrupted,
    });
    Ok((summary, final_store))
}

fn metadata_for(request: &RunRequest) -> RunMetadata {
    let mut metadata = RunMetadata::new(request.mode());
    match request {
        RunRequest::Full(search) | RunRequest::OrderOnly(search) => {
            metadata.collections = search.collections.clone();
            metadata.source = search.source.clone();
        }
        RunRequest::RecordIds(keys) => {
            for key in keys {
                if !metadata.collections.contains(&key.collection) {
                    metadata.collections.push(key.collection.clone());
                }
            }
            metadata.source = Some(
                keys.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        RunRequest::DownloadResults(path) => {
            metadata.source = Some(path.display().to_string());
        }
        RunRequest::OrderCsv(path) => {
            metadata.source = Some(path.display().to_string());
        }
        RunRequest::DownloadAvailable { .. } => {}
    }
    metadata
}

fn load_results(path: &Path, force: bool) -> Result<RecordStore> {
    let mut store = recorder::load(path)?;
    tracing::info!(
        path = %path.display(),
        records = store.len(),
        "Resuming from results table"
    );
    if force {
        let downloaded = store.keys_with_status(&RecordStatus::Downloaded);
        let reset = downloaded
            .iter()
            .filter(|key| store.force_redownload(key).is_ok())
            .count();
        tracing::info!(records = reset, "Forcing re-download of downloaded records");
    }
    Ok(store)
}

/// Search every collection in turn; a collection that keeps failing is skipped.
async fn search_collections(ctx: &PipelineContext, request: &SearchRequest) {
    let timeout = ctx.config.rapi.timeout_query;
    for collection in &request.collections {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let query = SearchQuery {
            collection: collection.clone(),
            filters: request.filters.clone(),
            geometry: request.geometry.clone(),
            date_range: request.date_range,
            max_results: ctx.config.rapi.max_results,
        };

        match ctx
            .remote("search", timeout, || ctx.client.search(&query))
            .await
        {
            Ok(records) => {
                let mut store = ctx.store.lock().await;
                let found = records
                    .into_iter()
                    .filter(|record| store.insert(record.clone()))
                    .count();
                tracing::info!(collection = %collection, found, "Search completed");
                ctx.emit(Event::SearchCompleted {
                    collection: collection.clone(),
                    found,
                });
            }
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "Search failed, skipping collection");
            }
        }
    }
}

/// Turn every Found record into a Submitted or Failed one (or leave it Found
/// when it falls outside the image limit).
async fn order_phase(ctx: &PipelineContext, scope: TruncateScope) {
    let found = ctx.store.lock().await.keys_with_status(&RecordStatus::Found);
    if found.is_empty() {
        return;
    }

    let (disabled, orderable): (Vec<_>, Vec<_>) = found
        .into_iter()
        .partition(|key| is_order_disabled(&key.collection));
    if !disabled.is_empty() {
        let mut store = ctx.store.lock().await;
        store.mark_all_failed(&disabled, ORDER_DISABLED);
        tracing::warn!(records = disabled.len(), "Skipping records of collections that cannot be ordered");
        for key in disabled {
            ctx.emit(Event::RecordFailed {
                key,
                reason: ORDER_DISABLED.to_string(),
            });
        }
    }

    let limits = BatchLimits {
        max_total: ctx.config.order.max_images,
        max_per_batch: ctx.config.order.max_items_per_order,
        scope,
    };
    let retained = batcher::truncate(&orderable, &limits);
    if retained.len() < orderable.len() {
        tracing::info!(
            ordering = retained.len(),
            left_unordered = orderable.len() - retained.len(),
            "Image limit reached"
        );
    }

    let remaining = existing::link_existing_orders(ctx, retained).await;
    let mut batches = batcher::split(&remaining, limits.batch_cap());
    tracing::info!(
        records = remaining.len(),
        batches = batches.len(),
        per_order = limits.batch_cap(),
        "Orders planned"
    );
    ctx.snapshot().await;

    submitter::submit_batches(ctx, &mut batches).await;
}

/// Poll and download concurrently until nothing is left to wait for.
async fn poll_and_download(ctx: &PipelineContext) -> PollOutcome {
    let (initial, capacity) = {
        let store = ctx.store.lock().await;
        (store.keys_with_status(&RecordStatus::Available), store.len().max(1))
    };

    // Room for every record, so neither side ever waits on the other
    let (tx, rx) = mpsc::channel(capacity);
    for key in initial {
        tx.send(key).await.ok();
    }

    let poll = async move { poller::poll_until_resolved(ctx, tx).await };
    let (outcome, ()) = tokio::join!(poll, download::run_download_workers(ctx, rx));
    outcome
}

fn log_summary(summary: &RunSummary) {
    tracing::info!(
        total = summary.total,
        downloaded = summary.downloaded,
        failed = summary.failed,
        abandoned = summary.abandoned,
        pending = summary.pending,
        not_ordered = summary.found,
        interrupted = summary.interrupted,
        "Run finished"
    );
    for (key, reason) in &summary.failures {
        tracing::warn!(record = %key, reason = %reason, "Record failed");
    }
    if let Some(path) = &summary.results_file {
        tracing::info!(path = %path.display(), "Results written");
    }
}
