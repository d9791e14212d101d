//! Order submission: one order per batch, sequentially.

use crate::batcher::OrderBatch;
use crate::error::Error;
use crate::rapi::{OrderResponse, OrderedItem};
use crate::store::RecordStore;
use crate::types::{Event, RecordKey};

use super::context::PipelineContext;

/// Failure reason for every record of a batch whose order could not be placed
pub(crate) const SUBMISSION_FAILED: &str = "order submission failed";

/// Submit every batch in turn.
///
/// A batch is either linked as a whole (accepted items Submitted, rejected items
/// Failed) or, once retries are exhausted, failed as a whole. Either way the
/// next batch is still submitted. Batches not placed when the run is cancelled
/// leave their records Found.
pub(crate) async fn submit_batches(ctx: &PipelineContext, batches: &mut [OrderBatch]) {
    let priority = ctx.config.order.priority;
    let timeout = ctx.config.rapi.timeout_order;
    let total = batches.len();

    for batch in batches.iter_mut() {
        if ctx.cancel.is_cancelled() {
            tracing::info!(
                batch = batch.index,
                remaining = total - batch.index,
                "Run cancelled, not submitting remaining batches"
            );
            break;
        }

        tracing::info!(
            batch = batch.index,
            records = batch.len(),
            priority = priority.as_str(),
            "Submitting order"
        );

        let result = ctx
            .remote("order", timeout, || ctx.client.order(&batch.keys, priority))
            .await;

        let mut store = ctx.store.lock().await;
        match result {
            Ok(response) => {
                let (submitted, rejected) = link_batch(ctx, &mut store, batch, &response);
                batch.order_id = Some(response.order_id);
                tracing::info!(
                    batch = batch.index,
                    order_id = %response.order_id,
                    submitted,
                    rejected,
                    "Order submitted"
                );
                ctx.emit(Event::BatchSubmitted {
                    batch: batch.index,
                    order_id: response.order_id,
                    submitted,
                    rejected,
                });
            }
            Err(Error::Cancelled) => {
                tracing::info!(
                    batch = batch.index,
                    "Run cancelled before the order was placed, records stay Found"
                );
                break;
            }
            Err(e) => {
                tracing::error!(
                    batch = batch.index,
                    records = batch.len(),
                    error = %e,
                    "Order submission failed, failing every record of the batch"
                );
                store.mark_all_failed(&batch.keys, SUBMISSION_FAILED);
                ctx.emit(Event::BatchFailed {
                    batch: batch.index,
                    reason: e.to_string(),
                });
                for key in &batch.keys {
                    ctx.emit(Event::RecordFailed {
                        key: key.clone(),
                        reason: SUBMISSION_FAILED.to_string(),
                    });
                }
            }
        }
        ctx.save(&store).await;
    }
}

/// Distribute the order response onto the batch records; returns (submitted, rejected).
fn link_batch(
    ctx: &PipelineContext,
    store: &mut RecordStore,
    batch: &OrderBatch,
    response: &OrderResponse,
) -> (usize, usize) {
    let mut submitted = 0;
    let mut rejected = 0;

    for key in &batch.keys {
        let outcome = match find_item(&response.items, key) {
            Some(OrderedItem {
                accepted: true,
                item_id: Some(item_id),
                ..
            }) => store.link_order(key, response.order_id, *item_id).map(|()| None),
            Some(item) => {
                let reason = item
                    .reason
                    .clone()
                    .unwrap_or_else(|| "rejected by the remote service".to_string());
                store.mark_failed(key, reason.clone()).map(|()| Some(reason))
            }
            None => {
                let reason = "missing from the order response".to_string();
                store.mark_failed(key, reason.clone()).map(|()| Some(reason))
            }
        };

        match outcome {
            Ok(None) => submitted += 1,
            Ok(Some(reason)) => {
                tracing::warn!(
                    record = %key,
                    order_id = %response.order_id,
                    reason = %reason,
                    "Order item rejected"
                );
                ctx.emit(Event::RecordFailed {
                    key: key.clone(),
                    reason,
                });
                rejected += 1;
            }
            Err(e) => {
                tracing::warn!(record = %key, error = %e, "Could not apply order response to record");
            }
        }
    }

    (submitted, rejected)
}

fn find_item<'a>(items: &'a [OrderedItem], key: &RecordKey) -> Option<&'a OrderedItem> {
    items.iter().find(|item| {
        item.record_id == key.record_id
            && item
                .collection
                .as_deref()
                .is_none_or(|collection| collection == key.collection)
    })
}
