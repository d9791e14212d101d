//! Status polling: drives Submitted records to Available, Failed or Abandoned.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::PollConfig;
use crate::error::Error;
use crate::rapi::{ItemStatus, RemoteState};
use crate::store::RecordStore;
use crate::types::{Event, OrderId, RecordKey};

use super::context::PipelineContext;

/// How the polling loop ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PollOutcome {
    /// Cycles applied to the store
    pub(crate) cycles: u32,
    /// Whether the loop stopped because the run was cancelled
    pub(crate) interrupted: bool,
}

/// Status responses gathered during one cycle; `None` marks an order whose
/// status call failed after retries.
type CycleResponses = HashMap<OrderId, Option<Vec<ItemStatus>>>;

/// Poll until no record is Submitted, handing newly available records to the
/// downloader through `ready`.
///
/// Each cycle queries every distinct outstanding order once, then applies all
/// responses under one lock and snapshots the store. A cancellation noticed
/// mid-cycle discards the partial responses, so the results table only ever
/// reflects whole cycles.
pub(crate) async fn poll_until_resolved(
    ctx: &PipelineContext,
    ready: mpsc::Sender<RecordKey>,
) -> PollOutcome {
    let poll = &ctx.config.poll;
    let mut outcome = PollOutcome::default();
    let mut interval = poll.interval;

    loop {
        let orders = ctx.store.lock().await.submitted_by_order();
        if orders.is_empty() {
            tracing::debug!(cycles = outcome.cycles, "No outstanding orders left to poll");
            break;
        }
        if ctx.cancel.is_cancelled() {
            outcome.interrupted = true;
            break;
        }

        let Some(responses) = query_cycle(ctx, &orders).await else {
            tracing::info!(
                cycle = outcome.cycles + 1,
                "Run cancelled mid-cycle, discarding partial status responses"
            );
            outcome.interrupted = true;
            break;
        };

        outcome.cycles += 1;
        let newly_available = apply_cycle(ctx, outcome.cycles, &orders, &responses).await;

        for key in &newly_available {
            // The downloader may already be gone when the run is shutting down
            if ready.send(key.clone()).await.is_err() {
                tracing::debug!(record = %key, "Downloader no longer accepting records");
            }
        }

        if ctx.store.lock().await.submitted_by_order().is_empty() {
            break;
        }

        if !newly_available.is_empty() {
            interval = poll.interval;
        }
        tracing::debug!(
            cycle = outcome.cycles,
            delay_ms = interval.as_millis(),
            "Waiting before next poll cycle"
        );
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                outcome.interrupted = true;
                break;
            }
            _ = ctx.sleeper.sleep(interval) => {}
        }
        if newly_available.is_empty() {
            interval = next_interval(poll, interval);
        }
    }

    outcome
}

/// Delay after a cycle in which nothing became available
pub(crate) fn next_interval(poll: &PollConfig, current: Duration) -> Duration {
    let grown = Duration::from_secs_f64(current.as_secs_f64() * poll.idle_backoff.max(1.0));
    grown.min(poll.max_interval.max(poll.interval))
}

/// Query each order once. Returns `None` when the run was cancelled before the
/// cycle completed; an in-flight call is always allowed to finish, but its
/// retries are not.
async fn query_cycle(
    ctx: &PipelineContext,
    orders: &BTreeMap<OrderId, Vec<RecordKey>>,
) -> Option<CycleResponses> {
    let timeout = ctx.config.rapi.timeout_status;
    let mut responses = CycleResponses::with_capacity(orders.len());

    for &order_id in orders.keys() {
        if ctx.cancel.is_cancelled() {
            return None;
        }
        let ids = [order_id];
        let result = ctx
            .remote("status", timeout, || ctx.client.status(&ids))
            .await;
        match result {
            Ok(items) => {
                responses.insert(order_id, Some(items));
            }
            Err(Error::Cancelled) => return None,
            Err(e) => {
                tracing::warn!(
                    order_id = %order_id,
                    error = %e,
                    "Status check failed, counting cycle as unresolved"
                );
                responses.insert(order_id, None);
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return None;
    }
    Some(responses)
}

/// Apply one cycle's responses and snapshot; returns the records that became available.
async fn apply_cycle(
    ctx: &PipelineContext,
    cycle: u32,
    orders: &BTreeMap<OrderId, Vec<RecordKey>>,
    responses: &CycleResponses,
) -> Vec<RecordKey> {
    let max_attempts = ctx.config.poll.max_attempts;
    let mut events = Vec::new();
    let mut newly_available = Vec::new();

    let mut store = ctx.store.lock().await;
    for (order_id, keys) in orders {
        let items = responses.get(order_id).and_then(Option::as_ref);
        for key in keys {
            let item = items.and_then(|items| items.iter().find(|item| item.matches(key)));
            match apply_item(&mut store, key, item, max_attempts) {
                Ok(Resolution::Available) => {
                    events.push(Event::RecordAvailable { key: key.clone() });
                    newly_available.push(key.clone());
                }
                Ok(Resolution::Failed(reason)) => {
                    tracing::warn!(
                        record = %key,
                        order_id = %order_id,
                        reason = %reason,
                        "Order item failed"
                    );
                    events.push(Event::RecordFailed {
                        key: key.clone(),
                        reason,
                    });
                }
                Ok(Resolution::Abandoned) => {
                    tracing::warn!(
                        record = %key,
                        order_id = %order_id,
                        attempts = max_attempts,
                        "Order item still pending after the poll attempt limit, abandoning"
                    );
                    events.push(Event::RecordAbandoned { key: key.clone() });
                }
                Ok(Resolution::Pending) => {}
                Err(e) => {
                    tracing::debug!(record = %key, error = %e, "Skipping status update");
                }
            }
        }
    }

    let outstanding = store.submitted_by_order().values().map(Vec::len).sum();
    ctx.save(&store).await;
    drop(store);

    tracing::info!(
        cycle,
        orders = orders.len(),
        newly_available = newly_available.len(),
        outstanding,
        "Poll cycle completed"
    );
    for event in events {
        ctx.emit(event);
    }
    ctx.emit(Event::PollCycleCompleted {
        cycle,
        outstanding,
        newly_available: newly_available.len(),
    });

    newly_available
}

enum Resolution {
    Available,
    Failed(String),
    Abandoned,
    Pending,
}

fn apply_item(
    store: &mut RecordStore,
    key: &RecordKey,
    item: Option<&ItemStatus>,
    max_attempts: u32,
) -> crate::error::Result<Resolution> {
    match item {
        // Available without a download URL is not usable yet
        Some(item) if item.state == RemoteState::Available && item.download_url.is_some() => {
            store.mark_available(key, item.download_url.clone(), item.size)?;
            Ok(Resolution::Available)
        }
        Some(item) if item.state == RemoteState::Failed => {
            let reason = item
                .reason
                .clone()
                .unwrap_or_else(|| "order item failed".to_string());
            store.mark_failed(key, reason.clone())?;
            Ok(Resolution::Failed(reason))
        }
        _ => {
            if store.record_unresolved_poll(key, max_attempts)? {
                Ok(Resolution::Abandoned)
            } else {
                Ok(Resolution::Pending)
            }
        }
    }
}
