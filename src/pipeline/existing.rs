//! Reuse of orders placed in earlier sessions.
//!
//! When several live orders contain the same image, the most recently submitted
//! one wins (ties broken by the higher order id); older duplicates are skipped.

use std::collections::{HashMap, HashSet};

use crate::rapi::{ItemStatus, RemoteState};
use crate::store::RecordStore;
use crate::types::{Event, ImageRecord, RecordKey};

use super::context::PipelineContext;

/// Collection used for existing order items that do not report one
pub(crate) const UNKNOWN_COLLECTION: &str = "Unknown";

/// Fill in the collection of items that do not report one.
///
/// The collection comes from the only requested record with that id, or else
/// from the only collection other items of the same record id report. Items
/// that stay ambiguous keep `None`.
pub(crate) fn resolve_collections(items: &mut [ItemStatus], keys: &[RecordKey]) {
    let mut reported: HashMap<String, HashSet<String>> = HashMap::new();
    for item in items.iter() {
        if let Some(collection) = &item.collection {
            reported
                .entry(item.record_id.clone())
                .or_default()
                .insert(collection.clone());
        }
    }

    for item in items.iter_mut().filter(|item| item.collection.is_none()) {
        let requested: HashSet<&str> = keys
            .iter()
            .filter(|key| key.record_id == item.record_id)
            .map(|key| key.collection.as_str())
            .collect();
        let resolved = match requested.len() {
            1 => requested.into_iter().next().map(|c| c.to_string()),
            0 => reported
                .get(&item.record_id)
                .filter(|collections| collections.len() == 1)
                .and_then(|collections| collections.iter().next().cloned()),
            _ => None,
        };
        if let Some(collection) = resolved {
            tracing::debug!(
                record_id = %item.record_id,
                order_id = %item.order_id,
                collection = %collection,
                "Resolved collection of existing order item"
            );
            item.collection = Some(collection);
        }
    }
}

/// Keep one item per image: the one from the most recent order.
///
/// Collections should be resolved first so that one image is not split across
/// a reported and an unreported collection. Input order of the surviving items
/// is preserved.
pub(crate) fn latest_per_record(items: Vec<ItemStatus>) -> Vec<ItemStatus> {
    let mut best: HashMap<(String, Option<String>), usize> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        let key = (item.record_id.clone(), item.collection.clone());
        match best.get(&key) {
            Some(&current) if !is_newer(item, &items[current]) => {
                tracing::debug!(
                    record_id = %item.record_id,
                    skipped_order = %item.order_id,
                    kept_order = %items[current].order_id,
                    "Skipping older duplicate order"
                );
            }
            _ => {
                best.insert(key, index);
            }
        }
    }

    let mut keep: Vec<usize> = best.into_values().collect();
    keep.sort_unstable();
    let mut items: Vec<Option<ItemStatus>> = items.into_iter().map(Some).collect();
    keep.into_iter().filter_map(|i| items[i].take()).collect()
}

fn is_newer(candidate: &ItemStatus, current: &ItemStatus) -> bool {
    (candidate.submitted_at, candidate.order_id) > (current.submitted_at, current.order_id)
}

async fn fetch_existing(
    ctx: &PipelineContext,
    keys: &[RecordKey],
    max_orders: usize,
) -> Option<Vec<ItemStatus>> {
    let timeout = ctx.config.rapi.timeout_status;
    match ctx
        .remote("existing orders", timeout, || {
            ctx.client.existing_orders(keys, max_orders)
        })
        .await
    {
        Ok(items) => Some(items),
        Err(e) => {
            tracing::warn!(error = %e, "Could not list existing orders");
            None
        }
    }
}

/// Link records that already have a live order; returns the keys still needing one.
pub(crate) async fn link_existing_orders(
    ctx: &PipelineContext,
    keys: Vec<RecordKey>,
) -> Vec<RecordKey> {
    if keys.is_empty() || !ctx.config.order.reuse_existing {
        return keys;
    }

    let max_orders = ctx.config.order.max_recent_orders.max(keys.len() + 25);
    let Some(items) = fetch_existing(ctx, &keys, max_orders).await else {
        return keys;
    };
    let mut live: Vec<ItemStatus> = items.into_iter().filter(|i| i.state.is_live()).collect();
    resolve_collections(&mut live, &keys);
    let latest = latest_per_record(live);

    let mut store = ctx.store.lock().await;
    let mut remaining = Vec::with_capacity(keys.len());
    let mut linked = 0;
    for key in keys {
        match latest.iter().find(|item| item.matches(&key)) {
            Some(item) if link_item(&mut store, &key, item) => linked += 1,
            _ => remaining.push(key),
        }
    }

    if linked > 0 {
        tracing::info!(linked, "Linked records to existing orders");
        ctx.save(&store).await;
        ctx.emit(Event::ExistingOrdersLinked { count: linked });
    }
    remaining
}

/// Fill the store with every available item of recent orders.
///
/// Used by the download-only flow; returns how many records were added.
pub(crate) async fn load_available_orders(ctx: &PipelineContext, max_orders: usize) -> usize {
    let Some(items) = fetch_existing(ctx, &[], max_orders).await else {
        return 0;
    };
    let mut available: Vec<ItemStatus> = items
        .into_iter()
        .filter(|i| i.state == RemoteState::Available)
        .collect();
    resolve_collections(&mut available, &[]);

    let mut store = ctx.store.lock().await;
    let mut added = 0;
    for item in latest_per_record(available) {
        let collection = item
            .collection
            .clone()
            .unwrap_or_else(|| UNKNOWN_COLLECTION.to_string());
        let key = RecordKey::new(collection, item.record_id.clone());
        if store.insert(ImageRecord::new(key.clone())) && link_item(&mut store, &key, &item) {
            added += 1;
        }
    }
    tracing::info!(available = added, "Loaded available items of existing orders");
    ctx.save(&store).await;
    added
}

/// Link one record to an existing item, carrying an Available state over
fn link_item(store: &mut RecordStore, key: &RecordKey, item: &ItemStatus) -> bool {
    if let Err(e) = store.link_order(key, item.order_id, item.item_id) {
        tracing::debug!(record = %key, error = %e, "Cannot link existing order");
        return false;
    }
    if item.state == RemoteState::Available
        && item.download_url.is_some()
        && let Err(e) = store.mark_available(key, item.download_url.clone(), item.size)
    {
        tracing::debug!(record = %key, error = %e, "Cannot mark existing order available");
    }
    tracing::debug!(record = %key, order_id = %item.order_id, "Reusing existing order");
    true
}
