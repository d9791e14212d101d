//! Order batching: truncation to the image limit and splitting into orders

use crate::types::{OrderId, RecordKey};

/// Maximum items per order accepted by the RAPI
pub const DEFAULT_MAX_ITEMS_PER_ORDER: usize = 100;

/// A bounded group of records submitted as one order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBatch {
    /// Zero-based position of the batch in the run
    pub index: usize,
    /// Members, in discovery order
    pub keys: Vec<RecordKey>,
    /// Order id assigned by the remote service once accepted
    pub order_id: Option<OrderId>,
}

impl OrderBatch {
    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// How the total maximum is applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TruncateScope {
    /// Keep the first N records overall
    #[default]
    Total,
    /// Keep the first N records of each collection
    PerCollection,
}

/// Batching limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum number of records to keep (None = unlimited)
    pub max_total: Option<usize>,
    /// Maximum number of records per batch; values below 1 mean the service default
    pub max_per_batch: i64,
    /// Whether `max_total` counts per collection
    pub scope: TruncateScope,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_total: None,
            max_per_batch: DEFAULT_MAX_ITEMS_PER_ORDER as i64,
            scope: TruncateScope::Total,
        }
    }
}

impl BatchLimits {
    /// Effective per-batch cap
    pub fn batch_cap(&self) -> usize {
        effective_batch_cap(self.max_per_batch)
    }
}

/// Per-batch cap with zero and negative values corrected to the service default
pub fn effective_batch_cap(configured: i64) -> usize {
    if configured < 1 {
        DEFAULT_MAX_ITEMS_PER_ORDER
    } else {
        configured as usize
    }
}

/// Keep the earliest-discovered records allowed by the limits
pub fn truncate(keys: &[RecordKey], limits: &BatchLimits) -> Vec<RecordKey> {
    let Some(max) = limits.max_total else {
        return keys.to_vec();
    };
    match limits.scope {
        TruncateScope::Total => keys.iter().take(max).cloned().collect(),
        TruncateScope::PerCollection => {
            let mut kept: std::collections::HashMap<&str, usize> = Default::default();
            keys.iter()
                .filter(|key| {
                    let count = kept.entry(key.collection.as_str()).or_insert(0);
                    *count += 1;
                    *count <= max
                })
                .cloned()
                .collect()
        }
    }
}

/// Split records into consecutive batches of at most `cap` records
pub fn split(keys: &[RecordKey], cap: usize) -> Vec<OrderBatch> {
    keys.chunks(cap.max(1))
        .enumerate()
        .map(|(index, chunk)| OrderBatch {
            index,
            keys: chunk.to_vec(),
            order_id: None,
        })
        .collect()
}

/// Truncate then split
///
/// Every retained record lands in exactly one batch; batch order and order within
/// each batch follow discovery order.
pub fn plan_batches(keys: &[RecordKey], limits: &BatchLimits) -> Vec<OrderBatch> {
    let retained = truncate(keys, limits);
    split(&retained, limits.batch_cap())
}
