//! Remote archive operations
//!
//! The pipeline only talks to the archive through [`ArchiveClient`]. The
//! production implementation is [`RapiClient`], which speaks the EODMS REST API
//! over HTTP.

mod client;

pub use client::RapiClient;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{ImageRecord, ItemId, OrderId, Priority, RecordKey};
use crate::utils::DateRange;

/// A search against one collection
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchQuery {
    /// Collection to search
    pub collection: String,
    /// Attribute filters, already in RAPI query syntax (e.g. `RCM.BEAM_MNEMONIC='16M11'`)
    pub filters: Vec<String>,
    /// Area of interest as WKT
    pub geometry: Option<String>,
    /// Acquisition date range
    pub date_range: Option<DateRange>,
    /// Maximum number of records to return
    pub max_results: usize,
}

/// What the remote service said about one item of a new order
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedItem {
    /// Record id the item was created for
    pub record_id: String,
    /// Collection, when echoed by the service
    pub collection: Option<String>,
    /// Item id, when the item was accepted
    pub item_id: Option<ItemId>,
    /// Whether the item was accepted
    pub accepted: bool,
    /// Rejection reason
    pub reason: Option<String>,
}

/// Response to an order request
#[derive(Clone, Debug, PartialEq)]
pub struct OrderResponse {
    /// Order id assigned to the batch
    pub order_id: OrderId,
    /// Per-item outcome
    pub items: Vec<OrderedItem>,
}

/// Remote state of an order item, reduced to what the pipeline acts on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteState {
    /// Ready for download
    Available,
    /// Still being prepared
    Pending,
    /// Permanently failed (failed, cancelled, expired or deleted)
    Failed,
}

impl RemoteState {
    /// Map an RAPI item status
    pub fn from_remote(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE_FOR_DOWNLOAD" | "SUCCESS" => RemoteState::Available,
            "FAILED" | "CANCELLED" | "EXPIRED" | "DELETED" => RemoteState::Failed,
            _ => RemoteState::Pending,
        }
    }

    /// Whether an order in this state can still deliver its item
    pub fn is_live(&self) -> bool {
        !matches!(self, RemoteState::Failed)
    }
}

/// Status of one order item
#[derive(Clone, Debug, PartialEq)]
pub struct ItemStatus {
    /// Order the item belongs to
    pub order_id: OrderId,
    /// Item id
    pub item_id: ItemId,
    /// Record id of the ordered image
    pub record_id: String,
    /// Collection of the ordered image, when reported
    pub collection: Option<String>,
    /// Reduced state
    pub state: RemoteState,
    /// Status message reported with the state
    pub reason: Option<String>,
    /// Download URL, once available
    pub download_url: Option<String>,
    /// File size in bytes, when reported
    pub size: Option<u64>,
    /// When the order was placed
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ItemStatus {
    /// Whether this item belongs to the given record
    ///
    /// Items without a collection match on the record id alone.
    pub fn matches(&self, key: &RecordKey) -> bool {
        self.record_id == key.record_id
            && self
                .collection
                .as_deref()
                .is_none_or(|collection| collection == key.collection)
    }
}

/// A transfer in progress
pub struct DownloadStream {
    /// Full size of the file, when the service reports it
    pub expected_size: Option<u64>,
    /// Whether the service honoured the requested offset
    pub resumed: bool,
    /// File bytes starting at the offset (or at zero when not resumed)
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("expected_size", &self.expected_size)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Operations the pipeline needs from the remote archive
#[async_trait::async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Check the credentials; a rejection is [`crate::Error::Authentication`]
    async fn authenticate(&self) -> Result<()>;

    /// Search one collection, merging result pages in discovery order
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ImageRecord>>;

    /// Place one order for the given records
    async fn order(&self, keys: &[RecordKey], priority: Priority) -> Result<OrderResponse>;

    /// Item statuses of the given orders
    async fn status(&self, order_ids: &[OrderId]) -> Result<Vec<ItemStatus>>;

    /// Items of recent orders (at most `max_orders` orders) that belong to the given
    /// records; every item when `keys` is empty
    async fn existing_orders(&self, keys: &[RecordKey], max_orders: usize)
    -> Result<Vec<ItemStatus>>;

    /// Start a transfer at byte `offset`
    async fn download(&self, url: &str, offset: u64) -> Result<DownloadStream>;
}
