//! Record store holding every image record of a run, in discovery order
//!
//! Status changes go through the small transition API below; each call checks
//! the edge against [`RecordStatus::can_transition_to`], so a record can only
//! move forward through the state machine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ImageRecord, ItemId, OrderId, RecordKey, RecordStatus, RunSummary};

/// Store shared between the poller and the download workers
pub type SharedStore = Arc<tokio::sync::Mutex<RecordStore>>;

/// Ordered collection of image records keyed by (collection, record id)
#[derive(Clone, Debug, Default)]
pub struct RecordStore {
    records: Vec<ImageRecord>,
    index: HashMap<RecordKey, usize>,
}

impl RecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from records in discovery order
    ///
    /// Later duplicates of an already present key are dropped.
    pub fn from_records(records: impl IntoIterator<Item = ImageRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Wrap the store for sharing across tasks
    pub fn into_shared(self) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Append a record; returns false (and keeps the existing one) for a duplicate key
    pub fn insert(&mut self, record: ImageRecord) -> bool {
        if self.index.contains_key(&record.key) {
            tracing::debug!(record = %record.key, "Skipping duplicate record");
            return false;
        }
        self.index.insert(record.key.clone(), self.records.len());
        self.records.push(record);
        true
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record
    pub fn get(&self, key: &RecordKey) -> Option<&ImageRecord> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    /// Whether a key is present
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.index.contains_key(key)
    }

    /// All records in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.iter()
    }

    /// Keys of records whose status matches, in discovery order
    pub fn keys_where(&self, predicate: impl Fn(&RecordStatus) -> bool) -> Vec<RecordKey> {
        self.records
            .iter()
            .filter(|r| predicate(&r.status))
            .map(|r| r.key.clone())
            .collect()
    }

    /// Keys with exactly this status (failure reasons are ignored)
    pub fn keys_with_status(&self, status: &RecordStatus) -> Vec<RecordKey> {
        self.keys_where(|s| std::mem::discriminant(s) == std::mem::discriminant(status))
    }

    /// Records that have not reached a terminal status
    pub fn outstanding(&self) -> Vec<RecordKey> {
        self.keys_where(|s| !s.is_terminal())
    }

    /// Submitted records grouped by order id, orders ascending
    pub fn submitted_by_order(&self) -> std::collections::BTreeMap<OrderId, Vec<RecordKey>> {
        let mut orders: std::collections::BTreeMap<OrderId, Vec<RecordKey>> = Default::default();
        for record in &self.records {
            if record.status == RecordStatus::Submitted
                && let Some(order_id) = record.order_id
            {
                orders.entry(order_id).or_default().push(record.key.clone());
            }
        }
        orders
    }

    fn record_mut(&mut self, key: &RecordKey) -> Result<&mut ImageRecord> {
        let index = *self
            .index
            .get(key)
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        Ok(&mut self.records[index])
    }

    fn transition(&mut self, key: &RecordKey, next: RecordStatus) -> Result<&mut ImageRecord> {
        let record = self.record_mut(key)?;
        if !record.status.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                key: key.clone(),
                from: record.status.label(),
                to: next.label(),
            });
        }
        tracing::trace!(record = %key, from = record.status.label(), to = next.label(), "Status change");
        record.status = next;
        Ok(record)
    }

    /// Attach order linkage to a found record (Found → Submitted)
    pub fn link_order(&mut self, key: &RecordKey, order_id: OrderId, item_id: ItemId) -> Result<()> {
        let record = self.transition(key, RecordStatus::Submitted)?;
        record.order_id = Some(order_id);
        record.item_id = Some(item_id);
        record.poll_attempts = 0;
        Ok(())
    }

    /// Remote reports the item ready (Submitted → Available)
    pub fn mark_available(
        &mut self,
        key: &RecordKey,
        download_url: Option<String>,
        expected_size: Option<u64>,
    ) -> Result<()> {
        let record = self.transition(key, RecordStatus::Available)?;
        if download_url.is_some() {
            record.download_url = download_url;
        }
        if expected_size.is_some() {
            record.expected_size = expected_size;
        }
        Ok(())
    }

    /// Permanent failure of a non-terminal record
    pub fn mark_failed(&mut self, key: &RecordKey, reason: impl Into<String>) -> Result<()> {
        self.transition(key, RecordStatus::Failed(reason.into()))?;
        Ok(())
    }

    /// Mark several records failed with the same reason; returns how many changed
    ///
    /// Records already terminal are left alone.
    pub fn mark_all_failed(&mut self, keys: &[RecordKey], reason: &str) -> usize {
        keys.iter()
            .filter(|key| self.mark_failed(key, reason).is_ok())
            .count()
    }

    /// Count a poll cycle that did not resolve a submitted record
    ///
    /// Returns true when this cycle reached `max_attempts` and the record is now
    /// abandoned.
    pub fn record_unresolved_poll(&mut self, key: &RecordKey, max_attempts: u32) -> Result<bool> {
        let record = self.record_mut(key)?;
        if record.status != RecordStatus::Submitted {
            return Err(Error::InvalidTransition {
                key: key.clone(),
                from: record.status.label(),
                to: RecordStatus::Submitted.label(),
            });
        }
        record.poll_attempts = (record.poll_attempts + 1).min(max_attempts.max(1));
        if record.poll_attempts >= max_attempts.max(1) {
            self.transition(key, RecordStatus::Abandoned)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Claim an available record for transfer (Available → Downloading)
    ///
    /// The check and the status change happen under one borrow, so two workers
    /// can never claim the same record.
    pub fn start_download(&mut self, key: &RecordKey) -> Result<ImageRecord> {
        let record = self.transition(key, RecordStatus::Downloading)?;
        Ok(record.clone())
    }

    /// Transfer finished (Downloading → Downloaded)
    pub fn mark_downloaded(&mut self, key: &RecordKey, path: PathBuf) -> Result<()> {
        let record = self.transition(key, RecordStatus::Downloaded)?;
        record.local_path = Some(path);
        Ok(())
    }

    /// User-forced re-download of a downloaded record (Downloaded → Available)
    ///
    /// This is the only edge leaving a terminal status.
    pub fn force_redownload(&mut self, key: &RecordKey) -> Result<()> {
        let record = self.record_mut(key)?;
        if record.status != RecordStatus::Downloaded || record.item_id.is_none() {
            return Err(Error::InvalidTransition {
                key: key.clone(),
                from: record.status.label(),
                to: RecordStatus::Available.label(),
            });
        }
        record.status = RecordStatus::Available;
        record.local_path = None;
        Ok(())
    }

    /// Counts per status plus the failure list
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.records.len(),
            ..Default::default()
        };
        for record in &self.records {
            match &record.status {
                RecordStatus::Found => summary.found += 1,
                RecordStatus::Submitted | RecordStatus::Available | RecordStatus::Downloading => {
                    summary.pending += 1
                }
                RecordStatus::Downloaded => summary.downloaded += 1,
                RecordStatus::Failed(reason) => {
                    summary.failed += 1;
                    summary.failures.push((record.key.clone(), reason.clone()));
                }
                RecordStatus::Abandoned => summary.abandoned += 1,
            }
        }
        summary
    }
}
