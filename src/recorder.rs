//! Results table persistence
//!
//! The whole record store is written as CSV (one row per record) after every
//! phase transition. Each snapshot goes to a temporary file first and is then
//! renamed over the previous one, so an interrupted run always leaves the last
//! complete snapshot behind. A JSON sidecar next to the table carries the run
//! metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::store::RecordStore;
use crate::types::{ImageRecord, ItemId, OrderId, ProcessMode, RecordKey, RecordStatus};

/// Run metadata stored next to the results table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Process mode of the run
    pub process: ProcessMode,
    /// Collections queried
    pub collections: Vec<String>,
    /// AOI file, results file or record ids the run started from
    pub source: Option<String>,
}

impl RunMetadata {
    /// Metadata for a run starting now
    pub fn new(process: ProcessMode) -> Self {
        Self {
            started_at: Utc::now(),
            process,
            collections: Vec::new(),
            source: None,
        }
    }
}

/// One row of the results table
#[derive(Debug, Serialize, Deserialize)]
struct ResultRow {
    collection: String,
    record_id: String,
    title: Option<String>,
    order_id: Option<i64>,
    item_id: Option<i64>,
    status: String,
    downloaded: bool,
    local_path: Option<PathBuf>,
    failure_reason: Option<String>,
    poll_attempts: u32,
    download_url: Option<String>,
    expected_size: Option<u64>,
    geometry: Option<String>,
    metadata: Option<String>,
}

impl ResultRow {
    fn from_record(record: &ImageRecord) -> Result<Self> {
        Ok(Self {
            collection: record.key.collection.clone(),
            record_id: record.key.record_id.clone(),
            title: record.title.clone(),
            order_id: record.order_id.map(|id| id.get()),
            item_id: record.item_id.map(|id| id.get()),
            status: record.status.label().to_string(),
            downloaded: record.is_downloaded(),
            local_path: record.local_path.clone(),
            failure_reason: record.status.failure_reason().map(str::to_string),
            poll_attempts: record.poll_attempts,
            download_url: record.download_url.clone(),
            expected_size: record.expected_size,
            geometry: record.geometry.clone(),
            metadata: if record.metadata.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&record.metadata)?)
            },
        })
    }

    fn into_record(self) -> Result<ImageRecord> {
        let mut status =
            RecordStatus::from_label(&self.status, self.failure_reason.as_deref())?;
        // A transfer cut short by an interruption starts over as Available
        if status == RecordStatus::Downloading {
            status = RecordStatus::Available;
        }

        let metadata: BTreeMap<String, String> = match self.metadata.as_deref() {
            Some(json) if !json.trim().is_empty() => serde_json::from_str(json).map_err(|e| {
                Error::InvalidInput(format!(
                    "record {}:{} has unreadable metadata: {e}",
                    self.collection, self.record_id
                ))
            })?,
            _ => BTreeMap::new(),
        };

        let mut record = ImageRecord::new(RecordKey::new(self.collection, self.record_id));
        record.title = self.title;
        record.geometry = self.geometry;
        record.metadata = metadata;
        record.order_id = self.order_id.map(OrderId);
        record.item_id = self.item_id.map(ItemId);
        record.status = status;
        record.poll_attempts = self.poll_attempts;
        record.download_url = self.download_url;
        record.expected_size = self.expected_size;
        record.local_path = self.local_path;
        Ok(record)
    }
}

/// Writes snapshots of the record store for one run
#[derive(Clone, Debug)]
pub struct ResultRecorder {
    path: PathBuf,
    metadata: RunMetadata,
}

impl ResultRecorder {
    /// Recorder writing `<results_dir>/<YYYYMMDD_HHMMSS>_Results.csv`
    pub fn new(results_dir: &Path, metadata: RunMetadata) -> Self {
        let name = format!("{}_Results.csv", metadata.started_at.format("%Y%m%d_%H%M%S"));
        Self {
            path: results_dir.join(name),
            metadata,
        }
    }

    /// Recorder writing to an explicit file
    pub fn at(path: impl Into<PathBuf>, metadata: RunMetadata) -> Self {
        Self {
            path: path.into(),
            metadata,
        }
    }

    /// Results table path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar path (`..._Results.json`)
    pub fn metadata_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    /// Run metadata
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Replace the results table with a snapshot of `store`
    pub fn save(&self, store: &RecordStore) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = tmp_path(&self.path);
        {
            let mut writer = csv::Writer::from_path(&tmp)?;
            for record in store.iter() {
                writer.serialize(ResultRow::from_record(record)?)?;
            }
            if store.is_empty() {
                writer.write_record(HEADER)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let meta_tmp = tmp_path(&self.metadata_path());
        std::fs::write(&meta_tmp, serde_json::to_vec_pretty(&self.metadata)?)?;
        std::fs::rename(&meta_tmp, self.metadata_path())?;

        tracing::debug!(
            path = %self.path.display(),
            records = store.len(),
            "Results table saved"
        );
        Ok(())
    }

    /// [`ResultRecorder::save`] on the blocking thread pool, for use inside the runtime
    pub async fn write(&self, store: RecordStore) -> Result<()> {
        let recorder = self.clone();
        tokio::task::spawn_blocking(move || recorder.save(&store))
            .await
            .map_err(|e| Error::Other(format!("results writer task failed: {e}")))?
    }
}

const HEADER: [&str; 14] = [
    "collection",
    "record_id",
    "title",
    "order_id",
    "item_id",
    "status",
    "downloaded",
    "local_path",
    "failure_reason",
    "poll_attempts",
    "download_url",
    "expected_size",
    "geometry",
    "metadata",
];

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Load a results table written by an earlier run
///
/// Records that were mid-transfer come back as Available.
///
/// # Errors
/// An unreadable file, a missing column or an unknown status is an error;
/// a resume cannot start from a table it does not fully understand.
pub fn load(path: &Path) -> Result<RecordStore> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut store = RecordStore::new();
    for row in reader.deserialize::<ResultRow>() {
        store.insert(row?.into_record()?);
    }
    tracing::info!(path = %path.display(), records = store.len(), "Results table loaded");
    Ok(store)
}
