//! Core types for eodms-dl

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Natural key of an image: the collection it belongs to and its record id
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Collection id (e.g. "RCMImageProducts")
    pub collection: String,
    /// Record id, unique within the collection
    pub record_id: String,
}

impl RecordKey {
    /// Create a new RecordKey
    pub fn new(collection: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            record_id: record_id.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.collection, self.record_id)
    }
}

/// Identifier of a remote order
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl OrderId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for OrderId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OrderId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Identifier of one item within a remote order
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Lifecycle status of an image record
///
/// ```text
/// Found -> Submitted -> Available -> Downloading -> Downloaded
///   |          |             |              |
///   +-> Failed +-> Failed    +-> Failed     +-> Failed
///              +-> Abandoned
/// ```
///
/// `Downloaded`, `Failed` and `Abandoned` are terminal. The only way out of a
/// terminal state is [`crate::store::RecordStore::force_redownload`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum RecordStatus {
    /// Returned by a search or input file, not yet ordered
    Found,
    /// Ordered; waiting for the remote service to prepare the item
    Submitted,
    /// Remote reports the item ready for download
    Available,
    /// Transfer in progress
    Downloading,
    /// File written to local storage
    Downloaded,
    /// Permanently failed, with a reason
    Failed(String),
    /// Still pending remotely after the poll attempt limit
    Abandoned,
}

impl RecordStatus {
    /// Stable label used in logs and the results table
    pub fn label(&self) -> &'static str {
        match self {
            RecordStatus::Found => "Found",
            RecordStatus::Submitted => "Submitted",
            RecordStatus::Available => "Available",
            RecordStatus::Downloading => "Downloading",
            RecordStatus::Downloaded => "Downloaded",
            RecordStatus::Failed(_) => "Failed",
            RecordStatus::Abandoned => "Abandoned",
        }
    }

    /// Rebuild a status from its label and an optional failure reason
    pub fn from_label(label: &str, reason: Option<&str>) -> Result<Self> {
        let status = match label.trim() {
            "Found" => RecordStatus::Found,
            "Submitted" => RecordStatus::Submitted,
            "Available" => RecordStatus::Available,
            "Downloading" => RecordStatus::Downloading,
            "Downloaded" => RecordStatus::Downloaded,
            "Failed" => RecordStatus::Failed(reason.unwrap_or_default().to_string()),
            "Abandoned" => RecordStatus::Abandoned,
            other => {
                return Err(Error::InvalidInput(format!("unknown record status '{other}'")));
            }
        };
        Ok(status)
    }

    /// No further transitions happen from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Downloaded | RecordStatus::Failed(_) | RecordStatus::Abandoned
        )
    }

    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: &RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Found, Submitted)
                | (Found, Failed(_))
                | (Submitted, Available)
                | (Submitted, Failed(_))
                | (Submitted, Abandoned)
                | (Available, Downloading)
                | (Available, Failed(_))
                | (Downloading, Downloaded)
                | (Downloading, Failed(_))
        )
    }

    /// Failure reason, if failed
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            RecordStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Failed(reason) => write!(f, "Failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// One discovered image and everything the pipeline learned about it
///
/// Identity and descriptive fields are public. Order linkage, status and
/// download results only change through [`crate::store::RecordStore`].
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRecord {
    /// Collection and record id
    pub key: RecordKey,
    /// Image title, when the search returned one
    pub title: Option<String>,
    /// Footprint as GeoJSON text
    pub geometry: Option<String>,
    /// Remaining search attributes, kept for display and the results table
    pub metadata: BTreeMap<String, String>,
    pub(crate) order_id: Option<OrderId>,
    pub(crate) item_id: Option<ItemId>,
    pub(crate) status: RecordStatus,
    pub(crate) poll_attempts: u32,
    pub(crate) download_url: Option<String>,
    pub(crate) expected_size: Option<u64>,
    pub(crate) local_path: Option<PathBuf>,
}

impl ImageRecord {
    /// Create a freshly found record
    pub fn new(key: RecordKey) -> Self {
        Self {
            key,
            title: None,
            geometry: None,
            metadata: BTreeMap::new(),
            order_id: None,
            item_id: None,
            status: RecordStatus::Found,
            poll_attempts: 0,
            download_url: None,
            expected_size: None,
            local_path: None,
        }
    }

    /// Set the title (builder style)
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Order the record belongs to, once submitted
    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
    }

    /// Order item id, once submitted
    pub fn item_id(&self) -> Option<ItemId> {
        self.item_id
    }

    /// Current status
    pub fn status(&self) -> &RecordStatus {
        &self.status
    }

    /// Number of poll cycles that did not resolve this record
    pub fn poll_attempts(&self) -> u32 {
        self.poll_attempts
    }

    /// Download URL reported by the remote service
    pub fn download_url(&self) -> Option<&str> {
        self.download_url.as_deref()
    }

    /// File size reported by the remote service
    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    /// Local file, once downloaded
    pub fn local_path(&self) -> Option<&std::path::Path> {
        self.local_path.as_deref()
    }

    /// Whether the file has been downloaded
    pub fn is_downloaded(&self) -> bool {
        self.status == RecordStatus::Downloaded
    }
}

/// Order priority passed to the remote service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    /// Low priority
    Low,
    /// Medium priority (service default)
    #[default]
    Medium,
    /// High priority
    High,
    /// Urgent
    Urgent,
}

impl Priority {
    /// Wire value expected by the RAPI
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Urgent => "Urgent",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::InvalidInput(format!("unknown priority '{other}'"))),
        }
    }
}

/// Which pipeline a run executes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Search, order, poll and download
    Full,
    /// Search and order only
    OrderOnly,
    /// Order and download explicit record ids
    RecordId,
    /// Order and download the records of an exported result set
    OrderCsv,
    /// Resume from a previous results table
    DownloadResults,
    /// Download existing orders that are already available
    DownloadAvailable,
}

impl ProcessMode {
    /// Label used in the run metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMode::Full => "full",
            ProcessMode::OrderOnly => "order_only",
            ProcessMode::RecordId => "record_id",
            ProcessMode::OrderCsv => "order_csv",
            ProcessMode::DownloadResults => "download_results",
            ProcessMode::DownloadAvailable => "download_available",
        }
    }
}

/// Pipeline events
///
/// Published on a broadcast channel so front ends can render progress; the
/// library itself only logs.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A collection search finished
    SearchCompleted {
        /// Collection searched
        collection: String,
        /// Number of records found
        found: usize,
    },
    /// Existing orders were reused instead of placing new ones
    ExistingOrdersLinked {
        /// Number of records linked to existing orders
        count: usize,
    },
    /// A batch was accepted by the remote service
    BatchSubmitted {
        /// Zero-based batch index
        batch: usize,
        /// Order id assigned to the batch
        order_id: OrderId,
        /// Records now Submitted
        submitted: usize,
        /// Records rejected individually
        rejected: usize,
    },
    /// A batch could not be submitted; all its records failed
    BatchFailed {
        /// Zero-based batch index
        batch: usize,
        /// Failure reason
        reason: String,
    },
    /// One poll cycle was applied
    PollCycleCompleted {
        /// One-based cycle number
        cycle: u32,
        /// Records still waiting after the cycle
        outstanding: usize,
        /// Records that became available in the cycle
        newly_available: usize,
    },
    /// A record became available for download
    RecordAvailable {
        /// The record
        key: RecordKey,
    },
    /// A record was downloaded
    Downloaded {
        /// The record
        key: RecordKey,
        /// Local file
        path: PathBuf,
    },
    /// A record failed permanently
    RecordFailed {
        /// The record
        key: RecordKey,
        /// Failure reason
        reason: String,
    },
    /// A record exhausted its poll attempts
    RecordAbandoned {
        /// The record
        key: RecordKey,
    },
    /// The results table was written
    ResultsSaved {
        /// Results file
        path: PathBuf,
    },
    /// The run finished (completed or interrupted)
    Finished {
        /// Whether the run was interrupted
        interrupted: bool,
    },
}

/// Final counts for a run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Records in the store
    pub total: usize,
    /// Records never ordered (truncated away or order-only runs)
    pub found: usize,
    /// Records still waiting remotely or locally
    pub pending: usize,
    /// Records downloaded
    pub downloaded: usize,
    /// Records failed
    pub failed: usize,
    /// Records abandoned after the poll attempt limit
    pub abandoned: usize,
    /// Whether the run was interrupted before completion
    pub interrupted: bool,
    /// Results table written by the run
    pub results_file: Option<PathBuf>,
    /// Failed records and their reasons
    pub failures: Vec<(RecordKey, String)>,
}
