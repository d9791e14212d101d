//! The search → order → poll → download pipeline, split into focused submodules:
//! - [`context`] - Shared state handed to every stage
//! - [`orchestration`] - Phase sequencing for each process mode
//! - [`existing`] - Reuse of orders placed in earlier sessions
//! - [`submitter`] - Sequential order submission, one order per batch
//! - [`poller`] - Status polling state machine
//! - [`download`] - Bounded-concurrency download workers

mod context;
mod download;
mod existing;
mod orchestration;
mod poller;
mod submitter;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use download::target_path;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clock::{Sleeper, TokioSleeper};
use crate::config::Config;
use crate::error::Result;
use crate::rapi::ArchiveClient;
use crate::store::RecordStore;
use crate::types::{Event, ProcessMode, RecordKey, RunSummary};
use crate::utils::DateRange;

/// Search scope of a run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchRequest {
    /// Collections to search, in order
    pub collections: Vec<String>,
    /// Attribute filters in RAPI query syntax, applied to every collection
    pub filters: Vec<String>,
    /// Area of interest as WKT
    pub geometry: Option<String>,
    /// Acquisition date range
    pub date_range: Option<DateRange>,
    /// Where the scope came from (AOI file name), for the run metadata
    pub source: Option<String>,
}

/// What a run does
#[derive(Clone, Debug, PartialEq)]
pub enum RunRequest {
    /// Search, order, poll and download
    Full(SearchRequest),
    /// Search and order only
    OrderOnly(SearchRequest),
    /// Order and download explicit records
    RecordIds(Vec<RecordKey>),
    /// Order and download the records of a result set exported from the EODMS
    /// web interface
    OrderCsv(PathBuf),
    /// Resume from a results table written by an earlier run
    DownloadResults(PathBuf),
    /// Download the available items of existing orders
    DownloadAvailable {
        /// How many recent orders to inspect
        max_orders: usize,
    },
}

impl RunRequest {
    /// Process mode recorded in the run metadata
    pub fn mode(&self) -> ProcessMode {
        match self {
            RunRequest::Full(_) => ProcessMode::Full,
            RunRequest::OrderOnly(_) => ProcessMode::OrderOnly,
            RunRequest::RecordIds(_) => ProcessMode::RecordId,
            RunRequest::OrderCsv(_) => ProcessMode::OrderCsv,
            RunRequest::DownloadResults(_) => ProcessMode::DownloadResults,
            RunRequest::DownloadAvailable { .. } => ProcessMode::DownloadAvailable,
        }
    }
}

/// Runs one pipeline per call to [`Pipeline::run`]
///
/// ```no_run
/// use std::sync::Arc;
/// use eodms_dl::{Config, Pipeline, RapiClient, RunRequest, SearchRequest};
///
/// # async fn example() -> eodms_dl::Result<()> {
/// let config = Config::load("eodms.toml")?;
/// let client = Arc::new(RapiClient::new(&config.rapi)?);
/// let pipeline = Pipeline::new(config, client);
///
/// let summary = pipeline
///     .run(RunRequest::Full(SearchRequest {
///         collections: vec!["RCMImageProducts".into()],
///         ..Default::default()
///     }))
///     .await?;
/// println!("{} downloaded", summary.downloaded);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    pub(crate) config: Arc<Config>,
    pub(crate) client: Arc<dyn ArchiveClient>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    pub(crate) cancel: CancellationToken,
}

impl Pipeline {
    /// Create a pipeline using the tokio timer for every wait
    pub fn new(config: Config, client: Arc<dyn ArchiveClient>) -> Self {
        // Buffer sized so a slow subscriber does not miss a whole poll cycle
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
        Self {
            config: Arc::new(config),
            client,
            sleeper: Arc::new(TokioSleeper),
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the sleeper used for poll intervals and retry backoff
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Use an externally owned cancellation token (e.g. one cancelled on Ctrl+C)
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that interrupts the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Configuration the pipeline runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run to completion or cancellation
    ///
    /// # Errors
    /// Only fatal problems are returned: rejected credentials, an unreachable
    /// service at startup, an unreadable results table or export, or a final
    /// results table that cannot be written. Failures of single
    /// records or batches are reported in the summary.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary> {
        let (summary, _store) = self.execute(request).await?;
        Ok(summary)
    }

    /// Run and hand back the final record store as well
    pub async fn execute(&self, request: RunRequest) -> Result<(RunSummary, RecordStore)> {
        orchestration::run(self, request).await
    }
}
