//! # eodms-dl
//!
//! Search, order and download satellite imagery from the EODMS REST API (RAPI).
//!
//! A run moves every image record through one state machine:
//!
//! ```text
//! Found → Submitted → Available → Downloading → Downloaded
//!   ↘        ↘  ↘          ↘            ↘
//!  Failed  Failed Abandoned Failed     Failed
//! ```
//!
//! Records are searched (or read from a results table), split into orders of at
//! most 100 images, polled until the archive has prepared them and downloaded
//! with bounded concurrency. The whole record store is written to a CSV results
//! table after every phase, so an interrupted run can be resumed from it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use eodms_dl::{Config, Pipeline, RapiClient, RunRequest, SearchRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.rapi.username = Some("user".to_string());
//!     config.rapi.password = Some("pass".to_string());
//!
//!     let client = Arc::new(RapiClient::new(&config.rapi)?);
//!     let pipeline = Pipeline::new(config, client);
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = pipeline
//!         .run(RunRequest::Full(SearchRequest {
//!             collections: vec!["RCMImageProducts".to_string()],
//!             ..Default::default()
//!         }))
//!         .await?;
//!     println!("{} of {} downloaded", summary.downloaded, summary.total);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Order batching
pub mod batcher;
/// Injectable sleeping for backoff and poll intervals
pub mod clock;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Result sets exported from the EODMS web interface
pub mod export;
/// Console and file logging
pub mod logging;
/// Search → order → poll → download pipeline
pub mod pipeline;
/// Remote archive client
pub mod rapi;
/// Results table persistence
pub mod recorder;
/// Retry logic with exponential backoff
pub mod retry;
/// Record store and status transitions
pub mod store;
/// Core types and events
pub mod types;
/// Input parsing and file naming helpers
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, RunRequest, SearchRequest};
pub use rapi::{ArchiveClient, RapiClient};
pub use recorder::ResultRecorder;
pub use store::RecordStore;
pub use types::{Event, ImageRecord, Priority, ProcessMode, RecordKey, RecordStatus, RunSummary};

use tokio_util::sync::CancellationToken;

/// Cancel `token` when a termination signal arrives.
///
/// The pipeline then stops placing orders and polling, lets in-flight calls
/// finish, writes the results table and returns a summary marked interrupted.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// # async fn example(pipeline: eodms_dl::Pipeline) {
/// tokio::spawn(eodms_dl::cancel_on_signal(pipeline.cancellation_token()));
/// # }
/// ```
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Interrupting run, saving results");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
